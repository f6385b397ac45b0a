//! Wire types of the HTTP and WebSocket API

pub mod status;
pub mod translation;

pub use status::{HealthResponse, LanguagesResponse, ModelStatusBody, StatusResponse};
pub use translation::{
    ModelSwitchRequest, ModelSwitchResponse, ServerMessage, TranslateResponse,
    TranslationRequest,
};
