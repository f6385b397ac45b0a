//! Streaming translation service.
//!
//! A single Gemma translation model is kept resident by the
//! [`runtime::ModelHost`]; requests arrive over a WebSocket, are rendered
//! into prompts by the [`runtime::PromptBuilder`], and generated text is
//! relayed chunk by chunk through a [`runtime::GenerationSession`].

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
