//! Error types for the translation service.

use std::result;
use thiserror::Error;

/// A specialized Result type for translation service operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for translation service operations.
///
/// Request-level variants are reported to the caller and leave the
/// connection open; only [`Error::Transport`] tears a connection down.
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound frame was not a JSON request object
    #[error("Invalid JSON")]
    InvalidJson(String),

    /// Malformed or semantically invalid request
    #[error("{0}")]
    Validation(String),

    /// Request asked for a content type other than text
    #[error("Only text supported, got '{0}'")]
    UnsupportedContentType(String),

    /// A model load was requested while another one is running
    #[error("Model is currently loading: {0}")]
    ConcurrentLoad(String),

    /// Single-admission policy rejected a generation
    #[error("Model is busy with another generation")]
    ModelBusy,

    /// Fetching or constructing a model failed
    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    /// Any failure inside the generation worker
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Unexpected failure in the connection loop itself
    #[error("Transport fault: {0}")]
    Transport(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor backend errors
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Chat template errors
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// HuggingFace Hub errors
    #[error("Hub error: {0}")]
    Hub(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable snake_case code, sent as `details.kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidJson(_) => "invalid_json",
            Error::Validation(_) => "validation_error",
            Error::UnsupportedContentType(_) => "unsupported_content_type",
            Error::ConcurrentLoad(_) => "concurrent_load",
            Error::ModelBusy => "model_busy",
            Error::ModelLoad { .. } => "model_load_error",
            Error::Generation(_) => "generation_error",
            Error::Transport(_) => "transport_fault",
            Error::Config(_) => "config_error",
            Error::Candle(_) => "tensor_error",
            Error::Tokenizer(_) => "tokenizer_error",
            Error::Template(_) => "template_error",
            Error::Hub(_) => "hub_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the error belongs to a single request and leaves the
    /// connection usable.
    pub fn is_request_level(&self) -> bool {
        !matches!(self, Error::Transport(_))
    }

    /// Extra context sent next to the message on the wire
    pub fn details(&self) -> serde_json::Value {
        match self {
            Error::InvalidJson(reason) => serde_json::json!({ "kind": self.kind(), "reason": reason }),
            _ => serde_json::json!({ "kind": self.kind() }),
        }
    }

    pub(crate) fn model_load(model: impl Into<String>, reason: impl ToString) -> Self {
        Error::ModelLoad {
            model: model.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokenizers::Error> for Error {
    fn from(err: tokenizers::Error) -> Self {
        Error::Tokenizer(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        Error::Hub(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Error::Generation("worker panicked".to_string())
        } else {
            Error::Generation("worker cancelled".to_string())
        }
    }
}
