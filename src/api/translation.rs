//! Translation request and response types shared by the WebSocket and
//! REST surfaces.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::GenerationResult;

/// The only content type the service translates
pub const TEXT_CONTENT_TYPE: &str = "text";

/// Inbound translation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    /// Content type; only `text` is translated
    #[serde(rename = "type", default = "default_content_type")]
    pub content_type: String,

    #[serde(default = "default_source_lang")]
    pub source_lang: String,

    #[serde(default = "default_target_lang")]
    pub target_lang: String,

    #[serde(default)]
    pub content: Option<String>,

    /// Base64 image payload; accepted on the wire, never translated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,

    /// Model variant hint (`4b`, `12b`, `27b` or a full identifier)
    #[serde(default = "default_model_hint")]
    pub model: String,
}

impl TranslationRequest {
    /// A text request with default model hint
    pub fn text(source_lang: &str, target_lang: &str, content: &str) -> Self {
        Self {
            content_type: TEXT_CONTENT_TYPE.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            content: Some(content.to_string()),
            image_data: None,
            model: default_model_hint(),
        }
    }

    /// Parse and validate one inbound frame.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| Error::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::InvalidJson("expected a JSON object".to_string()));
        }
        let request: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("Invalid request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    /// Type is checked first so non-text requests report as unsupported
    /// even when they carry no text.
    pub fn validate(&self) -> Result<()> {
        if self.content_type != TEXT_CONTENT_TYPE {
            return Err(Error::UnsupportedContentType(self.content_type.clone()));
        }
        if self.text_content().trim().is_empty() {
            return Err(Error::Validation("content is required".to_string()));
        }
        if self.source_lang.trim().is_empty() || self.target_lang.trim().is_empty() {
            return Err(Error::Validation(
                "source_lang and target_lang must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn text_content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

fn default_content_type() -> String {
    TEXT_CONTENT_TYPE.to_string()
}

fn default_source_lang() -> String {
    "en".to_string()
}

fn default_target_lang() -> String {
    "zh-TW".to_string()
}

fn default_model_hint() -> String {
    "4b".to_string()
}

/// One outbound WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Chunk {
        chunk: String,
    },
    Done {
        done: bool,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    pub fn chunk(text: impl Into<String>) -> Self {
        ServerMessage::Chunk { chunk: text.into() }
    }

    pub fn done() -> Self {
        ServerMessage::Done { done: true }
    }

    pub fn error(err: &Error) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            details: Some(err.details()),
        }
    }

    /// Whether this frame ends the current request
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerMessage::Chunk { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response of the non-streaming `POST /api/translate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub translation: String,
    pub model_used: String,
    /// Seconds
    pub time_taken: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationResult>,
}

/// Body of `POST /api/model/switch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSwitchRequest {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSwitchResponse {
    pub status: String,
    pub model: String,
}
