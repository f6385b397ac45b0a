//! Status and discovery responses.

use serde::{Deserialize, Serialize};

use crate::runtime::prompt::{Language, LANGUAGES};
use crate::runtime::{AcceleratorInfo, ModelStatus};
use crate::server::state::MetricsSnapshot;

/// Model section of `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusBody {
    /// `loaded` or `not_loaded`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// GiB held on the accelerator
    pub vram_usage: f64,
    #[serde(default)]
    pub loading: bool,
}

impl From<ModelStatus> for ModelStatusBody {
    fn from(status: ModelStatus) -> Self {
        Self {
            status: if status.loaded { "loaded" } else { "not_loaded" }.to_string(),
            model: status.identifier,
            vram_usage: status.memory_usage,
            loading: status.loading,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub gpu: AcceleratorInfo,
    pub model: ModelStatusBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguagesResponse {
    pub languages: &'static [Language],
}

impl Default for LanguagesResponse {
    fn default() -> Self {
        Self {
            languages: LANGUAGES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
    pub metrics: MetricsSnapshot,
}

impl HealthResponse {
    pub fn healthy(metrics: MetricsSnapshot) -> Self {
        Self {
            status: "healthy".to_string(),
            message: "Translate Gemma API is running".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metrics,
        }
    }
}
