//! Runtime abstraction layer: inference backends, the model host, prompt
//! construction and the streaming generation session.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{BackendKind, GenerationConfig, ModelConfig};
use crate::error::Result;

pub mod candle_engine;
pub mod device;
pub mod model_host;
pub mod prompt;
pub mod scripted;
pub mod streaming;

pub use candle_engine::CandleModelLoader;
pub use device::{AcceleratorInfo, DeviceKind, DevicePlacement, DeviceSelection};
pub use model_host::{LoadedModel, ModelHost, ModelLease, ModelStatus};
pub use prompt::PromptBuilder;
pub use scripted::ScriptedLoader;
pub use streaming::{ChunkStream, GenerationSession, SessionState, StreamEvent};

/// Control flow for generation continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueGeneration {
    /// Continue generating tokens
    Continue,
    /// Stop generation gracefully
    Stop,
}

/// Reason why generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    MaxTokens,
    EndOfSequence,
    Cancelled,
    Timeout,
}

/// Decoding parameters; decoding is always greedy
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
        }
    }
}

/// Cancellable generation context handed to the worker
#[derive(Debug, Clone)]
pub struct GenerationContext {
    /// Cancellation token for stopping generation
    pub cancel_token: CancellationToken,
    /// Maximum time to spend generating
    pub timeout: Duration,
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl GenerationContext {
    /// Checked by backends between decoding steps.
    pub fn interruption(&self, started: Instant) -> Option<FinishReason> {
        if self.cancel_token.is_cancelled() {
            Some(FinishReason::Cancelled)
        } else if started.elapsed() >= self.timeout {
            Some(FinishReason::Timeout)
        } else {
            None
        }
    }
}

/// Generation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
    pub generation_time_ms: u64,
    pub tokens_per_second: f32,
}

impl GenerationResult {
    pub fn new(tokens_generated: usize, finish_reason: FinishReason, started: Instant) -> Self {
        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f32();
        Self {
            tokens_generated,
            finish_reason,
            generation_time_ms: elapsed.as_millis() as u64,
            tokens_per_second: if secs > 0.0 {
                tokens_generated as f32 / secs
            } else {
                0.0
            },
        }
    }
}

/// Options for a single model load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub quantize: bool,
}

/// A loaded model that can turn a prompt into text.
///
/// `generate` is blocking and compute-bound; callers run it on a blocking
/// worker. Each produced chunk is passed to `on_chunk` as soon as it is
/// decoded, in order.
pub trait TextGenerator: Send + Sync {
    /// Identifier the model was loaded from
    fn model_id(&self) -> &str;

    /// Where the weights live
    fn device_kind(&self) -> DeviceKind;

    /// Whether weights were loaded in reduced precision
    fn quantized(&self) -> bool;

    /// Bytes of weights resident on the device, when known
    fn memory_footprint(&self) -> Option<u64>;

    /// Prompt builder configured with this model's chat template
    fn prompt_builder(&self) -> &PromptBuilder;

    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        context: &GenerationContext,
        on_chunk: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<GenerationResult>;
}

/// Acquires weights and tokenizer for a model identifier. Blocking.
pub trait ModelLoader: Send + Sync {
    fn load(&self, identifier: &str, options: &LoadOptions) -> Result<Arc<dyn TextGenerator>>;
}

/// Build the loader selected by configuration
pub fn build_loader(config: &ModelConfig) -> Arc<dyn ModelLoader> {
    match config.backend {
        BackendKind::Candle => Arc::new(CandleModelLoader::from_config(config)),
        BackendKind::Scripted => Arc::new(ScriptedLoader::echo()),
    }
}
