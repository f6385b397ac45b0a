//! Common test utilities for the translation service

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use translate_stream_core::config::{BackendKind, ServiceConfig};
use translate_stream_core::runtime::{
    ContinueGeneration, DeviceKind, FinishReason, GenerationContext, GenerationParams,
    GenerationResult, LoadOptions, ModelLoader, PromptBuilder, TextGenerator,
};
use translate_stream_core::server::state::ServerState;
use translate_stream_core::Result;

/// Loader whose generators emit fixed chunks and remember every prompt
pub struct RecordingLoader {
    chunks: Vec<String>,
    load_delay: Duration,
    prompts: Arc<Mutex<Vec<String>>>,
    loads: Arc<Mutex<Vec<String>>>,
}

impl RecordingLoader {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            load_delay: Duration::ZERO,
            prompts: Arc::default(),
            loads: Arc::default(),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().clone()
    }
}

impl ModelLoader for RecordingLoader {
    fn load(&self, identifier: &str, _options: &LoadOptions) -> Result<Arc<dyn TextGenerator>> {
        std::thread::sleep(self.load_delay);
        self.loads.lock().push(identifier.to_string());
        Ok(Arc::new(RecordingGenerator {
            model_id: identifier.to_string(),
            chunks: self.chunks.clone(),
            prompts: self.prompts.clone(),
            prompt_builder: PromptBuilder::default(),
        }))
    }
}

struct RecordingGenerator {
    model_id: String,
    chunks: Vec<String>,
    prompts: Arc<Mutex<Vec<String>>>,
    prompt_builder: PromptBuilder,
}

impl TextGenerator for RecordingGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn quantized(&self) -> bool {
        false
    }

    fn memory_footprint(&self) -> Option<u64> {
        None
    }

    fn prompt_builder(&self) -> &PromptBuilder {
        &self.prompt_builder
    }

    fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        _context: &GenerationContext,
        on_chunk: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<GenerationResult> {
        let started = Instant::now();
        self.prompts.lock().push(prompt.to_string());
        for chunk in &self.chunks {
            if on_chunk(chunk) == ContinueGeneration::Stop {
                return Ok(GenerationResult::new(0, FinishReason::Cancelled, started));
            }
        }
        Ok(GenerationResult::new(
            self.chunks.len(),
            FinishReason::EndOfSequence,
            started,
        ))
    }
}

/// Configuration for tests: scripted backend, no preload
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.model.backend = BackendKind::Scripted;
    config.model.preload = false;
    config
}

pub fn test_state(loader: Arc<RecordingLoader>) -> ServerState {
    ServerState::with_loader(test_config(), loader)
}
