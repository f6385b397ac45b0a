//! Deterministic backend that needs no weights.
//!
//! Used to exercise the host, session and WebSocket protocol end to end,
//! and selectable at runtime with `backend = "scripted"`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::runtime::{
    ContinueGeneration, DeviceKind, FinishReason, GenerationContext, GenerationParams,
    GenerationResult, LoadOptions, ModelLoader, PromptBuilder, TextGenerator,
};

/// What the generator produces
#[derive(Debug, Clone)]
enum Script {
    /// The text of the user turn, word by word
    Echo,
    /// Fixed chunks regardless of the prompt
    Chunks(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    None,
    ErrorAfter(usize),
    PanicAfter(usize),
}

pub struct ScriptedLoader {
    script: Script,
    fault: Fault,
    chunk_delay: Duration,
    load_delay: Duration,
    fail_loads: AtomicBool,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn echo() -> Self {
        Self::with_script(Script::Echo)
    }

    pub fn with_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Chunks(chunks.into_iter().map(Into::into).collect()))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            fault: Fault::None,
            chunk_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_loads: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    /// Emit `chunks` chunks, then fail with a generation error
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fault = Fault::ErrorAfter(chunks);
        self
    }

    /// Emit `chunks` chunks, then panic inside the worker
    pub fn panicking_after(mut self, chunks: usize) -> Self {
        self.fault = Fault::PanicAfter(chunks);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make subsequent loads fail
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of loads that ran
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, identifier: &str, options: &LoadOptions) -> Result<Arc<dyn TextGenerator>> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::model_load(identifier, "scripted load failure"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(ScriptedGenerator {
            model_id: identifier.to_string(),
            quantized: options.quantize,
            script: self.script.clone(),
            fault: self.fault,
            chunk_delay: self.chunk_delay,
            prompt_builder: PromptBuilder::default(),
        }))
    }
}

struct ScriptedGenerator {
    model_id: String,
    quantized: bool,
    script: Script,
    fault: Fault,
    chunk_delay: Duration,
    prompt_builder: PromptBuilder,
}

/// Text of the user turn in a prompt rendered by the built-in template
fn user_text(prompt: &str) -> &str {
    let body = prompt.split_once("\n\n\n").map(|(_, rest)| rest).unwrap_or(prompt);
    body.rsplit_once("<end_of_turn>")
        .map(|(text, _)| text)
        .unwrap_or(body)
}

impl ScriptedGenerator {
    fn chunks(&self, prompt: &str) -> Vec<String> {
        match &self.script {
            Script::Echo => user_text(prompt)
                .split_inclusive(char::is_whitespace)
                .map(str::to_string)
                .collect(),
            Script::Chunks(chunks) => chunks.clone(),
        }
    }
}

impl TextGenerator for ScriptedGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn quantized(&self) -> bool {
        self.quantized
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
        params: &GenerationParams,
        context: &GenerationContext,
        on_chunk: &mut dyn FnMut(&str) -> ContinueGeneration,
    ) -> Result<GenerationResult> {
        let started = Instant::now();
        let mut emitted = 0;

        for chunk in self.chunks(prompt) {
            match self.fault {
                Fault::ErrorAfter(n) if emitted == n => {
                    return Err(Error::Generation("scripted failure".to_string()));
                }
                Fault::PanicAfter(n) if emitted == n => panic!("scripted generator panic"),
                _ => {}
            }
            if let Some(reason) = context.interruption(started) {
                return Ok(GenerationResult::new(emitted, reason, started));
            }
            if emitted >= params.max_new_tokens {
                return Ok(GenerationResult::new(emitted, FinishReason::MaxTokens, started));
            }
            if !self.chunk_delay.is_zero() {
                std::thread::sleep(self.chunk_delay);
            }

            emitted += 1;
            if on_chunk(&chunk) == ContinueGeneration::Stop {
                return Ok(GenerationResult::new(emitted, FinishReason::Cancelled, started));
            }
        }

        match self.fault {
            Fault::ErrorAfter(n) if emitted == n => {
                Err(Error::Generation("scripted failure".to_string()))
            }
            Fault::PanicAfter(n) if emitted == n => panic!("scripted generator panic"),
            _ => Ok(GenerationResult::new(emitted, FinishReason::EndOfSequence, started)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::translation::TranslationRequest;

    #[test]
    fn test_echo_reproduces_user_text() {
        let generator = ScriptedLoader::echo()
            .load("scripted", &LoadOptions { quantize: false })
            .unwrap();
        let prompt = generator
            .prompt_builder()
            .build(&TranslationRequest::text("en", "fr", "good morning to you"))
            .unwrap();

        let mut chunks = Vec::new();
        let result = generator
            .generate(&prompt, &GenerationParams::default(), &GenerationContext::default(), &mut |c| {
                chunks.push(c.to_string());
                ContinueGeneration::Continue
            })
            .unwrap();

        assert_eq!(chunks, vec!["good ", "morning ", "to ", "you"]);
        assert_eq!(result.tokens_generated, 4);
        assert_eq!(result.finish_reason, FinishReason::EndOfSequence);
    }

    #[test]
    fn test_max_tokens_caps_output() {
        let generator = ScriptedLoader::with_chunks(["a", "b", "c"])
            .load("scripted", &LoadOptions { quantize: true })
            .unwrap();
        let params = GenerationParams {
            max_new_tokens: 2,
            ..Default::default()
        };

        let mut text = String::new();
        let result = generator
            .generate("", &params, &GenerationContext::default(), &mut |c| {
                text.push_str(c);
                ContinueGeneration::Continue
            })
            .unwrap();

        assert_eq!(text, "ab");
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_failing_loader() {
        let loader = ScriptedLoader::echo();
        loader.fail_loads(true);
        assert!(loader.load("x", &LoadOptions { quantize: true }).is_err());
        assert_eq!(loader.load_count(), 0);
    }
}
