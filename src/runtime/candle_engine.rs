//! Gemma 3 translation backend built on candle.
//!
//! Weights and tokenizer come from the HuggingFace Hub (or a local
//! directory with the same layout). Decoding is greedy with a repetition
//! penalty, and text is emitted as the incremental tokenizer delta so that
//! multi-byte characters are never split across chunks.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::gemma3::{Config as Gemma3Config, Model as Gemma3Model};
use candle_transformers::utils::apply_repeat_penalty;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::runtime::device::{DeviceKind, DevicePlacement, DeviceSelection};
use crate::runtime::{
    ContinueGeneration, FinishReason, GenerationContext, GenerationParams, GenerationResult,
    LoadOptions, ModelLoader, PromptBuilder, TextGenerator,
};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Tokens that end a translation turn
const EOS_TOKENS: &[&str] = &["<eos>", "<end_of_turn>"];

/// Greedy decoding ignores the seed
const SAMPLING_SEED: u64 = 0;

/// Local paths of everything a load needs
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    tokenizer_config: Option<PathBuf>,
    weights: Vec<PathBuf>,
}

/// Loads Gemma 3 checkpoints onto the configured device
pub struct CandleModelLoader {
    device: DeviceSelection,
    device_ordinal: usize,
    cache_dir: Option<PathBuf>,
    token: Option<String>,
}

impl CandleModelLoader {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            device: config.device,
            device_ordinal: config.device_ordinal,
            cache_dir: config.cache_dir.clone(),
            token: config.hf_token(),
        }
    }

    fn fetch(&self, identifier: &str) -> Result<ModelFiles> {
        let local = Path::new(identifier);
        if local.is_dir() {
            debug!("Loading model files from {}", local.display());
            return local_files(local);
        }

        let mut builder = ApiBuilder::new().with_token(self.token.clone());
        if let Some(cache_dir) = &self.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build()?;
        let repo = api.repo(Repo::new(identifier.to_string(), RepoType::Model));

        info!("Fetching {} from the HuggingFace Hub", identifier);
        let config = repo.get(CONFIG_FILE)?;
        let tokenizer = repo.get(TOKENIZER_FILE)?;
        let tokenizer_config = repo.get(TOKENIZER_CONFIG_FILE).ok();

        let weights = match repo.get(WEIGHTS_INDEX_FILE) {
            Ok(index) => shard_names(&index)?
                .iter()
                .map(|shard| repo.get(shard))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Err(_) => vec![repo.get(WEIGHTS_FILE)?],
        };

        Ok(ModelFiles {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

impl ModelLoader for CandleModelLoader {
    fn load(&self, identifier: &str, options: &LoadOptions) -> Result<Arc<dyn TextGenerator>> {
        let files = self
            .fetch(identifier)
            .map_err(|e| Error::model_load(identifier, e))?;
        let placement = DevicePlacement::select(self.device, self.device_ordinal)?;
        let translator = Gemma3Translator::load(identifier, &files, placement, options.quantize)
            .map_err(|e| Error::model_load(identifier, e))?;
        Ok(Arc::new(translator))
    }
}

fn local_files(dir: &Path) -> Result<ModelFiles> {
    let index = dir.join(WEIGHTS_INDEX_FILE);
    let weights = if index.exists() {
        shard_names(&index)?
            .iter()
            .map(|shard| dir.join(shard))
            .collect()
    } else {
        vec![dir.join(WEIGHTS_FILE)]
    };
    let tokenizer_config = dir.join(TOKENIZER_CONFIG_FILE);

    Ok(ModelFiles {
        config: dir.join(CONFIG_FILE),
        tokenizer: dir.join(TOKENIZER_FILE),
        tokenizer_config: tokenizer_config.exists().then_some(tokenizer_config),
        weights,
    })
}

fn read_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Distinct shard file names listed in a safetensors index
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index = read_json(index_path)?;
    let weight_map = index
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Validation(format!("{} has no weight_map", index_path.display())))?;

    let mut shards: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Text model config, accepting both text-only and multimodal layouts
fn parse_config(config: &Value) -> Result<Gemma3Config> {
    let source = config.get("text_config").unwrap_or(config);
    let mut object = source
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Validation("config.json is not an object".to_string()))?;

    let head_dim = object
        .get("head_dim")
        .and_then(Value::as_u64)
        .unwrap_or(256);
    let defaults = [
        ("attention_bias", Value::Bool(false)),
        ("hidden_activation", Value::from("gelu_pytorch_tanh")),
        ("head_dim", Value::from(head_dim)),
        ("rms_norm_eps", Value::from(1e-6f64)),
        ("rope_theta", Value::from(1_000_000f64)),
        ("rope_local_base_freq", Value::from(10_000f64)),
        ("query_pre_attn_scalar", Value::from(head_dim)),
        ("sliding_window", Value::from(1024u64)),
        ("sliding_window_pattern", Value::from(6u64)),
        ("max_position_embeddings", Value::from(131_072u64)),
        ("vocab_size", Value::from(262_208u64)),
    ];
    for (key, value) in defaults {
        object.entry(key.to_string()).or_insert(value);
    }

    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Whether tensor names carry the multimodal `language_model.` prefix
fn weight_prefix(files: &ModelFiles, config: &Value) -> Option<&'static str> {
    let is_conditional = config
        .get("architectures")
        .and_then(Value::as_array)
        .is_some_and(|archs| {
            archs
                .iter()
                .any(|arch| arch.as_str() == Some("Gemma3ForConditionalGeneration"))
        });
    if !is_conditional {
        return None;
    }

    let names = files
        .weights
        .first()
        .map(|path| tensor_names(path))
        .transpose()
        .unwrap_or_else(|e| {
            warn!("Could not read safetensors header: {}", e);
            None
        })
        .unwrap_or_default();

    if names.iter().any(|name| name.starts_with("model.language_model.")) {
        Some("model.language_model")
    } else {
        Some("language_model")
    }
}

const MAX_SAFETENSORS_HEADER: u64 = 100_000_000;

/// Tensor names from a safetensors header, without mapping the data
fn tensor_names(path: &Path) -> Result<Vec<String>> {
    let mut file = fs::File::open(path)?;
    let mut len = [0u8; 8];
    file.read_exact(&mut len)?;
    let header_len = u64::from_le_bytes(len);
    if header_len > MAX_SAFETENSORS_HEADER {
        return Err(Error::Validation(format!(
            "{} has an oversized header ({} bytes)",
            path.display(),
            header_len
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let header: serde_json::Map<String, Value> = serde_json::from_slice(&header)?;
    Ok(header
        .keys()
        .filter(|name| *name != "__metadata__")
        .cloned()
        .collect())
}

/// Tokens the repeat penalty applies to: the last `last_n`, or the whole
/// context (prompt and generated) when `last_n` is 0
fn penalty_window(tokens: &[u32], last_n: usize) -> &[u32] {
    if last_n == 0 {
        return tokens;
    }
    &tokens[tokens.len().saturating_sub(last_n)..]
}

/// Chat template and special tokens from `tokenizer_config.json`
fn template_settings(path: Option<&Path>) -> (Option<String>, Option<String>, Option<String>) {
    let Some(config) = path.and_then(|p| read_json(p).ok()) else {
        return (None, None, None);
    };

    let chat_template = match config.get("chat_template") {
        Some(Value::String(template)) => Some(template.clone()),
        Some(Value::Array(templates)) => templates
            .iter()
            .find(|t| t.get("name").and_then(Value::as_str) == Some("default"))
            .or_else(|| templates.first())
            .and_then(|t| t.get("template"))
            .and_then(Value::as_str)
            .map(String::from),
        _ => None,
    };
    let token = |key: &str| match config.get(key) {
        Some(Value::String(token)) => Some(token.clone()),
        Some(Value::Object(token)) => token.get("content").and_then(Value::as_str).map(String::from),
        _ => None,
    };

    (chat_template, token("bos_token"), token("eos_token"))
}

/// New suffix of `current` relative to what was already emitted
fn text_delta(previous: &str, current: &str) -> String {
    if let Some(delta) = current.strip_prefix(previous) {
        return delta.to_string();
    }
    let common = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();
    current.chars().skip(common).collect()
}

pub struct Gemma3Translator {
    model_id: String,
    placement: DevicePlacement,
    quantized: bool,
    footprint: u64,
    tokenizer: Tokenizer,
    eos_ids: Vec<u32>,
    model: Mutex<Gemma3Model>,
    prompt_builder: PromptBuilder,
}

impl Gemma3Translator {
    fn load(
        identifier: &str,
        files: &ModelFiles,
        placement: DevicePlacement,
        quantize: bool,
    ) -> Result<Self> {
        let started = Instant::now();
        let tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        let eos_ids: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        if eos_ids.is_empty() {
            return Err(Error::Tokenizer("no end-of-sequence token in vocabulary".to_string()));
        }

        let raw_config = read_json(&files.config)?;
        let config = parse_config(&raw_config)?;
        let dtype = placement.weight_dtype(quantize);

        // SAFETY: the weight files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &placement.device)? };
        let vb = match weight_prefix(files, &raw_config) {
            Some("model.language_model") => {
                vb.rename_f(|name: &str| format!("model.language_model.{}", name.trim_start_matches("model.")))
            }
            Some(prefix) => vb.pp(prefix),
            None => vb,
        };
        let model = Gemma3Model::new(false, &config, vb)?;

        let footprint = files
            .weights
            .iter()
            .filter_map(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum::<u64>();
        // On-disk weights are BF16; F32 placement doubles them
        let footprint = if dtype == DType::F32 { footprint * 2 } else { footprint };

        let (chat_template, bos_token, eos_token) =
            template_settings(files.tokenizer_config.as_deref());
        if chat_template.is_none() {
            warn!("{} ships no chat template, using the built-in one", identifier);
        }

        info!(
            "Loaded {} on {} as {:?} in {:.1}s",
            identifier,
            placement.label(),
            dtype,
            started.elapsed().as_secs_f32()
        );

        Ok(Self {
            model_id: identifier.to_string(),
            quantized: dtype != DType::F32,
            placement,
            footprint,
            tokenizer,
            eos_ids,
            model: Mutex::new(model),
            prompt_builder: PromptBuilder::new(chat_template, bos_token, eos_token),
        })
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.tokenizer.decode(ids, true)?)
    }
}

impl TextGenerator for Gemma3Translator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device_kind(&self) -> DeviceKind {
        self.placement.kind
    }

    fn quantized(&self) -> bool {
        self.quantized
    }

    fn memory_footprint(&self) -> Option<u64> {
        Some(self.footprint)
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
        // The rendered prompt already carries <bos>
        let encoding = self.tokenizer.encode(prompt, false)?;
        let prompt_ids = encoding.get_ids().to_vec();
        if prompt_ids.is_empty() {
            return Err(Error::Generation("prompt produced no tokens".to_string()));
        }
        debug!("Prompt is {} tokens", prompt_ids.len());

        let device = &self.placement.device;
        let mut model = self.model.lock();
        model.clear_kv_cache();

        let mut logits_processor = LogitsProcessor::from_sampling(SAMPLING_SEED, Sampling::ArgMax);
        let mut tokens = prompt_ids.clone();
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = String::new();
        let mut input = Tensor::new(prompt_ids.as_slice(), device)?.unsqueeze(0)?;
        let mut offset = 0;
        let mut finish_reason = FinishReason::MaxTokens;

        for _ in 0..params.max_new_tokens {
            if let Some(reason) = context.interruption(started) {
                finish_reason = reason;
                break;
            }

            let seq_len = input.dim(1)?;
            let logits = model.forward(&input, offset)?;
            offset += seq_len;
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    penalty_window(&tokens, params.repeat_last_n),
                )?
            };

            let next = logits_processor.sample(&logits)?;
            if self.eos_ids.contains(&next) {
                finish_reason = FinishReason::EndOfSequence;
                break;
            }
            tokens.push(next);
            generated.push(next);

            // Hold back partial UTF-8 sequences until the next token completes them
            let decoded = self.decode(&generated)?;
            if !decoded.ends_with('\u{FFFD}') {
                let delta = text_delta(&emitted, &decoded);
                emitted = decoded;
                if !delta.is_empty() && on_chunk(&delta) == ContinueGeneration::Stop {
                    finish_reason = FinishReason::Cancelled;
                    break;
                }
            }

            input = Tensor::new(&[next], device)?.unsqueeze(0)?;
        }

        if finish_reason != FinishReason::Cancelled {
            let decoded = self.decode(&generated)?;
            let delta = text_delta(&emitted, &decoded);
            if !delta.is_empty() {
                on_chunk(&delta);
            }
        }

        Ok(GenerationResult::new(generated.len(), finish_reason, started))
    }
}
