//! Configuration management for the translation service.
//!
//! Configuration is loaded from, in order of increasing precedence:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/translate-stream/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `TRANSLATE_STREAM_`, sections
//!    separated by `__`)
//! 5. Command-line arguments
//!
//! # Environment Variables
//!
//! Model downloads are authenticated with `HF_TOKEN` (or the older
//! `HUGGING_FACE_HUB_TOKEN`); the token is never written to config files.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::Result;
use crate::runtime::device::DeviceSelection;

/// Command-line overrides shared by the commands that host a model
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Model identifier loaded at startup (HuggingFace repo or local directory)
    #[arg(long)]
    pub model: Option<String>,

    /// Load weights at full precision instead of the reduced-precision default
    #[arg(long)]
    pub no_quantize: bool,

    /// Skip the eager model load at startup
    #[arg(long)]
    pub no_preload: bool,

    /// Device selection (auto, cpu, cuda, metal)
    #[arg(long)]
    pub device: Option<DeviceSelection>,

    /// Inference backend (candle, scripted)
    #[arg(long)]
    pub backend: Option<BackendKind>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for plain HTTP requests; WebSocket sessions are exempt
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            cors: CorsConfig::default(),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed origins (`["*"]` allows any origin)
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// Max age for preflight cache (in seconds)
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: default_cors_origins(),
            allow_credentials: false,
            max_age: default_cors_max_age(),
        }
    }
}

/// Which inference backend the model host loads models with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Gemma 3 weights through candle
    #[default]
    Candle,
    /// Deterministic echo backend for exercising the protocol without weights
    Scripted,
}

/// What to do with a generation request while another one holds the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for the running generation to finish
    #[default]
    Queue,
    /// Fail immediately with a busy error
    Reject,
}

/// Model hosting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_model")]
    pub default_model: String,

    /// Load weights in reduced precision on the accelerator
    #[serde(default = "default_true")]
    pub quantize: bool,

    /// Eagerly load `default_model` at startup
    #[serde(default = "default_true")]
    pub preload: bool,

    #[serde(default)]
    pub device: DeviceSelection,

    #[serde(default)]
    pub device_ordinal: usize,

    /// HuggingFace cache directory (hf-hub default when unset)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub admission: AdmissionPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_model: default_model(),
            quantize: true,
            preload: true,
            device: DeviceSelection::default(),
            device_ordinal: 0,
            cache_dir: None,
            admission: AdmissionPolicy::default(),
        }
    }
}

impl ModelConfig {
    /// Token used to authenticate model downloads, read from the environment
    pub fn hf_token(&self) -> Option<String> {
        env::var("HF_TOKEN")
            .or_else(|_| env::var("HUGGING_FACE_HUB_TOKEN"))
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Decoding parameters for every generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Window of recent tokens the repetition penalty looks at; 0 means
    /// the whole context, prompt included
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    /// Capacity of the worker → consumer chunk channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Wall-clock limit for a single generation
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            channel_capacity: default_channel_capacity(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Explicit `EnvFilter` directives; overrides `level`
    #[serde(default)]
    pub filter: Option<String>,

    /// Also write logs to `translate-stream.log` in this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/translate-stream/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TRANSLATE_STREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args);
        Ok(config)
    }

    /// Override loaded values with command-line arguments
    pub fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(model) = &args.model {
            self.model.default_model = model.clone();
        }
        if args.no_quantize {
            self.model.quantize = false;
        }
        if args.no_preload {
            self.model.preload = false;
        }
        if let Some(device) = args.device {
            self.model.device = device;
        }
        if let Some(backend) = args.backend {
            self.model.backend = backend;
        }
    }

    /// Listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8002
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_max_age() -> u64 {
    3600
}

fn default_model() -> String {
    "google/translategemma-4b-it".to_string()
}

fn default_max_new_tokens() -> usize {
    2048
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_repeat_last_n() -> usize {
    0
}

fn default_channel_capacity() -> usize {
    64
}

fn default_generation_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::load(&ConfigArgs::default()).unwrap();
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.model.default_model, "google/translategemma-4b-it");
        assert!(config.model.quantize);
        assert_eq!(config.model.admission, AdmissionPolicy::Queue);
        assert_eq!(config.generation.max_new_tokens, 2048);
        assert!((config.generation.repeat_penalty - 1.1).abs() < f32::EPSILON);
        assert_eq!(config.server.cors.allowed_origins, vec!["*".to_string()]);
    }

    #[test]
    fn test_user_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[model]\nbackend = \"scripted\"\nadmission = \"reject\"\n\n[generation]\nmax_new_tokens = 16"
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = ServiceConfig::load(&args).unwrap();
        assert_eq!(config.model.backend, BackendKind::Scripted);
        assert_eq!(config.model.admission, AdmissionPolicy::Reject);
        assert_eq!(config.generation.max_new_tokens, 16);
        // untouched keys keep their defaults
        assert_eq!(config.generation.repeat_last_n, 0);
    }

    #[test]
    fn test_cli_args_take_precedence() {
        let args = ConfigArgs {
            port: Some(9100),
            model: Some("google/translategemma-12b-it".into()),
            no_quantize: true,
            no_preload: true,
            device: Some(DeviceSelection::Cpu),
            ..Default::default()
        };
        let config = ServiceConfig::load(&args).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9100");
        assert_eq!(config.model.default_model, "google/translategemma-12b-it");
        assert!(!config.model.quantize);
        assert!(!config.model.preload);
        assert_eq!(config.model.device, DeviceSelection::Cpu);
    }
}
