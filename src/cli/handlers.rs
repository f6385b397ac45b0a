use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::api::TranslationRequest;
use crate::cli::commands::TranslateCommand;
use crate::config::{LoggingConfig, ServiceConfig};
use crate::runtime::{
    build_loader, AcceleratorInfo, DevicePlacement, GenerationSession, ModelHost, StreamEvent,
};
use crate::server::{start_server, state::ServerState};

/// Install the global subscriber. The returned guard flushes the log file
/// and must live as long as the process logs.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let directives = config.filter.as_deref().unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .context("Invalid log filter")?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "translate-stream.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

pub async fn handle_server(config: ServiceConfig) -> Result<()> {
    tracing::warn!("This is a pre-release alpha for preview purposes only.");
    let state = ServerState::new(config);
    start_server(state).await
}

/// Translate one text with a locally loaded model, printing chunks as they
/// are produced.
pub async fn handle_translate(config: ServiceConfig, cmd: TranslateCommand) -> Result<()> {
    let text = match cmd.text {
        Some(text) => text,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read text from stdin")?;
            text
        }
    };
    let request = TranslationRequest::text(&cmd.source, &cmd.target, text.trim());
    request.validate()?;

    let host = ModelHost::new(build_loader(&config.model), config.model.clone());
    host.load(&config.model.default_model, config.model.quantize)
        .await
        .context("Failed to load model")?;

    let lease = host.acquire(None).await?;
    let prompt = lease.generator().prompt_builder().build(&request)?;
    let mut stream = GenerationSession::new(&config.generation).start(lease, prompt);

    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                stdout.write_all(chunk.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::Done(result) => {
                writeln!(stdout)?;
                info!(
                    "{} tokens in {}ms ({:.1} tok/s, {:?})",
                    result.tokens_generated,
                    result.generation_time_ms,
                    result.tokens_per_second,
                    result.finish_reason
                );
            }
            StreamEvent::Failed(e) => return Err(e).context("Translation failed"),
        }
    }

    host.unload();
    Ok(())
}

/// Report accelerator details and exercise the configured device.
/// Returns whether an accelerator is usable.
pub fn handle_device(config: &ServiceConfig) -> Result<bool> {
    let info = AcceleratorInfo::probe();
    println!("Accelerator available: {}", info.available);
    println!("Device count: {}", info.device_count);
    if let Some(name) = &info.device_name {
        println!("Device name: {}", name);
    }

    let placement = DevicePlacement::select(config.model.device, config.model.device_ordinal)
        .context("Failed to open the configured device")?;
    let values = placement
        .smoke_test()
        .with_context(|| format!("Tensor test failed on {}", placement.label()))?;
    println!("Tensor test on {}: {:?}", placement.label(), values);

    if !info.available {
        println!("No accelerator found, inference will run on the CPU");
    }
    Ok(info.available)
}

pub fn handle_config(config: &ServiceConfig) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    println!("{}", rendered);
    if config.model.hf_token().is_some() {
        println!("(HuggingFace token found in the environment)");
    }
    Ok(())
}

/// Fail fast on settings that cannot work
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    if config.generation.max_new_tokens == 0 {
        bail!("generation.max_new_tokens must be at least 1");
    }
    if config.generation.repeat_penalty <= 0.0 {
        bail!("generation.repeat_penalty must be positive");
    }
    if config.model.default_model.trim().is_empty() {
        bail!("model.default_model must not be empty");
    }
    Ok(())
}
