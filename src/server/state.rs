//! Server state management

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::runtime::{build_loader, AcceleratorInfo, GenerationSession, ModelHost, ModelLoader};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    /// The single resident model
    pub model_host: Arc<ModelHost>,

    /// Decoding settings applied to every translation
    pub session: GenerationSession,

    /// Accelerator metadata, probed once at startup
    pub accelerator: Arc<AcceleratorInfo>,

    pub config: Arc<ServiceConfig>,

    pub metrics: Arc<Metrics>,
}

impl ServerState {
    /// State backed by the loader selected in configuration
    pub fn new(config: ServiceConfig) -> Self {
        let loader = build_loader(&config.model);
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: ServiceConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let accelerator = AcceleratorInfo::probe();
        if accelerator.available {
            info!(
                "Accelerator available: {} ({} device(s))",
                accelerator.device_name.as_deref().unwrap_or("unknown"),
                accelerator.device_count
            );
        } else {
            info!("No accelerator available, inference runs on the CPU");
        }

        Self {
            model_host: Arc::new(ModelHost::new(loader, config.model.clone())),
            session: GenerationSession::new(&config.generation),
            accelerator: Arc::new(accelerator),
            config: Arc::new(config),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Load the default model in the background. Failures are logged and
    /// the server keeps serving; the next request retries the load.
    pub fn preload(&self) -> Option<JoinHandle<()>> {
        if !self.config.model.preload {
            return None;
        }
        let host = self.model_host.clone();
        let identifier = self.config.model.default_model.clone();
        let quantize = self.config.model.quantize;

        Some(tokio::spawn(async move {
            info!("Pre-loading default model {}", identifier);
            match host.load(&identifier, quantize).await {
                Ok(_) => info!("Pre-loading of {} complete", identifier),
                Err(e) => warn!("Failed to pre-load {}: {}", identifier, e),
            }
        }))
    }
}

/// Request counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Translations started
    pub total_requests: AtomicU64,

    /// Translations that ended in an error
    pub failed_requests: AtomicU64,

    /// Chunks forwarded to clients
    pub total_chunks: AtomicU64,

    /// Tokens reported by finished generations
    pub total_tokens: AtomicU64,

    /// Translations in flight
    pub active_requests: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_chunks: u64,
    pub total_tokens: u64,
    pub active_requests: u32,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one in-flight translation; decrements on drop
pub(crate) struct MetricsGuard<'a> {
    metrics: &'a Metrics,
}

impl<'a> MetricsGuard<'a> {
    pub(crate) fn new(metrics: &'a Metrics) -> Self {
        metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics.active_requests.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }

    pub(crate) fn record_chunk(&self) {
        self.metrics.total_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tokens(&self, tokens: usize) {
        self.metrics.total_tokens.fetch_add(tokens as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for MetricsGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
