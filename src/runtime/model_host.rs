//! Owner of the single loaded translation model.
//!
//! The host keeps at most one [`LoadedModel`] and hands it out to
//! generations through a [`ModelLease`], which carries the one admission
//! permit. Loads are serialized by a loading flag and wait for the running
//! generation before swapping weights. The model is read only once the
//! permit is held, so a lease never outlives a swap.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{AdmissionPolicy, ModelConfig};
use crate::error::{Error, Result};
use crate::runtime::{LoadOptions, ModelLoader, TextGenerator};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Model variants selectable by short hint
const VARIANT_HINTS: &[&str] = &["4b", "12b", "27b"];

/// A model resident in the host
pub struct LoadedModel {
    pub identifier: String,
    pub generator: Arc<dyn TextGenerator>,
    pub quantized: bool,
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("identifier", &self.identifier)
            .field("device", &self.generator.device_kind())
            .field("quantized", &self.quantized)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Snapshot reported by [`ModelHost::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub loaded: bool,
    pub identifier: Option<String>,
    /// GiB of weights on the accelerator; 0 when unknown or on the CPU
    pub memory_usage: f64,
    pub loading: bool,
}

/// Exclusive right to run one generation on the loaded model
pub struct ModelLease {
    model: Arc<LoadedModel>,
    _permit: OwnedSemaphorePermit,
}

impl ModelLease {
    pub fn identifier(&self) -> &str {
        &self.model.identifier
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.model.generator
    }
}

/// Clears the loading flag on every exit path and wakes waiting requests
struct LoadingGuard<'a> {
    flag: &'a watch::Sender<bool>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.flag.send_replace(false);
    }
}

pub struct ModelHost {
    loader: Arc<dyn ModelLoader>,
    config: ModelConfig,
    current: RwLock<Option<Arc<LoadedModel>>>,
    loading: watch::Sender<bool>,
    admission: Arc<Semaphore>,
}

impl ModelHost {
    pub fn new(loader: Arc<dyn ModelLoader>, config: ModelConfig) -> Self {
        Self {
            loader,
            config,
            current: RwLock::new(None),
            loading: watch::Sender::new(false),
            admission: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The loaded model, if any
    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.current.read().clone()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    /// Wait until no load is in flight
    async fn wait_for_load(&self) {
        let mut loading = self.loading.subscribe();
        // The sender lives as long as `self`, so this only ends once the flag clears
        let _ = loading.wait_for(|loading| !*loading).await;
    }

    /// Load `identifier`, replacing the current model.
    ///
    /// Fails with [`Error::ConcurrentLoad`] while another load runs and is a
    /// no-op when `identifier` is already resident. The previous model is
    /// released before the new weights are read; a failed load leaves no
    /// model behind.
    pub async fn load(&self, identifier: &str, quantize: bool) -> Result<Arc<LoadedModel>> {
        let claimed = self.loading.send_if_modified(|loading| {
            if *loading {
                false
            } else {
                *loading = true;
                true
            }
        });
        if !claimed {
            return Err(Error::ConcurrentLoad(identifier.to_string()));
        }
        let _guard = LoadingGuard {
            flag: &self.loading,
        };

        if let Some(current) = self.current() {
            if current.identifier == identifier {
                debug!("Model {} already loaded", identifier);
                return Ok(current);
            }
        }

        // Weights must not be swapped under a running generation.
        let _permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::model_load(identifier, "model host is shutting down"))?;

        if let Some(previous) = self.current.write().take() {
            info!("Releasing model {}", previous.identifier);
        }

        info!("Loading model {} (quantize: {})", identifier, quantize);
        let loader = self.loader.clone();
        let id = identifier.to_string();
        let options = LoadOptions { quantize };
        let generator = match tokio::task::spawn_blocking(move || loader.load(&id, &options)).await {
            Ok(Ok(generator)) => generator,
            Ok(Err(e @ Error::ModelLoad { .. })) => return Err(e),
            Ok(Err(e)) => return Err(Error::model_load(identifier, e)),
            Err(e) => return Err(Error::model_load(identifier, e)),
        };

        let loaded = Arc::new(LoadedModel {
            identifier: identifier.to_string(),
            quantized: generator.quantized(),
            generator,
            loaded_at: Utc::now(),
        });
        *self.current.write() = Some(loaded.clone());
        info!(
            "Model {} loaded on {:?} ({:.2} GiB)",
            identifier,
            loaded.generator.device_kind(),
            self.memory_usage()
        );
        Ok(loaded)
    }

    /// Drop the current model, releasing its weights.
    pub fn unload(&self) -> Option<String> {
        let previous = self.current.write().take();
        previous.map(|model| {
            info!("Unloaded model {}", model.identifier);
            model.identifier.clone()
        })
    }

    pub fn status(&self) -> ModelStatus {
        let current = self.current();
        ModelStatus {
            loaded: current.is_some(),
            identifier: current.as_ref().map(|model| model.identifier.clone()),
            memory_usage: self.memory_usage(),
            loading: self.is_loading(),
        }
    }

    /// Best-effort accelerator memory held by the loaded weights, in GiB.
    pub fn memory_usage(&self) -> f64 {
        self.current()
            .filter(|model| model.generator.device_kind().is_accelerator())
            .and_then(|model| model.generator.memory_footprint())
            .map(|bytes| bytes as f64 / BYTES_PER_GIB)
            .unwrap_or(0.0)
    }

    /// Map a request's model hint to a loadable identifier.
    pub fn resolve_identifier(&self, hint: Option<&str>) -> String {
        let hint = hint.map(str::trim).filter(|hint| !hint.is_empty());
        match hint {
            Some(hint) if hint.contains('/') => hint.to_string(),
            Some(hint) => {
                let variant = hint.to_ascii_lowercase();
                if VARIANT_HINTS.contains(&variant.as_str()) {
                    format!("google/translategemma-{}-it", variant)
                } else {
                    warn!("Unknown model hint '{}', using {}", hint, self.config.default_model);
                    self.config.default_model.clone()
                }
            }
            None => self.config.default_model.clone(),
        }
    }

    /// Take the admission permit for one generation.
    ///
    /// When nothing is loaded the model named by `hint` is loaded first. A
    /// loaded model is used as is; switching models goes through
    /// [`ModelHost::load`]. Under the queue policy a request arriving during
    /// a load waits for it instead of failing with `ConcurrentLoad`.
    pub async fn acquire(&self, hint: Option<&str>) -> Result<ModelLease> {
        let queue = self.config.admission == AdmissionPolicy::Queue;
        loop {
            if queue {
                self.wait_for_load().await;
            }

            if self.current().is_none() {
                let identifier = self.resolve_identifier(hint);
                info!("No model loaded, loading {} on demand", identifier);
                match self.load(&identifier, self.config.quantize).await {
                    Ok(_) => {}
                    Err(Error::ConcurrentLoad(_)) if queue => continue,
                    Err(e) => return Err(e),
                }
            }

            let permit = if queue {
                self.admission
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Generation("model host is shutting down".to_string()))?
            } else {
                self.admission
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| Error::ModelBusy)?
            };

            // A switch may have run, or failed, while waiting for the permit.
            match self.current() {
                Some(model) => {
                    return Ok(ModelLease {
                        model,
                        _permit: permit,
                    })
                }
                None => debug!("Model released while waiting for admission, retrying"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::runtime::ScriptedLoader;
    use std::time::Duration;

    fn host_with(loader: Arc<ScriptedLoader>, admission: AdmissionPolicy) -> ModelHost {
        let config = ModelConfig {
            backend: BackendKind::Scripted,
            admission,
            ..Default::default()
        };
        ModelHost::new(loader, config)
    }

    #[tokio::test]
    async fn test_same_identifier_loads_once() {
        let loader = Arc::new(ScriptedLoader::echo());
        let host = host_with(loader.clone(), AdmissionPolicy::Queue);

        host.load("google/translategemma-4b-it", true).await.unwrap();
        host.load("google/translategemma-4b-it", true).await.unwrap();

        assert_eq!(loader.load_count(), 1);
        assert_eq!(
            host.status().identifier.as_deref(),
            Some("google/translategemma-4b-it")
        );
    }

    #[tokio::test]
    async fn test_concurrent_load_is_rejected_without_mutation() {
        let loader = Arc::new(ScriptedLoader::echo().with_load_delay(Duration::from_millis(200)));
        let host = Arc::new(host_with(loader.clone(), AdmissionPolicy::Queue));

        let first = {
            let host = host.clone();
            tokio::spawn(async move { host.load("first/model", true).await })
        };
        while !host.is_loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = host.load("second/model", true).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentLoad(ref id) if id == "second/model"));

        first.await.unwrap().unwrap();
        assert_eq!(host.status().identifier.as_deref(), Some("first/model"));
        assert_eq!(loader.load_count(), 1);
        assert!(!host.is_loading());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_nothing_loaded() {
        let loader = Arc::new(ScriptedLoader::echo());
        let host = host_with(loader.clone(), AdmissionPolicy::Queue);
        host.load("good/model", true).await.unwrap();

        loader.fail_loads(true);
        let err = host.load("bad/model", true).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad { ref model, .. } if model == "bad/model"));

        let status = host.status();
        assert!(!status.loaded);
        assert!(status.identifier.is_none());
        assert!(!host.is_loading());
    }

    #[tokio::test]
    async fn test_status_without_model() {
        let host = host_with(Arc::new(ScriptedLoader::echo()), AdmissionPolicy::Queue);
        let status = host.status();
        assert!(!status.loaded);
        assert!(status.memory_usage >= 0.0);
        assert_eq!(host.memory_usage(), 0.0);
        assert!(host.unload().is_none());
    }

    #[tokio::test]
    async fn test_reject_policy_reports_busy() {
        let host = host_with(Arc::new(ScriptedLoader::echo()), AdmissionPolicy::Reject);
        let lease = host.acquire(None).await.unwrap();

        let err = host.acquire(None).await.err().unwrap();
        assert!(matches!(err, Error::ModelBusy));

        drop(lease);
        assert!(host.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_loads_hinted_model_on_demand() {
        let loader = Arc::new(ScriptedLoader::echo());
        let host = host_with(loader.clone(), AdmissionPolicy::Queue);

        let lease = host.acquire(Some("12b")).await.unwrap();
        assert_eq!(lease.identifier(), "google/translategemma-12b-it");
        drop(lease);

        // a loaded model is kept regardless of later hints
        let lease = host.acquire(Some("27b")).await.unwrap();
        assert_eq!(lease.identifier(), "google/translategemma-12b-it");
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_queued_request_does_not_keep_released_model_alive() {
        let loader = Arc::new(ScriptedLoader::echo().with_load_delay(Duration::from_millis(100)));
        let host = Arc::new(host_with(loader.clone(), AdmissionPolicy::Queue));
        host.load("old/model", true).await.unwrap();
        let old = Arc::downgrade(&host.current().unwrap());
        let lease = host.acquire(None).await.unwrap();

        let switch = {
            let host = host.clone();
            tokio::spawn(async move { host.load("new/model", true).await })
        };
        while !host.is_loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = {
            let host = host.clone();
            tokio::spawn(async move {
                host.acquire(None)
                    .await
                    .map(|lease| lease.identifier().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        loader.fail_loads(true);
        drop(lease);

        // the old weights are gone before the new ones are read
        while host.current().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(host.is_loading());
        assert!(old.upgrade().is_none());

        assert!(switch.await.unwrap().is_err());
        // no lease on the released model once the switch failed
        let queued = queued.await.unwrap();
        assert!(matches!(queued, Err(Error::ModelLoad { .. })));
        assert!(!host.status().loaded);
    }

    #[tokio::test]
    async fn test_queued_request_waits_for_in_flight_load() {
        let loader = Arc::new(ScriptedLoader::echo().with_load_delay(Duration::from_millis(100)));
        let host = Arc::new(host_with(loader.clone(), AdmissionPolicy::Queue));

        let preload = {
            let host = host.clone();
            tokio::spawn(async move { host.load("google/translategemma-4b-it", true).await })
        };
        while !host.is_loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let lease = host.acquire(Some("4b")).await.unwrap();
        assert_eq!(lease.identifier(), "google/translategemma-4b-it");
        assert_eq!(loader.load_count(), 1);
        drop(lease);
        preload.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reject_policy_fails_during_load() {
        let loader = Arc::new(ScriptedLoader::echo().with_load_delay(Duration::from_millis(100)));
        let host = Arc::new(host_with(loader, AdmissionPolicy::Reject));

        let preload = {
            let host = host.clone();
            tokio::spawn(async move { host.load("google/translategemma-4b-it", true).await })
        };
        while !host.is_loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = host.acquire(None).await.err().unwrap();
        assert!(matches!(err, Error::ConcurrentLoad(_)));
        preload.await.unwrap().unwrap();
    }

    #[test]
    fn test_resolve_identifier() {
        let host = host_with(Arc::new(ScriptedLoader::echo()), AdmissionPolicy::Queue);
        assert_eq!(host.resolve_identifier(Some("4b")), "google/translategemma-4b-it");
        assert_eq!(host.resolve_identifier(Some("27B")), "google/translategemma-27b-it");
        assert_eq!(host.resolve_identifier(Some("org/custom")), "org/custom");
        assert_eq!(host.resolve_identifier(Some("huge")), "google/translategemma-4b-it");
        assert_eq!(host.resolve_identifier(None), "google/translategemma-4b-it");
    }
}
