//! Backend Loader Module
//!
//! Lazily acquires the process-wide classification backend. Initialization is
//! single-flight: concurrent callers share one load sequence and its outcome.
//! Devices are tried in priority order until one yields a working classifier.

use crate::diagnosis::RawClassification;
use crate::error::ScanError;
use futures::future::BoxFuture;
use futures::FutureExt;
use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, ScanError>;

/// Compute device a model can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// NVIDIA GPU through CUDA
    Cuda,
    /// Apple Neural Engine / GPU through CoreML
    CoreMl,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::CoreMl => "coreml",
            Device::Cpu => "cpu",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "coreml" | "core_ml" => Ok(Device::CoreMl),
            "cpu" => Ok(Device::Cpu),
            other => Err(format!("Unknown device '{}'. Expected: cuda, coreml, cpu", other)),
        }
    }
}

/// A loaded model that can classify staged image bytes
pub trait Classifier: Send + Sync {
    fn classify<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<RawClassification>>;
}

/// Source of classifiers: fetches the model and binds it to a device
pub trait BackendProvider: Send + Sync {
    /// Device-independent setup (weight fetch, labels), run once per load
    /// sequence before any device is tried.
    fn prepare<'a>(&'a self, _model_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn load<'a>(
        &'a self,
        model_id: &'a str,
        device: Device,
    ) -> BoxFuture<'a, Result<Arc<dyn Classifier>>>;
}

/// Classification model bound to a compute device
#[derive(Clone)]
pub struct Backend {
    model_id: String,
    device: Device,
    classifier: Arc<dyn Classifier>,
    loaded_at: chrono::DateTime<chrono::Utc>,
}

impl Backend {
    pub fn new(model_id: impl Into<String>, device: Device, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            classifier,
            loaded_at: chrono::Utc::now(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    pub fn loaded_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.loaded_at
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Single-flight loader for the shared backend
pub struct BackendLoader {
    model_id: String,
    device_priority: Vec<Device>,
    provider: Arc<dyn BackendProvider>,
    /// Keyed by model id; holds at most the one ready backend
    cell: MokaCache<String, Backend>,
    load_sequences: AtomicU64,
}

impl BackendLoader {
    pub fn new(
        model_id: impl Into<String>,
        device_priority: Vec<Device>,
        provider: Arc<dyn BackendProvider>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            device_priority,
            provider,
            cell: MokaCache::builder().initial_capacity(1).build(),
            load_sequences: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device_priority(&self) -> &[Device] {
        &self.device_priority
    }

    /// Return the cached backend, or load it. Concurrent callers during a load
    /// wait on the same attempt and receive its value or its error.
    pub async fn ensure_ready(&self) -> Result<Backend> {
        self.cell
            .try_get_with(self.model_id.clone(), self.load_with_fallback())
            .await
            .map_err(|e| match e.as_ref() {
                ScanError::BackendUnavailable(_) => e.as_ref().clone(),
                other => ScanError::BackendUnavailable(other.to_string()),
            })
    }

    /// Backend if one is already cached; never starts a load
    pub fn cached(&self) -> Option<Backend> {
        self.cell.get(&self.model_id)
    }

    pub fn is_ready(&self) -> bool {
        self.cell.contains_key(&self.model_id)
    }

    /// Drop the cached backend. The next `ensure_ready` starts a fresh
    /// single-flight load.
    pub async fn invalidate(&self) {
        self.cell.invalidate(&self.model_id).await;
        crate::metrics::BACKEND_READY.set(0);
        info!(model = %self.model_id, "Backend invalidated");
    }

    /// Number of load sequences started so far
    pub fn load_sequences(&self) -> u64 {
        self.load_sequences.load(Ordering::SeqCst)
    }

    async fn load_with_fallback(&self) -> Result<Backend> {
        let sequence = self.load_sequences.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::BACKEND_LOADS.inc();
        info!(
            model = %self.model_id,
            sequence = sequence,
            candidates = ?self.device_priority,
            "Initializing classification backend"
        );

        if let Err(e) = self.provider.prepare(&self.model_id).await {
            warn!(model = %self.model_id, error = %e, "Model preparation failed");
            return Err(match e {
                ScanError::BackendUnavailable(_) => e,
                other => ScanError::BackendUnavailable(other.to_string()),
            });
        }

        let mut failures = Vec::with_capacity(self.device_priority.len());

        for device in &self.device_priority {
            debug!(model = %self.model_id, device = %device, "Trying device");

            match self.provider.load(&self.model_id, *device).await {
                Ok(classifier) => {
                    info!(model = %self.model_id, device = %device, "Backend ready");
                    crate::metrics::BACKEND_READY.set(1);
                    return Ok(Backend::new(self.model_id.clone(), *device, classifier));
                }
                Err(e) => {
                    warn!(
                        model = %self.model_id,
                        device = %device,
                        error = %e,
                        "Backend initialization failed on device, trying next candidate"
                    );
                    crate::metrics::BACKEND_DEVICE_FAILURES
                        .with_label_values(&[device.as_str()])
                        .inc();
                    failures.push(format!("{}: {}", device, e));
                }
            }
        }

        let reason = if failures.is_empty() {
            "no devices configured".to_string()
        } else {
            failures.join("; ")
        };
        warn!(model = %self.model_id, reason = %reason, "All backend candidates failed");
        Err(ScanError::BackendUnavailable(reason))
    }
}

impl fmt::Debug for BackendLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLoader")
            .field("model_id", &self.model_id)
            .field("device_priority", &self.device_priority)
            .field("load_sequences", &self.load_sequences())
            .finish()
    }
}
