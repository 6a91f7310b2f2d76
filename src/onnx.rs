//! ONNX Runtime backend
//!
//! Production [`BackendProvider`]: makes sure the model weights are present
//! (fetching them when a URL is configured), binds an ONNX Runtime session to
//! the requested device and runs image classification on the blocking pool.

use crate::backend::{BackendProvider, Classifier, Device};
use crate::config::ModelConfig;
use crate::diagnosis::RawClassification;
use crate::error::ScanError;
use crate::retry::{RetryExecutor, RetryStrategy};
use futures::future::BoxFuture;
use futures::FutureExt;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::value::Tensor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, ScanError>;

/// Largest weights file accepted from a fetch (512MB)
pub const MAX_MODEL_BYTES: u64 = 512 * 1024 * 1024;

/// ImageNet channel statistics used by the stock classification backbones
const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct OnnxBackendProvider {
    model_dir: PathBuf,
    model_url: Option<String>,
    model_sha256: Option<String>,
    input_size: u32,
    fetch_retry: RetryStrategy,
    http: reqwest::Client,
    /// Labels read by the latest `prepare`, per model
    prepared_labels: Mutex<HashMap<String, Option<Arc<Vec<String>>>>>,
}

impl OnnxBackendProvider {
    pub fn new(model_dir: impl Into<PathBuf>, input_size: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            model_dir: model_dir.into(),
            model_url: None,
            model_sha256: None,
            input_size,
            fetch_retry: RetryStrategy::exponential(3, 500),
            http,
            prepared_labels: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        let mut provider = Self::new(&config.model_dir, config.input_size)
            .with_fetch_retry(RetryStrategy::exponential(config.fetch_attempts, 500));
        if let Some(url) = &config.model_url {
            provider = provider.with_model_url(url.clone(), config.model_sha256.clone());
        }
        provider
    }

    pub fn with_model_url(mut self, url: String, sha256: Option<String>) -> Self {
        self.model_url = Some(url);
        self.model_sha256 = sha256.map(|s| s.to_lowercase());
        self
    }

    pub fn with_fetch_retry(mut self, strategy: RetryStrategy) -> Self {
        self.fetch_retry = strategy;
        self
    }

    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(format!("{}.onnx", model_id))
    }

    pub fn labels_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(format!("{}.labels.txt", model_id))
    }

    /// Make sure the weights exist locally, downloading them if needed
    pub async fn ensure_weights(&self, model_id: &str) -> Result<PathBuf> {
        let path = self.model_path(model_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(model = %model_id, path = %path.display(), "Model weights already present");
            return Ok(path);
        }

        let url = self.model_url.as_deref().ok_or_else(|| {
            ScanError::BackendUnavailable(format!(
                "model {} not found at {} and no MODEL_URL configured",
                model_id,
                path.display()
            ))
        })?;

        info!(model = %model_id, url = %url, "Fetching model weights");
        let size = RetryExecutor::new(self.fetch_retry.clone())
            .execute(|| self.download(url, &path))
            .await?;
        info!(model = %model_id, size = size, path = %path.display(), "Model weights stored");

        Ok(path)
    }

    async fn download(&self, url: &str, path: &Path) -> Result<u64> {
        use tokio::io::AsyncWriteExt;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::ModelFetch(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ScanError::ModelFetch(format!("HTTP error: {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ScanError::ModelFetch(format!("failed to read response: {}", e)))?;
        let size = bytes.len() as u64;

        if size > MAX_MODEL_BYTES {
            return Err(ScanError::BackendUnavailable(format!(
                "downloaded model too large: {} bytes",
                size
            )));
        }

        if let Some(expected) = &self.model_sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if &actual != expected {
                return Err(ScanError::BackendUnavailable(format!(
                    "model checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanError::ModelFetch(format!("failed to create model dir: {}", e)))?;
        }

        // Write to a sibling file first so a torn download never looks complete
        let partial = path.with_extension("onnx.part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| ScanError::ModelFetch(format!("failed to create file: {}", e)))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| ScanError::ModelFetch(format!("failed to write weights: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ScanError::ModelFetch(format!("failed to flush weights: {}", e)))?;
        drop(file);

        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| ScanError::ModelFetch(format!("failed to move weights into place: {}", e)))?;

        crate::metrics::MODEL_FETCHES.inc();
        Ok(size)
    }

    /// Class labels, one per line. `None` when the model ships without a
    /// label file; outputs are then named `class_<index>`.
    pub async fn load_labels(&self, model_id: &str) -> Result<Option<Vec<String>>> {
        let path = self.labels_path(model_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let labels: Vec<String> = contents
                    .lines()
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_string())
                    .collect();
                debug!(model = %model_id, count = labels.len(), "Loaded class labels");
                Ok(Some(labels))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(model = %model_id, path = %path.display(), "No label file, using class indices");
                Ok(None)
            }
            Err(e) => Err(ScanError::BackendUnavailable(format!(
                "failed to read labels {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl BackendProvider for OnnxBackendProvider {
    fn prepare<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.ensure_weights(model_id).await?;
            let labels = self.load_labels(model_id).await?.map(Arc::new);
            self.prepared_labels
                .lock()
                .map_err(|_| ScanError::InternalError("label cache lock poisoned".to_string()))?
                .insert(model_id.to_string(), labels);
            Ok(())
        }
        .boxed()
    }

    fn load<'a>(
        &'a self,
        model_id: &'a str,
        device: Device,
    ) -> BoxFuture<'a, Result<Arc<dyn Classifier>>> {
        async move {
            // Weights are fetched once in `prepare`; a device attempt only binds a session
            let path = self.model_path(model_id);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ScanError::BackendUnavailable(format!(
                    "model weights missing at {}",
                    path.display()
                )));
            }
            let prepared = self
                .prepared_labels
                .lock()
                .map_err(|_| ScanError::InternalError("label cache lock poisoned".to_string()))?
                .get(model_id)
                .cloned();
            let labels = match prepared {
                Some(labels) => labels,
                None => self.load_labels(model_id).await?.map(Arc::new),
            };

            let session = tokio::task::spawn_blocking(move || build_session(&path, device))
                .await
                .map_err(|e| ScanError::BackendUnavailable(format!("session task failed: {}", e)))??;

            info!(model = %model_id, device = %device, "ONNX session created");

            Ok(Arc::new(OnnxClassifier {
                session: Arc::new(Mutex::new(session)),
                labels,
                input_size: self.input_size,
            }) as Arc<dyn Classifier>)
        }
        .boxed()
    }
}

fn execution_provider(device: Device) -> ExecutionProviderDispatch {
    // Fail registration loudly so the loader can move on to the next device
    match device {
        Device::Cuda => CUDAExecutionProvider::default().build().error_on_failure(),
        Device::CoreMl => CoreMLExecutionProvider::default().build().error_on_failure(),
        Device::Cpu => CPUExecutionProvider::default().build().error_on_failure(),
    }
}

fn build_session(path: &Path, device: Device) -> Result<Session> {
    let unavailable = |stage: &str, e: String| {
        ScanError::BackendUnavailable(format!("{} on {}: {}", stage, device, e))
    };

    let builder = Session::builder().map_err(|e| unavailable("session builder", e.to_string()))?;
    let builder = builder
        .with_execution_providers([execution_provider(device)])
        .map_err(|e| unavailable("execution provider", e.to_string()))?;
    builder
        .commit_from_file(path)
        .map_err(|e| unavailable("model load", e.to_string()))
}

/// ONNX classifier bound to one session
pub struct OnnxClassifier {
    session: Arc<Mutex<Session>>,
    labels: Option<Arc<Vec<String>>>,
    input_size: u32,
}

impl Classifier for OnnxClassifier {
    fn classify<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<RawClassification>> {
        let session = Arc::clone(&self.session);
        let labels = self.labels.clone();
        let input_size = self.input_size;
        let bytes = image.to_vec();

        async move {
            tokio::task::spawn_blocking(move || {
                run_session(&session, labels.as_deref().map(|l| l.as_slice()), &bytes, input_size)
            })
            .await
            .map_err(|e| ScanError::InferenceExecution(format!("inference task failed: {}", e)))?
        }
        .boxed()
    }
}

fn run_session(
    session: &Mutex<Session>,
    labels: Option<&[String]>,
    bytes: &[u8],
    input_size: u32,
) -> Result<RawClassification> {
    let input = preprocess(bytes, input_size)?;
    let tensor = Tensor::from_array(input)
        .map_err(|e| ScanError::InferenceExecution(format!("failed to create tensor: {}", e)))?;

    let logits: Vec<f32> = {
        let mut session = session
            .lock()
            .map_err(|_| ScanError::InferenceExecution("session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| ScanError::InferenceExecution(format!("inference failed: {}", e)))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| ScanError::InferenceExecution(format!("unexpected output: {}", e)))?;
        output.iter().copied().collect()
    };

    let scores = normalize_scores(&logits);
    match labels {
        Some(labels) => RawClassification::from_scores(labels, &scores),
        None => {
            let generated: Vec<String> = (0..scores.len()).map(|i| format!("class_{}", i)).collect();
            RawClassification::from_scores(&generated, &scores)
        }
    }
}

/// Decode, resize and normalize an image into an NCHW tensor
pub fn preprocess(bytes: &[u8], input_size: u32) -> Result<Array4<f32>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ScanError::InferenceExecution(format!("failed to decode image: {}", e)))?;
    let rgb = decoded
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();

    let side = input_size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            input[[0, c, y as usize, x as usize]] = (value - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
        }
    }
    Ok(input)
}

/// Pass probabilities through unchanged; softmax anything else (logits)
pub fn normalize_scores(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }

    let is_distribution = values.iter().all(|v| (0.0..=1.0).contains(v))
        && (values.iter().sum::<f32>() - 1.0).abs() < 1e-3;
    if is_distribution {
        return values.to_vec();
    }

    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| (e / sum).clamp(0.0, 1.0)).collect()
}
