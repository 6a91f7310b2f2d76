//! Test doubles shared by the integration suites

#![allow(dead_code)]

use cropscan_node::{
    BackendLoader, BackendProvider, Classifier, DiagnosisMapper, Device, ImageIntake,
    InferenceExecutor, RawClassification, ScanError, ScanOrchestrator, ScanSessions, Taxonomy,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Classifier that answers from a script. Images starting with one of the
/// `slow` prefixes are held for the configured delay first.
#[derive(Default)]
pub struct ScriptedClassifier {
    predictions: Vec<(String, f32)>,
    fault: Option<String>,
    delay: Duration,
    slow: Vec<(Vec<u8>, Duration)>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn returning(predictions: &[(&str, f32)]) -> Self {
        Self {
            predictions: predictions.iter().map(|(l, s)| (l.to_string(), *s)).collect(),
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fault: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn slow_for(mut self, prefix: &[u8], delay: Duration) -> Self {
        self.slow.push((prefix.to_vec(), delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for ScriptedClassifier {
    fn classify<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<RawClassification, ScanError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let delay = self
                .slow
                .iter()
                .find(|(prefix, _)| image.starts_with(prefix))
                .map(|(_, delay)| *delay)
                .unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match &self.fault {
                Some(message) => Err(ScanError::InferenceExecution(message.clone())),
                None => RawClassification::new(self.predictions.clone()),
            }
        }
        .boxed()
    }
}

/// Provider that hands out one shared classifier on the working devices
pub struct ScriptedProvider {
    classifier: Arc<ScriptedClassifier>,
    working: Vec<Device>,
    load_delay: Duration,
    attempts: Mutex<Vec<Device>>,
}

impl ScriptedProvider {
    pub fn new(classifier: ScriptedClassifier, working: &[Device]) -> Self {
        Self {
            classifier: Arc::new(classifier),
            working: working.to_vec(),
            load_delay: Duration::ZERO,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn attempts(&self) -> Vec<Device> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn classifier(&self) -> &ScriptedClassifier {
        &self.classifier
    }
}

impl BackendProvider for ScriptedProvider {
    fn load<'a>(
        &'a self,
        _model_id: &'a str,
        device: Device,
    ) -> BoxFuture<'a, Result<Arc<dyn Classifier>, ScanError>> {
        async move {
            self.attempts.lock().unwrap().push(device);
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }

            if self.working.contains(&device) {
                Ok(Arc::clone(&self.classifier) as Arc<dyn Classifier>)
            } else {
                Err(ScanError::BackendUnavailable(format!("{} runtime not installed", device)))
            }
        }
        .boxed()
    }
}

pub const DEVICES: &[Device] = &[Device::Cuda, Device::CoreMl, Device::Cpu];

pub fn loader(provider: Arc<ScriptedProvider>) -> Arc<BackendLoader> {
    Arc::new(BackendLoader::new("leafnet", DEVICES.to_vec(), provider))
}

pub fn orchestrator(provider: Arc<ScriptedProvider>, timeout_ms: u64) -> Arc<ScanOrchestrator> {
    Arc::new(ScanOrchestrator::new(
        ImageIntake::default(),
        loader(provider),
        InferenceExecutor::from_millis(timeout_ms),
        DiagnosisMapper::new(Taxonomy::builtin(), 0.5),
    ))
}

pub fn sessions(provider: Arc<ScriptedProvider>, timeout_ms: u64) -> Arc<ScanSessions> {
    Arc::new(ScanSessions::new(
        loader(provider),
        InferenceExecutor::from_millis(timeout_ms),
        DiagnosisMapper::new(Taxonomy::builtin(), 0.5),
        cropscan_node::config::DEFAULT_MAX_IMAGE_BYTES,
    ))
}

/// Small solid-color PNG
pub fn png() -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([34, 139, 34])))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// PNG bytes prefixed with a marker the scripted classifier can match on
pub fn marked(marker: &[u8]) -> Vec<u8> {
    let mut bytes = marker.to_vec();
    bytes.extend(png());
    bytes
}
