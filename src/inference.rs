use crate::backend::Backend;
use crate::diagnosis::RawClassification;
use crate::error::ScanError;
use crate::intake::UploadedImage;
use crate::metrics::Timer;
use std::time::Duration;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, ScanError>;

/// Runs classification under a per-call timeout. Never retries; the caller
/// owns the degradation policy.
#[derive(Debug, Clone)]
pub struct InferenceExecutor {
    timeout: Duration,
}

impl InferenceExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_millis(timeout_ms: u64) -> Self {
        Self::new(Duration::from_millis(timeout_ms))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify with the configured timeout
    pub async fn classify(&self, backend: &Backend, image: &UploadedImage) -> Result<RawClassification> {
        self.classify_with_timeout(backend, image, self.timeout).await
    }

    /// Classify, giving up once `timeout` elapses. An abandoned call keeps
    /// running on the backend but its result is dropped.
    pub async fn classify_with_timeout(
        &self,
        backend: &Backend,
        image: &UploadedImage,
        timeout: Duration,
    ) -> Result<RawClassification> {
        let bytes = image.bytes().ok_or_else(|| {
            ScanError::InferenceExecution(format!("image {} was already released", image.id()))
        })?;

        let timer = Timer::new();
        let timeout_ms = timeout.as_millis() as u64;

        match tokio::time::timeout(timeout, backend.classifier().classify(bytes)).await {
            Ok(Ok(raw)) => {
                timer.observe_duration_seconds(&crate::metrics::INFERENCE_LATENCY);
                debug!(
                    image_id = %image.id(),
                    device = %backend.device(),
                    latency_ms = timer.elapsed_ms(),
                    top = ?raw.top(),
                    "Classification finished"
                );
                Ok(raw)
            }
            Ok(Err(e)) => {
                crate::metrics::INFERENCE_FAILURES.inc();
                warn!(image_id = %image.id(), device = %backend.device(), error = %e, "Classifier reported a fault");
                Err(match e {
                    ScanError::InferenceExecution(_) => e,
                    other => ScanError::InferenceExecution(other.to_string()),
                })
            }
            Err(_) => {
                crate::metrics::INFERENCE_TIMEOUTS.inc();
                warn!(
                    image_id = %image.id(),
                    device = %backend.device(),
                    timeout_ms = timeout_ms,
                    "Classification timed out"
                );
                Err(ScanError::InferenceTimeout { timeout_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Classifier, Device};
    use crate::intake::ImageIntake;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Arc;

    struct SlowClassifier {
        delay: Duration,
    }

    impl Classifier for SlowClassifier {
        fn classify<'a>(&'a self, _image: &'a [u8]) -> BoxFuture<'a, Result<RawClassification>> {
            async move {
                tokio::time::sleep(self.delay).await;
                RawClassification::new(vec![("early_blight".to_string(), 0.85)])
            }
            .boxed()
        }
    }

    struct FaultyClassifier;

    impl Classifier for FaultyClassifier {
        fn classify<'a>(&'a self, _image: &'a [u8]) -> BoxFuture<'a, Result<RawClassification>> {
            async { Err(ScanError::InternalError("tensor shape mismatch".to_string())) }.boxed()
        }
    }

    fn backend(classifier: impl Classifier + 'static) -> Backend {
        Backend::new("model", Device::Cpu, Arc::new(classifier))
    }

    #[tokio::test]
    async fn test_returns_classification() {
        let intake = ImageIntake::default();
        let image = intake.acquire(vec![1, 2, 3], "image/png").unwrap();
        let executor = InferenceExecutor::from_millis(500);

        let raw = executor
            .classify(&backend(SlowClassifier { delay: Duration::from_millis(1) }), &image)
            .await
            .unwrap();
        assert_eq!(raw.top(), Some(("early_blight", 0.85)));
    }

    #[tokio::test]
    async fn test_times_out() {
        let intake = ImageIntake::default();
        let image = intake.acquire(vec![1, 2, 3], "image/png").unwrap();
        let executor = InferenceExecutor::from_millis(20);

        let err = executor
            .classify(&backend(SlowClassifier { delay: Duration::from_secs(5) }), &image)
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::InferenceTimeout { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn test_fault_becomes_execution_error() {
        let intake = ImageIntake::default();
        let image = intake.acquire(vec![1], "image/png").unwrap();
        let executor = InferenceExecutor::from_millis(500);

        let err = executor.classify(&backend(FaultyClassifier), &image).await.unwrap_err();
        assert!(matches!(err, ScanError::InferenceExecution(msg) if msg.contains("tensor shape mismatch")));
    }

    #[tokio::test]
    async fn test_released_image_is_execution_error() {
        let intake = ImageIntake::default();
        let mut image = intake.acquire(vec![1], "image/png").unwrap();
        intake.release(&mut image);

        let err = InferenceExecutor::from_millis(500)
            .classify(&backend(FaultyClassifier), &image)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InferenceExecution(_)));
    }
}
