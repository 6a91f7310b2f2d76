use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Inference timed out after {timeout_ms}ms")]
    InferenceTimeout { timeout_ms: u64 },

    #[error("Inference execution failed: {0}")]
    InferenceExecution(String),

    #[error("Model fetch failed: {0}")]
    ModelFetch(String),

    #[error("Taxonomy error: {0}")]
    Taxonomy(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ScanError {
    /// Faults the orchestrator absorbs into a degraded diagnosis.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ScanError::BackendUnavailable(_)
                | ScanError::InferenceTimeout { .. }
                | ScanError::InferenceExecution(_)
                | ScanError::ModelFetch(_)
        )
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::ModelFetch(_) | ScanError::InferenceTimeout { .. }
        )
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::InvalidInput(_) => "invalid_input",
            ScanError::BackendUnavailable(_) => "backend_unavailable",
            ScanError::InferenceTimeout { .. } => "inference_timeout",
            ScanError::InferenceExecution(_) => "inference_error",
            ScanError::ModelFetch(_) => "model_fetch",
            ScanError::Taxonomy(_) => "taxonomy",
            ScanError::ConfigError(_) => "config",
            ScanError::InternalError(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::InternalError(err.to_string())
    }
}
