pub mod api;
pub mod backend;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod inference;
pub mod intake;
pub mod metrics;
pub mod onnx;
pub mod orchestrator;
pub mod retry;
pub mod sessions;
pub mod taxonomy;

// Re-export commonly used types for easier testing
pub use crate::backend::{Backend, BackendLoader, BackendProvider, Classifier, Device};
pub use crate::config::{Config, ModelConfig, ScanConfig};
pub use crate::diagnosis::{DiagnosisMapper, DiagnosisRecord, RawClassification};
pub use crate::error::ScanError;
pub use crate::inference::InferenceExecutor;
pub use crate::intake::{ImageIntake, UploadedImage};
pub use crate::onnx::OnnxBackendProvider;
pub use crate::orchestrator::{ScanOrchestrator, ScanSnapshot, ScanState, SubmitOutcome};
pub use crate::sessions::ScanSessions;
pub use crate::taxonomy::{Severity, Taxonomy, TaxonomyEntry};
