//! Per-client scan sessions
//!
//! Each client gets its own orchestrator, so one client's submission never
//! supersedes another's. All of them share the single backend loader.

use crate::backend::BackendLoader;
use crate::diagnosis::DiagnosisMapper;
use crate::inference::InferenceExecutor;
use crate::intake::ImageIntake;
use crate::orchestrator::ScanOrchestrator;
use moka::future::Cache as MokaCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Header carrying the client's session id
pub const SESSION_HEADER: &str = "x-scan-session";
/// Session used by clients that don't name one
pub const DEFAULT_SESSION: &str = "default";

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_SESSIONS: u64 = 10_000;
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Session ids are 1..=128 characters of `[A-Za-z0-9_-]`
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub struct ScanSessions {
    loader: Arc<BackendLoader>,
    executor: InferenceExecutor,
    mapper: DiagnosisMapper,
    max_image_bytes: usize,
    /// Idle sessions expire; a handler holding one keeps it alive
    sessions: MokaCache<String, Arc<ScanOrchestrator>>,
}

impl ScanSessions {
    pub fn new(
        loader: Arc<BackendLoader>,
        executor: InferenceExecutor,
        mapper: DiagnosisMapper,
        max_image_bytes: usize,
    ) -> Self {
        Self {
            loader,
            executor,
            mapper,
            max_image_bytes,
            sessions: MokaCache::builder()
                .max_capacity(MAX_SESSIONS)
                .time_to_idle(SESSION_IDLE_TIMEOUT)
                .build(),
        }
    }

    /// The client's orchestrator, created on first use
    pub async fn session(&self, id: &str) -> Arc<ScanOrchestrator> {
        self.sessions
            .get_with(id.to_string(), async {
                debug!(session = %id, "Opening scan session");
                Arc::new(ScanOrchestrator::new(
                    ImageIntake::new(self.max_image_bytes),
                    Arc::clone(&self.loader),
                    self.executor.clone(),
                    self.mapper.clone(),
                ))
            })
            .await
    }

    pub fn loader(&self) -> &Arc<BackendLoader> {
        &self.loader
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }
}
