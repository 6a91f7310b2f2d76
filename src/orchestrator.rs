//! Scan Orchestrator Module
//!
//! Sequences intake, backend acquisition, inference and mapping for each
//! submission. Every submission gets a monotonically increasing sequence
//! number; only the newest session may publish, and infrastructure faults
//! degrade to a fallback record instead of failing the scan.

use crate::backend::BackendLoader;
use crate::diagnosis::{DiagnosisMapper, DiagnosisRecord};
use crate::error::ScanError;
use crate::inference::InferenceExecutor;
use crate::intake::{ImageIntake, UploadedImage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

/// Scan lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    /// Waiting for the shared backend
    Loading,
    /// Inference in flight
    Scanning,
    Completed,
    /// Input was rejected
    Failed,
}

impl ScanState {
    pub fn can_transition_to(&self, next: ScanState) -> bool {
        use ScanState::*;
        matches!(
            (self, next),
            (Idle, Loading)
                | (Idle, Failed)
                | (Loading, Scanning)
                | (Loading, Completed)
                | (Scanning, Completed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed)
    }
}

/// Observable orchestrator state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSnapshot {
    pub sequence: u64,
    pub state: ScanState,
    pub result: Option<DiagnosisRecord>,
    pub error: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ScanSnapshot {
    fn idle(sequence: u64) -> Self {
        Self {
            sequence,
            state: ScanState::Idle,
            result: None,
            error: None,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// One submission's progress through the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSession {
    sequence: u64,
    state: ScanState,
}

impl ScanSession {
    fn new(sequence: u64) -> Self {
        Self {
            sequence,
            state: ScanState::Idle,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> ScanState {
        self.state
    }
}

/// What the submitting caller observes
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Exactly one record, possibly degraded
    Completed { sequence: u64, record: DiagnosisRecord },
    /// Input failed validation; the scan ended in `Failed`
    Rejected { sequence: u64, error: ScanError },
    /// A newer submission (or a reset) took over; nothing was published
    Superseded { sequence: u64, latest: u64 },
}

impl SubmitOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            SubmitOutcome::Completed { sequence, .. }
            | SubmitOutcome::Rejected { sequence, .. }
            | SubmitOutcome::Superseded { sequence, .. } => *sequence,
        }
    }

    pub fn record(&self) -> Option<&DiagnosisRecord> {
        match self {
            SubmitOutcome::Completed { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, SubmitOutcome::Superseded { .. })
    }
}

enum Publish {
    Published,
    Stale,
    Illegal,
}

/// State shared between the orchestrator handle and its running sessions
struct Pipeline {
    intake: ImageIntake,
    loader: Arc<BackendLoader>,
    executor: InferenceExecutor,
    mapper: DiagnosisMapper,
    sequence: AtomicU64,
    snapshots: watch::Sender<ScanSnapshot>,
}

pub struct ScanOrchestrator {
    pipeline: Arc<Pipeline>,
}

impl ScanOrchestrator {
    pub fn new(
        intake: ImageIntake,
        loader: Arc<BackendLoader>,
        executor: InferenceExecutor,
        mapper: DiagnosisMapper,
    ) -> Self {
        let (snapshots, _) = watch::channel(ScanSnapshot::idle(0));
        Self {
            pipeline: Arc::new(Pipeline {
                intake,
                loader,
                executor,
                mapper,
                sequence: AtomicU64::new(0),
                snapshots,
            }),
        }
    }

    pub fn intake(&self) -> &ImageIntake {
        &self.pipeline.intake
    }

    pub fn loader(&self) -> &Arc<BackendLoader> {
        &self.pipeline.loader
    }

    /// Newest sequence number handed out
    pub fn latest_sequence(&self) -> u64 {
        self.pipeline.sequence.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ScanSnapshot {
        self.pipeline.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanSnapshot> {
        self.pipeline.snapshots.subscribe()
    }

    /// Stream of snapshots, starting with the current one
    pub fn updates(&self) -> WatchStream<ScanSnapshot> {
        WatchStream::new(self.pipeline.snapshots.subscribe())
    }

    /// Supersede any in-flight session and go back to `Idle`
    pub fn reset(&self) {
        let pipeline = &self.pipeline;
        pipeline.snapshots.send_modify(|current| {
            let sequence = pipeline.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            *current = ScanSnapshot::idle(sequence);
        });
        info!(sequence = self.latest_sequence(), "Scan state reset");
    }

    /// Run one scan end to end. Infrastructure faults produce a degraded
    /// record; only invalid input is reported as a rejection.
    ///
    /// The session runs on its own task: dropping the returned future stops
    /// waiting for the outcome but the session still reaches a terminal state.
    pub async fn submit(&self, bytes: Vec<u8>, mime_type: &str) -> SubmitOutcome {
        let session = ScanSession::new(self.pipeline.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let sequence = session.sequence;
        crate::metrics::SCANS_SUBMITTED.inc();
        info!(
            sequence = sequence,
            mime = %mime_type,
            size = bytes.len(),
            "Scan submitted"
        );

        let pipeline = Arc::clone(&self.pipeline);
        let mime_type = mime_type.to_string();
        let task = tokio::spawn(async move { pipeline.run(session, bytes, &mime_type).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(sequence = sequence, error = %e, "Scan task aborted");
                self.pipeline.abandon(sequence)
            }
        }
    }
}

impl Pipeline {
    async fn run(&self, mut session: ScanSession, bytes: Vec<u8>, mime_type: &str) -> SubmitOutcome {
        let mut image = match self.intake.acquire(bytes, mime_type) {
            Ok(image) => image,
            Err(error) => {
                crate::metrics::SCANS_REJECTED.inc();
                info!(sequence = session.sequence, error = %error, "Scan input rejected");
                self.publish(&mut session, ScanState::Failed, None, Some(error.to_string()));
                return SubmitOutcome::Rejected {
                    sequence: session.sequence,
                    error,
                };
            }
        };

        if !matches!(self.publish(&mut session, ScanState::Loading, None, None), Publish::Published) {
            return self.supersede(session, image);
        }

        let record = match self.loader.ensure_ready().await {
            Err(error) => self.degrade(&session, &error),
            Ok(backend) => {
                // Don't start inference for a session nobody will observe
                if self.is_stale(session.sequence) {
                    return self.supersede(session, image);
                }
                if !matches!(self.publish(&mut session, ScanState::Scanning, None, None), Publish::Published) {
                    return self.supersede(session, image);
                }

                match self.executor.classify(&backend, &image).await {
                    Ok(raw) => self.mapper.map(&raw),
                    Err(error) => self.degrade(&session, &error),
                }
            }
        };

        self.intake.release(&mut image);

        match self.publish(&mut session, ScanState::Completed, Some(record.clone()), None) {
            Publish::Published => {
                crate::metrics::SCANS_COMPLETED.inc();
                info!(
                    sequence = session.sequence,
                    disease = %record.disease_name,
                    confidence = record.confidence,
                    degraded = record.degraded,
                    "Scan completed"
                );
                SubmitOutcome::Completed {
                    sequence: session.sequence,
                    record,
                }
            }
            Publish::Stale | Publish::Illegal => self.supersede(session, image),
        }
    }

    fn is_stale(&self, sequence: u64) -> bool {
        sequence != self.sequence.load(Ordering::SeqCst)
    }

    /// Compare-and-publish: the staleness check and the state change happen
    /// under the channel's write lock.
    fn publish(
        &self,
        session: &mut ScanSession,
        next: ScanState,
        result: Option<DiagnosisRecord>,
        error: Option<String>,
    ) -> Publish {
        let mut outcome = Publish::Stale;

        self.snapshots.send_if_modified(|current| {
            if self.is_stale(session.sequence) || current.sequence > session.sequence {
                return false;
            }

            if !session.state.can_transition_to(next) {
                warn!(
                    sequence = session.sequence,
                    from = ?session.state,
                    to = ?next,
                    "Ignoring illegal scan state transition"
                );
                outcome = Publish::Illegal;
                return false;
            }

            debug!(sequence = session.sequence, from = ?session.state, to = ?next, "Scan state transition");
            session.state = next;
            *current = ScanSnapshot {
                sequence: session.sequence,
                state: next,
                result: result.clone(),
                error: error.clone(),
                updated_at: chrono::Utc::now(),
            };
            outcome = Publish::Published;
            true
        });

        outcome
    }

    /// Close out a session whose task died before reaching a terminal state.
    /// Its image handle was released when the task's state was dropped.
    fn abandon(&self, sequence: u64) -> SubmitOutcome {
        let record = self.mapper.degraded();
        let published = self.snapshots.send_if_modified(|current| {
            if self.is_stale(sequence) || current.sequence != sequence || current.state.is_terminal() {
                return false;
            }
            *current = ScanSnapshot {
                sequence,
                state: ScanState::Completed,
                result: Some(record.clone()),
                error: None,
                updated_at: chrono::Utc::now(),
            };
            true
        });

        if published {
            crate::metrics::SCANS_DEGRADED
                .with_label_values(&["aborted"])
                .inc();
            warn!(sequence = sequence, "Scan degraded after its task was aborted");
            SubmitOutcome::Completed { sequence, record }
        } else {
            SubmitOutcome::Superseded {
                sequence,
                latest: self.sequence.load(Ordering::SeqCst),
            }
        }
    }

    fn degrade(&self, session: &ScanSession, error: &ScanError) -> DiagnosisRecord {
        crate::metrics::SCANS_DEGRADED
            .with_label_values(&[error.kind()])
            .inc();
        warn!(
            sequence = session.sequence,
            kind = error.kind(),
            error = %error,
            "Scan degraded to fallback diagnosis"
        );
        self.mapper.degraded()
    }

    fn supersede(&self, session: ScanSession, mut image: UploadedImage) -> SubmitOutcome {
        self.intake.release(&mut image);
        crate::metrics::SCANS_STALE_DISCARDED.inc();

        let latest = self.sequence.load(Ordering::SeqCst);
        debug!(
            sequence = session.sequence,
            latest = latest,
            state = ?session.state,
            "Discarding stale scan"
        );
        SubmitOutcome::Superseded {
            sequence: session.sequence,
            latest,
        }
    }
}
