//! Relay events and the in-process broadcast hub.
//!
//! Every state change the outside world may care about (progress bars,
//! "new artifacts available", cleanup retries) is published as a
//! [`RelayEvent`]. Subscribers that fall behind observe
//! `RecvError::Lagged` and skip ahead.

use gpurelay_core::artifact::ArtifactState;
use gpurelay_core::model_asset::ModelAsset;
use gpurelay_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// A relay-level event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// The backend accepted an execution.
    ExecutionStarted {
        job_id: String,
        /// Class confirmed by the backend.
        gpu_type: String,
    },

    /// One progress report for an execution, in receive order.
    ExecutionProgress {
        job_id: String,
        percent: i32,
        message: String,
    },

    /// The execution finished remotely.
    ExecutionCompleted { job_id: String, artifacts: Vec<String> },

    /// The execution failed, timed out, or could not be observed further.
    ExecutionFailed { job_id: String, error: String },

    /// New artifacts are available locally, scoped to one job.
    ArtifactsReady { job_id: String, filenames: Vec<String> },

    /// One artifact finished its reconciliation cycle (or was abandoned).
    ArtifactReconciled {
        job_id: String,
        filename: String,
        state: ArtifactState,
        error: Option<String>,
    },

    /// Download progress for a model asset.
    ModelDownloadProgress {
        asset: ModelAsset,
        job_id: String,
        percent: i32,
    },

    /// A model asset is present remotely.
    ModelAvailable {
        asset: ModelAsset,
        /// `false` when it already existed before this request.
        newly_downloaded: bool,
    },

    /// A model download failed; the user may retry.
    ModelDownloadFailed { asset: ModelAsset, error: String },

    /// The GPU selection changed.
    SelectionChanged { gpu_type: String, count: u32 },

    /// The sweeper retried a failed remote cleanup.
    CleanupRetried { filename: String, cleaned: bool },
}

/// An event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Stamped {
    pub event: RelayEvent,
    pub timestamp: Timestamp,
}

/// In-process fan-out hub for [`RelayEvent`]s.
pub struct EventHub {
    sender: broadcast::Sender<Stamped>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.sender.send(Stamped {
            event,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Stamped> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
