//! Job progress polling.
//!
//! [`poll_until_terminal`] drives one remote job from submission to a
//! terminal [`JobOutcome`], querying `/progress/{task_id}` on a fixed
//! interval. A failed poll is logged and retried at the next tick; it is
//! never treated as job failure.
//!
//! [`JobPoller::watch`] runs that loop on its own task and returns a
//! [`JobWatch`] handle that can be cancelled. Cancelling only stops local
//! observation; the remote job keeps running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpurelay_core::job::{JobStatus, ProgressReport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::BridgeBackend;

/// Default poll interval for download jobs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Default poll interval for execution jobs.
pub const DEFAULT_EXECUTION_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Polling cadence and optional bound for one watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before each status request.
    pub interval: Duration,
    /// Give up after this many status requests. `None` polls until terminal.
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: None,
        }
    }
}

impl PollConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// `percent >= 100`. `artifacts` come from that final report.
    Completed {
        message: String,
        artifacts: Vec<String>,
    },
    /// `percent == 0` with a failure marker in the message.
    Failed { message: String },
    /// The attempt bound was reached without a terminal report.
    TimedOut {
        attempts: u32,
        last: Option<ProgressReport>,
    },
    /// Observation was cancelled locally.
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Short description suitable for user-facing error text.
    pub fn describe(&self) -> String {
        match self {
            Self::Completed { message, .. } => message.clone(),
            Self::Failed { message } => message.clone(),
            Self::TimedOut { attempts, .. } => {
                format!("no terminal status after {attempts} polls")
            }
            Self::Cancelled => "observation cancelled".to_string(),
        }
    }
}

/// Errors from starting or joining a watch.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// A watch for this job is already running.
    #[error("Job {0} is already being watched")]
    AlreadyWatching(String),

    /// The watch task panicked or was aborted.
    #[error("Watch task for job {job_id} ended abnormally: {reason}")]
    TaskFailed { job_id: String, reason: String },
}

/// Poll `job_id` until it reaches a terminal state, the attempt bound is
/// hit, or `cancel` fires.
///
/// `on_progress` is called once per report that carries a percent, in the
/// order received, including the terminal one. Reports without a percent
/// are skipped.
pub async fn poll_until_terminal<B, F>(
    backend: &B,
    job_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
    on_progress: F,
) -> JobOutcome
where
    B: BridgeBackend + ?Sized,
    F: Fn(&ProgressReport),
{
    let mut attempts = 0u32;
    let mut last: Option<ProgressReport> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return JobOutcome::Cancelled,
            _ = tokio::time::sleep(config.interval) => {}
        }

        attempts += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return JobOutcome::Cancelled,
            result = backend.progress(job_id) => result,
        };

        match result {
            Ok(report) => match report.status() {
                Some(status) => {
                    on_progress(&report);
                    match status {
                        JobStatus::Completed => {
                            tracing::info!(job_id, attempts, "Job completed");
                            return JobOutcome::Completed {
                                message: report.message_or_empty().to_string(),
                                artifacts: report.generated_images.unwrap_or_default(),
                            };
                        }
                        JobStatus::Failed => {
                            tracing::warn!(
                                job_id,
                                message = %report.message_or_empty(),
                                "Job failed",
                            );
                            return JobOutcome::Failed {
                                message: report.message_or_empty().to_string(),
                            };
                        }
                        JobStatus::Pending | JobStatus::Running => {
                            last = Some(report);
                        }
                    }
                }
                None => {
                    tracing::trace!(job_id, "Progress report without percent, skipping");
                }
            },
            Err(e) => {
                tracing::warn!(job_id, attempt = attempts, error = %e, "Progress poll failed");
            }
        }

        if let Some(max) = config.max_attempts {
            if attempts >= max {
                tracing::warn!(job_id, attempts, "Giving up on job without terminal status");
                return JobOutcome::TimedOut { attempts, last };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watches
// ---------------------------------------------------------------------------

/// Set of job ids with a running watch.
type WatchSet = Arc<Mutex<HashSet<String>>>;

/// Removes a job id from the watch set when dropped.
struct WatchRegistration {
    watching: WatchSet,
    job_id: String,
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        if let Ok(mut set) = self.watching.lock() {
            set.remove(&self.job_id);
        }
    }
}

/// Spawns and tracks job watches. At most one watch per job id.
#[derive(Clone)]
pub struct JobPoller {
    backend: Arc<dyn BridgeBackend>,
    watching: WatchSet,
    /// Parent of every watch's token; cancelled on shutdown.
    cancel: CancellationToken,
}

/// Handle to a running watch.
#[derive(Debug)]
pub struct JobWatch {
    job_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<JobOutcome>,
}

impl JobWatch {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stop observing. The remote job is not affected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the watch to end.
    pub async fn outcome(self) -> Result<JobOutcome, PollerError> {
        self.handle.await.map_err(|e| PollerError::TaskFailed {
            job_id: self.job_id,
            reason: e.to_string(),
        })
    }
}

impl JobPoller {
    pub fn new(backend: Arc<dyn BridgeBackend>) -> Self {
        Self {
            backend,
            watching: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Whether a watch for `job_id` is currently running.
    pub fn is_watching(&self, job_id: &str) -> bool {
        self.watching
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    /// Start watching `job_id` on a background task.
    ///
    /// `on_terminal` runs at most once, for completed, failed and timed-out
    /// outcomes. It is not called when the watch is cancelled.
    pub fn watch<P, T>(
        &self,
        job_id: &str,
        config: PollConfig,
        on_progress: P,
        on_terminal: T,
    ) -> Result<JobWatch, PollerError>
    where
        P: Fn(&ProgressReport) + Send + Sync + 'static,
        T: FnOnce(&JobOutcome) + Send + 'static,
    {
        let registration = self.register(job_id)?;
        let backend = Arc::clone(&self.backend);
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let task_job_id = job_id.to_string();

        let handle = tokio::spawn(async move {
            let _registration = registration;
            tracing::debug!(job_id = %task_job_id, interval_ms = config.interval.as_millis() as u64, "Watching job");

            let outcome =
                poll_until_terminal(&*backend, &task_job_id, &config, &task_cancel, on_progress)
                    .await;

            if outcome == JobOutcome::Cancelled {
                tracing::debug!(job_id = %task_job_id, "Watch cancelled");
            } else {
                on_terminal(&outcome);
            }
            outcome
        });

        Ok(JobWatch {
            job_id: job_id.to_string(),
            cancel,
            handle,
        })
    }

    /// Cancel every running watch.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn register(&self, job_id: &str) -> Result<WatchRegistration, PollerError> {
        let mut set = self
            .watching
            .lock()
            .map_err(|_| PollerError::TaskFailed {
                job_id: job_id.to_string(),
                reason: "watch registry poisoned".to_string(),
            })?;
        if !set.insert(job_id.to_string()) {
            return Err(PollerError::AlreadyWatching(job_id.to_string()));
        }
        Ok(WatchRegistration {
            watching: Arc::clone(&self.watching),
            job_id: job_id.to_string(),
        })
    }
}
