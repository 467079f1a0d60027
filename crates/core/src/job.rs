//! Remote job model and status inference.
//!
//! The bridge backend never reports an explicit job state. Every poll of
//! `/progress/{task_id}` returns a percent/message pair and the state is
//! inferred from it:
//!
//! - `percent >= 100` is terminal success,
//! - `percent == 0` with a message containing [`FAILURE_MARKER`] is
//!   terminal failure,
//! - anything else is still in flight.
//!
//! Percent values are surfaced as reported; the client does not enforce
//! monotonicity.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Substring that marks a zero-percent report as a failure.
pub const FAILURE_MARKER: &str = "Error";

/// Percent at which a job is considered finished.
pub const PERCENT_COMPLETE: i32 = 100;

/// Response `status` value for a successfully spawned remote job.
pub const SUBMIT_STATUS_STARTED: &str = "started";

/// Response `status` value from `/download_model` when the file is already present.
pub const SUBMIT_STATUS_ALREADY_EXISTS: &str = "already_exists";

// ---------------------------------------------------------------------------
// Kind / status
// ---------------------------------------------------------------------------

/// What a remote job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A model file download into remote storage.
    Download,
    /// A workflow execution on a rented GPU.
    Execution,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Execution => "execution",
        }
    }
}

/// Client-side view of a remote job's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further progress observation is meaningful.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Infer a job status from a reported percent/message pair.
pub fn infer_status(percent: i32, message: &str) -> JobStatus {
    if percent >= PERCENT_COMPLETE {
        JobStatus::Completed
    } else if percent == 0 && message.contains(FAILURE_MARKER) {
        JobStatus::Failed
    } else if percent <= 0 {
        JobStatus::Pending
    } else {
        JobStatus::Running
    }
}

// ---------------------------------------------------------------------------
// Progress report
// ---------------------------------------------------------------------------

/// One status report as returned by `/progress/{task_id}`.
///
/// `percent` is optional on the wire; a report without it carries no
/// state information and is skipped by the poller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    #[serde(default)]
    pub percent: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    /// Artifacts produced by this job. Only meaningful once complete.
    #[serde(default)]
    pub generated_images: Option<Vec<String>>,
    /// Backend-side exception text, present on bridge errors.
    #[serde(default)]
    pub error: Option<String>,
}

impl ProgressReport {
    pub fn new(percent: i32, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            message: Some(message.into()),
            generated_images: None,
            error: None,
        }
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generated_images = Some(images.into_iter().map(Into::into).collect());
        self
    }

    pub fn message_or_empty(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Status implied by this report, or `None` when it carries no percent.
    pub fn status(&self) -> Option<JobStatus> {
        self.percent
            .map(|percent| infer_status(percent, self.message_or_empty()))
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Client-side record of one remote job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub percent: i32,
    pub message: String,
    /// Filled only from the completing report; scoped to this job.
    pub result_artifacts: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn new(id: impl Into<JobId>, kind: JobKind) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            kind,
            status: JobStatus::Pending,
            percent: 0,
            message: String::new(),
            result_artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a progress report into the record and return the resulting status.
    ///
    /// Reports arriving after a terminal state, or without a percent, leave
    /// the record untouched.
    pub fn apply(&mut self, report: &ProgressReport) -> JobStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        let Some(status) = report.status() else {
            return self.status;
        };

        self.percent = report.percent.unwrap_or(self.percent);
        self.message = report.message_or_empty().to_string();
        self.status = status;
        self.updated_at = chrono::Utc::now();

        if status == JobStatus::Completed {
            self.result_artifacts = report.generated_images.clone().unwrap_or_default();
        }
        status
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
