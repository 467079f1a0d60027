//! Artifact registration state machine and the local registration workflow.
//!
//! An artifact produced remotely travels through
//! `not_started -> downloaded -> injected_locally -> cleaned_up`, or ends in
//! `cleanup_failed` when the final remote deletion does not succeed. States
//! are never skipped and never rolled back.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Registration workflow constants
// ---------------------------------------------------------------------------

/// Host node class that loads a file from the local output directory.
pub const LOADER_NODE_CLASS: &str = "LoadLocalImageModal";

/// Host node class that persists an image as a regular output.
pub const SAVE_NODE_CLASS: &str = "SaveImage";

/// Filename prefix applied by the save node to re-registered artifacts.
pub const REGISTERED_PREFIX: &str = "modal_registered_";

/// Node id of the loader in the registration workflow.
const LOADER_NODE_ID: &str = "0";

/// Node id of the saver in the registration workflow.
const SAVE_NODE_ID: &str = "1";

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Where an artifact is in its reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    NotStarted,
    /// Copied into the bridge's temporary storage.
    Downloaded,
    /// A local registration job was submitted for it.
    InjectedLocally,
    /// The remote temporary copy was deleted.
    CleanedUp,
    /// Registered locally, but the remote temporary copy could not be deleted.
    CleanupFailed,
}

impl ArtifactState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Downloaded => "downloaded",
            Self::InjectedLocally => "injected_locally",
            Self::CleanedUp => "cleaned_up",
            Self::CleanupFailed => "cleanup_failed",
        }
    }

    /// The only state reachable from `self`, if any.
    fn successors(self) -> &'static [ArtifactState] {
        match self {
            Self::NotStarted => &[Self::Downloaded],
            Self::Downloaded => &[Self::InjectedLocally],
            Self::InjectedLocally => &[Self::CleanedUp, Self::CleanupFailed],
            Self::CleanedUp | Self::CleanupFailed => &[],
        }
    }

    pub fn can_transition_to(self, to: ArtifactState) -> bool {
        self.successors().contains(&to)
    }

    /// Whether the artifact counts as processed. Cleanup outcome does not matter.
    pub fn is_processed(self) -> bool {
        matches!(self, Self::CleanedUp | Self::CleanupFailed)
    }
}

/// One artifact and its reconciliation progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub filename: String,
    pub state: ArtifactState,
    /// Last failure seen for this artifact, whether it halted the cycle or not.
    pub error: Option<String>,
}

impl Artifact {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            state: ArtifactState::NotStarted,
            error: None,
        }
    }

    /// Move to the next state, rejecting skips and rollbacks.
    pub fn advance(&mut self, to: ArtifactState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                entity: format!("artifact '{}'", self.filename),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record a failure without changing state.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn is_processed(&self) -> bool {
        self.state.is_processed()
    }
}

// ---------------------------------------------------------------------------
// Filename validation and derived paths
// ---------------------------------------------------------------------------

/// Validate an artifact filename before it is used as a URL path segment.
///
/// Filenames are flat names inside the remote output directory: no
/// separators, no parent references.
pub fn validate_artifact_filename(filename: &str) -> Result<(), CoreError> {
    if filename.trim().is_empty() {
        return Err(CoreError::Validation(
            "Artifact filename must not be empty".to_string(),
        ));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(CoreError::Validation(format!(
            "Artifact filename must not contain path separators: '{filename}'"
        )));
    }
    if filename == "." || filename == ".." {
        return Err(CoreError::Validation(format!(
            "Artifact filename is not a file: '{filename}'"
        )));
    }
    Ok(())
}

/// Build the minimal two-node host workflow that registers `filename`
/// as a local output: loader → save.
pub fn registration_workflow(filename: &str) -> serde_json::Value {
    json!({
        LOADER_NODE_ID: {
            "class_type": LOADER_NODE_CLASS,
            "inputs": { "filename": filename }
        },
        SAVE_NODE_ID: {
            "class_type": SAVE_NODE_CLASS,
            "inputs": {
                "images": [LOADER_NODE_ID, 0],
                "filename_prefix": REGISTERED_PREFIX
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
