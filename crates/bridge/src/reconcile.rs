//! Artifact reconciliation.
//!
//! A completed remote execution leaves its outputs on the bridge. Each one
//! is pulled back into the local host in four steps:
//!
//! 1. `GET /get_image/{filename}` copies it into the bridge's temp storage.
//! 2. A two-node loader → save prompt registers it as a local output.
//! 3. Wait for that prompt to finish (or a short settle delay).
//! 4. `DELETE /delete_temp/{filename}` removes the temporary copy.
//!
//! Artifacts are processed one at a time. The local registration prompt
//! always uses the same loader node, so overlapping cycles would race on
//! the save step.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpurelay_core::artifact::{
    registration_workflow, validate_artifact_filename, Artifact, ArtifactState,
};
use gpurelay_core::error::CoreError;

use crate::api::BridgeBackend;
use crate::events::{EventHub, RelayEvent};
use crate::host::{HostError, LocalHost};

/// Default wait after submitting a registration prompt when the host
/// cannot report completion.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default bound on waiting for a registration prompt to finish.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub settle_delay: Duration,
    pub completion_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup ledger
// ---------------------------------------------------------------------------

/// Filenames whose remote temporary copy could not be deleted.
#[derive(Debug, Default)]
pub struct CleanupLedger {
    pending: Mutex<BTreeSet<String>>,
}

impl CleanupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, filename: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(filename.to_string());
        }
    }

    /// Remove `filename`. Returns `true` if it was pending.
    pub fn resolve(&self, filename: &str) -> bool {
        self.pending
            .lock()
            .map(|mut pending| pending.remove(filename))
            .unwrap_or(false)
    }

    /// Snapshot of pending filenames, sorted.
    pub fn pending(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|pending| pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Why a cycle stopped before reaching a terminal state.
#[derive(Debug, thiserror::Error)]
enum CycleAbort {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("local registration failed: {0}")]
    Inject(#[from] HostError),
}

/// Runs the fetch → inject → settle → delete cycle for a job's artifacts.
pub struct ReconciliationPipeline {
    backend: Arc<dyn BridgeBackend>,
    host: Arc<dyn LocalHost>,
    ledger: Arc<CleanupLedger>,
    events: Arc<EventHub>,
    config: ReconcileConfig,
}

impl ReconciliationPipeline {
    pub fn new(
        backend: Arc<dyn BridgeBackend>,
        host: Arc<dyn LocalHost>,
        ledger: Arc<CleanupLedger>,
        events: Arc<EventHub>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            backend,
            host,
            ledger,
            events,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<CleanupLedger> {
        &self.ledger
    }

    /// Reconcile `filenames` in order. Returns one [`Artifact`] per input,
    /// in the same order, each in the state its cycle reached.
    ///
    /// A failing artifact never stops the ones after it.
    pub async fn reconcile(&self, job_id: &str, filenames: &[String]) -> Vec<Artifact> {
        let mut results = Vec::with_capacity(filenames.len());

        for filename in filenames {
            let artifact = self.process(filename).await;
            self.events.publish(RelayEvent::ArtifactReconciled {
                job_id: job_id.to_string(),
                filename: artifact.filename.clone(),
                state: artifact.state,
                error: artifact.error.clone(),
            });
            results.push(artifact);
        }

        let processed = results.iter().filter(|a| a.is_processed()).count();
        tracing::info!(
            job_id,
            total = results.len(),
            processed,
            "Reconciliation finished",
        );
        results
    }

    async fn process(&self, filename: &str) -> Artifact {
        let mut artifact = Artifact::new(filename);
        if let Err(e) = self.run_cycle(&mut artifact).await {
            tracing::warn!(
                filename,
                state = artifact.state.as_str(),
                error = %e,
                "Artifact cycle aborted",
            );
            artifact.record_error(e.to_string());
        }
        artifact
    }

    async fn run_cycle(&self, artifact: &mut Artifact) -> Result<(), CycleAbort> {
        let filename = artifact.filename.clone();
        validate_artifact_filename(&filename)?;

        // 1. Fetch into bridge temp storage.
        match self.backend.fetch_artifact(&filename).await {
            Ok(fetched) if fetched.is_success() => {}
            Ok(fetched) => {
                let reason = fetched
                    .error
                    .or(fetched.status)
                    .unwrap_or_else(|| "unexpected response".to_string());
                return Err(CycleAbort::Fetch(reason));
            }
            Err(e) => return Err(CycleAbort::Fetch(e.to_string())),
        }
        artifact.advance(ArtifactState::Downloaded)?;
        tracing::debug!(filename = %filename, "Artifact fetched into temp storage");

        // 2. Register locally.
        let prompt_id = self
            .host
            .submit_prompt(&registration_workflow(&filename))
            .await?;
        artifact.advance(ArtifactState::InjectedLocally)?;
        tracing::debug!(filename = %filename, prompt_id = %prompt_id, "Registration prompt queued");

        // 3. Settle.
        self.settle(&filename, &prompt_id).await;

        // 4. Delete the temp copy.
        match self.backend.delete_temp(&filename).await {
            Ok(_) => {
                artifact.advance(ArtifactState::CleanedUp)?;
                tracing::info!(filename = %filename, "Artifact reconciled");
            }
            Err(e) => {
                tracing::warn!(filename = %filename, error = %e, "Failed to delete temporary artifact");
                self.ledger.record(&filename);
                artifact.record_error(format!("cleanup failed: {e}"));
                artifact.advance(ArtifactState::CleanupFailed)?;
            }
        }
        Ok(())
    }

    /// Wait until the registration prompt has been executed by the host.
    /// Never fails: the temp copy is deleted regardless.
    ///
    /// Unless the host confirmed completion or the timeout elapsed, at
    /// least the settle delay passes before returning.
    async fn settle(&self, filename: &str, prompt_id: &str) {
        let waited = tokio::time::timeout(
            self.config.completion_timeout,
            self.host.await_completion(prompt_id),
        )
        .await;

        match waited {
            Ok(Ok(())) => {}
            Ok(Err(HostError::CompletionUnsupported)) => {
                tokio::time::sleep(self.config.settle_delay).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(filename, prompt_id, error = %e, "Registration prompt did not succeed");
                tokio::time::sleep(self.config.settle_delay).await;
            }
            Err(_) => {
                tracing::warn!(
                    filename,
                    prompt_id,
                    timeout_secs = self.config.completion_timeout.as_secs(),
                    "Timed out waiting for registration prompt",
                );
            }
        }
    }
}
