//! Model availability checks and remote downloads.
//!
//! [`FetchCoordinator`] makes sure a model asset exists in remote storage
//! before a workflow needs it. At most one check-or-download runs per
//! `(subfolder, filename)` pair; repeated requests while one is running
//! return [`Availability::InFlight`] without touching the network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpurelay_core::error::CoreError;
use gpurelay_core::job::{
    Job, JobKind, ProgressReport, SUBMIT_STATUS_ALREADY_EXISTS, SUBMIT_STATUS_STARTED,
};
use gpurelay_core::model_asset::{validate_source_url, ModelAsset};
use tokio_util::sync::CancellationToken;

use crate::api::{BridgeApiError, BridgeBackend};
use crate::events::{EventHub, RelayEvent};
use crate::poller::{poll_until_terminal, JobOutcome, PollConfig};

/// Terminal result of one availability request.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    /// The asset was already present remotely. No download was started.
    AlreadyAvailable { size_gb: Option<f64> },
    /// A download job ran to completion.
    Downloaded { job_id: String, message: String },
    /// The backend refused the download or the download job failed.
    Failed { message: String },
    /// The download job did not finish within the attempt bound.
    TimedOut { job_id: String, attempts: u32 },
    /// Observation stopped on shutdown. The download may still finish remotely.
    Cancelled,
    /// Another request for the same asset is running.
    InFlight,
}

impl Availability {
    /// Whether the asset can be used now.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::AlreadyAvailable { .. } | Self::Downloaded { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Malformed descriptor or source URL. Nothing was sent.
    #[error(transparent)]
    Rejected(#[from] CoreError),

    /// Submitting the download failed.
    #[error("Download request failed: {0}")]
    Api(#[from] BridgeApiError),
}

type InFlightSet = Arc<Mutex<HashSet<ModelAsset>>>;

/// The set only holds plain keys, so a panic elsewhere cannot leave it
/// half-updated.
fn lock_set(set: &InFlightSet) -> MutexGuard<'_, HashSet<ModelAsset>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds an asset's in-flight slot; releases it when dropped.
struct InFlightGuard {
    set: InFlightSet,
    asset: ModelAsset,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_set(&self.set).remove(&self.asset);
    }
}

/// Claim `asset`'s slot, or `None` if another request holds it.
fn claim(set: &InFlightSet, asset: &ModelAsset) -> Option<InFlightGuard> {
    if !lock_set(set).insert(asset.clone()) {
        return None;
    }
    Some(InFlightGuard {
        set: Arc::clone(set),
        asset: asset.clone(),
    })
}

/// Deduplicating model availability coordinator.
pub struct FetchCoordinator {
    backend: Arc<dyn BridgeBackend>,
    events: Arc<EventHub>,
    poll: PollConfig,
    in_flight: InFlightSet,
    downloads: Mutex<HashMap<ModelAsset, Job>>,
    cancel: CancellationToken,
}

impl FetchCoordinator {
    pub fn new(
        backend: Arc<dyn BridgeBackend>,
        events: Arc<EventHub>,
        poll: PollConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            events,
            poll,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            downloads: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Whether a check or download for `asset` is running.
    pub fn is_in_flight(&self, asset: &ModelAsset) -> bool {
        lock_set(&self.in_flight).contains(asset)
    }

    /// Download jobs currently being watched, with their latest progress.
    pub fn active_downloads(&self) -> Vec<Job> {
        self.downloads_lock().values().cloned().collect()
    }

    /// Parse `descriptor` (`"<subfolder> / <filename>"`) and make sure the
    /// asset exists remotely, downloading it from `source_url` if needed.
    ///
    /// Malformed input is rejected before any network call.
    pub async fn ensure_available<F>(
        &self,
        descriptor: &str,
        source_url: &str,
        on_progress: F,
    ) -> Result<Availability, CoordinatorError>
    where
        F: Fn(&ProgressReport) + Send + Sync,
    {
        let asset = match ModelAsset::parse(descriptor) {
            Ok(asset) => asset,
            Err(e) => {
                tracing::debug!(descriptor, error = %e, "Skipping malformed model descriptor");
                return Err(e.into());
            }
        };
        if let Err(e) = validate_source_url(source_url) {
            tracing::debug!(asset = %asset, error = %e, "Skipping model with invalid source URL");
            return Err(e.into());
        }

        self.ensure_asset(&asset, source_url, on_progress).await
    }

    /// Same as [`ensure_available`](Self::ensure_available) for an already
    /// parsed asset.
    pub async fn ensure_asset<F>(
        &self,
        asset: &ModelAsset,
        source_url: &str,
        on_progress: F,
    ) -> Result<Availability, CoordinatorError>
    where
        F: Fn(&ProgressReport) + Send + Sync,
    {
        let Some(_guard) = claim(&self.in_flight, asset) else {
            tracing::debug!(asset = %asset, "Model request already in flight");
            return Ok(Availability::InFlight);
        };

        match self.backend.check_model(asset).await {
            Ok(check) if check.exists => {
                tracing::info!(asset = %asset, size_gb = ?check.size_gb, "Model already available");
                self.events.publish(RelayEvent::ModelAvailable {
                    asset: asset.clone(),
                    newly_downloaded: false,
                });
                return Ok(Availability::AlreadyAvailable {
                    size_gb: check.size_gb,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(asset = %asset, error = %e, "Model existence check failed, downloading anyway");
            }
        }

        let submitted = match self.backend.download_model(source_url, asset).await {
            Ok(submitted) => submitted,
            Err(e) => {
                tracing::error!(asset = %asset, error = %e, "Failed to start model download");
                self.events.publish(RelayEvent::ModelDownloadFailed {
                    asset: asset.clone(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        if submitted.status == SUBMIT_STATUS_ALREADY_EXISTS {
            tracing::info!(asset = %asset, "Model already exists on the bridge");
            self.events.publish(RelayEvent::ModelAvailable {
                asset: asset.clone(),
                newly_downloaded: false,
            });
            return Ok(Availability::AlreadyAvailable { size_gb: None });
        }

        let job_id = match (submitted.status.as_str(), submitted.task_id.as_deref()) {
            (SUBMIT_STATUS_STARTED, Some(id)) => id.to_string(),
            _ => {
                let message = submitted.reason();
                tracing::warn!(asset = %asset, status = %submitted.status, message = %message, "Model download not started");
                self.events.publish(RelayEvent::ModelDownloadFailed {
                    asset: asset.clone(),
                    error: message.clone(),
                });
                return Ok(Availability::Failed { message });
            }
        };

        tracing::info!(asset = %asset, job_id = %job_id, "Model download started");
        self.downloads_lock()
            .insert(asset.clone(), Job::new(job_id.clone(), JobKind::Download));

        let outcome = poll_until_terminal(
            &*self.backend,
            &job_id,
            &self.poll,
            &self.cancel,
            |report: &ProgressReport| {
                if let Some(job) = self.downloads_lock().get_mut(asset) {
                    job.apply(report);
                }
                self.events.publish(RelayEvent::ModelDownloadProgress {
                    asset: asset.clone(),
                    job_id: job_id.clone(),
                    percent: report.percent.unwrap_or_default(),
                });
                on_progress(report);
            },
        )
        .await;

        Ok(self.finish(asset, job_id, outcome))
    }

    /// Ensure every `(descriptor, source_url)` entry concurrently.
    ///
    /// Results are returned in input order. Duplicate entries resolve to
    /// [`Availability::InFlight`] while the first one runs.
    pub async fn ensure_all(
        &self,
        entries: &[(String, String)],
    ) -> Vec<Result<Availability, CoordinatorError>> {
        let requests = entries
            .iter()
            .map(|(descriptor, url)| self.ensure_available(descriptor, url, |_: &ProgressReport| {}));
        futures::future::join_all(requests).await
    }

    fn downloads_lock(&self) -> MutexGuard<'_, HashMap<ModelAsset, Job>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, asset: &ModelAsset, job_id: String, outcome: JobOutcome) -> Availability {
        self.downloads_lock().remove(asset);
        match outcome {
            JobOutcome::Completed { message, .. } => {
                tracing::info!(asset = %asset, job_id = %job_id, "Model downloaded");
                self.events.publish(RelayEvent::ModelAvailable {
                    asset: asset.clone(),
                    newly_downloaded: true,
                });
                Availability::Downloaded { job_id, message }
            }
            JobOutcome::Failed { message } => {
                self.events.publish(RelayEvent::ModelDownloadFailed {
                    asset: asset.clone(),
                    error: message.clone(),
                });
                Availability::Failed { message }
            }
            JobOutcome::TimedOut { attempts, .. } => {
                self.events.publish(RelayEvent::ModelDownloadFailed {
                    asset: asset.clone(),
                    error: format!("download did not finish after {attempts} polls"),
                });
                Availability::TimedOut { job_id, attempts }
            }
            JobOutcome::Cancelled => Availability::Cancelled,
        }
    }
}
