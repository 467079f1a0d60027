//! Remote workflow execution.
//!
//! [`Dispatcher::execute`] owns one execution from submission to the
//! moment its artifacts are registered locally:
//!
//! submit → watch progress → reconcile the final report's artifacts →
//! announce them → refresh the host's output views.
//!
//! Only the artifacts named by this job's final progress report are
//! reconciled, never a listing of everything resident on the bridge.

use std::sync::{Arc, Mutex};

use gpurelay_core::artifact::Artifact;
use gpurelay_core::error::CoreError;
use gpurelay_core::job::{Job, JobKind, ProgressReport, SUBMIT_STATUS_STARTED};
use gpurelay_core::selection::ResourceSelection;

use crate::api::{BridgeApiError, BridgeBackend};
use crate::events::{EventHub, RelayEvent};
use crate::host::LocalHost;
use crate::poller::{JobOutcome, JobPoller, PollConfig, PollerError};
use crate::reconcile::ReconciliationPipeline;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Empty workflow or zero instances. Nothing was submitted.
    #[error(transparent)]
    Rejected(#[from] CoreError),

    #[error("Execution request failed: {0}")]
    Api(#[from] BridgeApiError),

    /// The backend answered but did not start a job.
    #[error("Execution not started ({status}): {message}")]
    NotStarted { status: String, message: String },

    #[error("Execution {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Execution {job_id} reported no terminal status after {attempts} polls")]
    TimedOut { job_id: String, attempts: u32 },

    #[error("Stopped watching execution {job_id}")]
    Cancelled { job_id: String },

    #[error(transparent)]
    Poller(#[from] PollerError),
}

/// What the display shows for the execution in progress.
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub job: Job,
    pub gpu_type: String,
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: String,
    /// Class the backend confirmed, or the requested one if it did not say.
    pub gpu_type: String,
    /// Final progress message.
    pub message: String,
    /// One entry per artifact in the final report, in order.
    pub artifacts: Vec<Artifact>,
}

impl ExecutionReport {
    /// Number of artifacts that completed their cycle.
    pub fn processed(&self) -> usize {
        self.artifacts.iter().filter(|a| a.is_processed()).count()
    }
}

type ActiveSlot = Arc<Mutex<Option<ActiveExecution>>>;

pub struct Dispatcher {
    backend: Arc<dyn BridgeBackend>,
    host: Arc<dyn LocalHost>,
    poller: JobPoller,
    pipeline: Arc<ReconciliationPipeline>,
    events: Arc<EventHub>,
    poll: PollConfig,
    active: ActiveSlot,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn BridgeBackend>,
        host: Arc<dyn LocalHost>,
        poller: JobPoller,
        pipeline: Arc<ReconciliationPipeline>,
        events: Arc<EventHub>,
        poll: PollConfig,
    ) -> Self {
        Self {
            backend,
            host,
            poller,
            pipeline,
            events,
            poll,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// The execution currently shown on the display, if any.
    pub fn active_execution(&self) -> Option<ActiveExecution> {
        self.active.lock().ok().and_then(|slot| slot.clone())
    }

    /// Run `workflow` remotely on the selection's active GPU class.
    pub async fn execute(
        &self,
        workflow: &serde_json::Value,
        selection: &ResourceSelection,
    ) -> Result<ExecutionReport, DispatchError> {
        validate_workflow(workflow)?;
        let (requested_gpu, count) = selection.current();
        if count == 0 {
            return Err(CoreError::Validation(format!(
                "GPU class {requested_gpu} has no instances selected"
            ))
            .into());
        }

        let submitted = self.backend.execute_workflow(workflow, requested_gpu).await?;
        let job_id = match (submitted.status.as_str(), submitted.task_id.as_deref()) {
            (SUBMIT_STATUS_STARTED, Some(id)) => id.to_string(),
            _ => {
                return Err(DispatchError::NotStarted {
                    status: submitted.status.clone(),
                    message: submitted.reason(),
                })
            }
        };
        let gpu_type = submitted
            .gpu_type
            .clone()
            .unwrap_or_else(|| requested_gpu.to_string());

        tracing::info!(job_id = %job_id, gpu_type = %gpu_type, count, "Execution started");
        let mut job = Job::new(job_id.clone(), JobKind::Execution);
        job.message = submitted.message.clone().unwrap_or_default();
        self.set_active(ActiveExecution {
            job,
            gpu_type: gpu_type.clone(),
        });
        self.events.publish(RelayEvent::ExecutionStarted {
            job_id: job_id.clone(),
            gpu_type: gpu_type.clone(),
        });

        let outcome = self.watch(&job_id).await;
        let (message, filenames) = match outcome {
            Ok(JobOutcome::Completed { message, artifacts }) => (message, artifacts),
            Ok(JobOutcome::Failed { message }) => {
                self.clear_active(&job_id);
                return Err(DispatchError::JobFailed { job_id, message });
            }
            Ok(JobOutcome::TimedOut { attempts, .. }) => {
                self.clear_active(&job_id);
                return Err(DispatchError::TimedOut { job_id, attempts });
            }
            Ok(JobOutcome::Cancelled) => {
                self.clear_active(&job_id);
                return Err(DispatchError::Cancelled { job_id });
            }
            Err(e) => {
                self.clear_active(&job_id);
                return Err(e.into());
            }
        };

        let artifacts = self.pipeline.reconcile(&job_id, &filenames).await;

        let ready: Vec<String> = artifacts
            .iter()
            .filter(|a| a.is_processed())
            .map(|a| a.filename.clone())
            .collect();
        if !ready.is_empty() {
            self.events.publish(RelayEvent::ArtifactsReady {
                job_id: job_id.clone(),
                filenames: ready,
            });
        }
        if let Err(e) = self.host.refresh_outputs().await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to refresh local outputs");
        }

        self.clear_active(&job_id);
        Ok(ExecutionReport {
            job_id,
            gpu_type,
            message,
            artifacts,
        })
    }

    /// Stop observing every execution. Remote jobs keep running.
    pub fn shutdown(&self) {
        self.poller.shutdown();
    }

    async fn watch(&self, job_id: &str) -> Result<JobOutcome, PollerError> {
        let events = Arc::clone(&self.events);
        let active = Arc::clone(&self.active);
        let progress_job = job_id.to_string();
        let on_progress = move |report: &ProgressReport| {
            if let Ok(mut slot) = active.lock() {
                if let Some(current) = slot.as_mut().filter(|a| a.job.id == progress_job) {
                    current.job.apply(report);
                }
            }
            events.publish(RelayEvent::ExecutionProgress {
                job_id: progress_job.clone(),
                percent: report.percent.unwrap_or_default(),
                message: report.message_or_empty().to_string(),
            });
        };

        let events = Arc::clone(&self.events);
        let terminal_job = job_id.to_string();
        let on_terminal = move |outcome: &JobOutcome| {
            let event = match outcome {
                JobOutcome::Completed { artifacts, .. } => RelayEvent::ExecutionCompleted {
                    job_id: terminal_job,
                    artifacts: artifacts.clone(),
                },
                other => RelayEvent::ExecutionFailed {
                    job_id: terminal_job,
                    error: other.describe(),
                },
            };
            events.publish(event);
        };

        self.poller
            .watch(job_id, self.poll, on_progress, on_terminal)?
            .outcome()
            .await
    }

    fn set_active(&self, execution: ActiveExecution) {
        if let Ok(mut slot) = self.active.lock() {
            *slot = Some(execution);
        }
    }

    /// Clear the slot only if it still shows `job_id`.
    fn clear_active(&self, job_id: &str) {
        if let Ok(mut slot) = self.active.lock() {
            if slot.as_ref().is_some_and(|a| a.job.id == job_id) {
                *slot = None;
            }
        }
    }
}

fn validate_workflow(workflow: &serde_json::Value) -> Result<(), CoreError> {
    match workflow.as_object() {
        Some(nodes) if !nodes.is_empty() => Ok(()),
        Some(_) => Err(CoreError::Validation("Workflow has no nodes".to_string())),
        None => Err(CoreError::Validation(
            "Workflow must be a JSON object keyed by node id".to_string(),
        )),
    }
}
