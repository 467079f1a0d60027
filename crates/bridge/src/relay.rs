//! Top-level wiring of the relay components.

use std::sync::Arc;

use gpurelay_core::error::CoreError;
use gpurelay_core::job::ProgressReport;
use gpurelay_core::selection::ResourceSelection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{BridgeApi, BridgeApiError, BridgeBackend};
use crate::config::RelayConfig;
use crate::dispatcher::{DispatchError, Dispatcher, ExecutionReport};
use crate::events::EventHub;
use crate::host::{ComfyHost, LocalHost};
use crate::models::{Availability, CoordinatorError, FetchCoordinator};
use crate::poller::JobPoller;
use crate::reconcile::{CleanupLedger, ReconciliationPipeline};
use crate::selection::{JsonFileStore, SelectionState, SelectionStore};
use crate::sweep::CleanupSweeper;

/// Owns every relay component and the shared cancellation token.
pub struct Relay {
    events: Arc<EventHub>,
    selection: Arc<SelectionState>,
    coordinator: FetchCoordinator,
    dispatcher: Dispatcher,
    sweeper: Arc<CleanupSweeper>,
    ledger: Arc<CleanupLedger>,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(
        config: &RelayConfig,
        backend: Arc<dyn BridgeBackend>,
        host: Arc<dyn LocalHost>,
        store: Arc<dyn SelectionStore>,
    ) -> Self {
        let events = Arc::new(EventHub::default());
        let cancel = CancellationToken::new();
        let ledger = Arc::new(CleanupLedger::new());

        let selection = Arc::new(SelectionState::load(store, Arc::clone(&events)));
        let coordinator = FetchCoordinator::new(
            Arc::clone(&backend),
            Arc::clone(&events),
            config.download_poll_config(),
            cancel.child_token(),
        );
        let pipeline = Arc::new(ReconciliationPipeline::new(
            Arc::clone(&backend),
            Arc::clone(&host),
            Arc::clone(&ledger),
            Arc::clone(&events),
            config.reconcile_config(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&backend),
            host,
            JobPoller::new(Arc::clone(&backend)),
            pipeline,
            Arc::clone(&events),
            config.execution_poll_config(),
        );
        let sweeper = Arc::new(CleanupSweeper::new(
            backend,
            Arc::clone(&ledger),
            Arc::clone(&events),
            config.cleanup_sweep_interval(),
        ));

        Self {
            events,
            selection,
            coordinator,
            dispatcher,
            sweeper,
            ledger,
            cancel,
        }
    }

    /// Build a relay talking to the bridge and host named in `config`.
    pub fn from_config(config: &RelayConfig) -> Result<Self, BridgeApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let backend = BridgeApi::with_client(client.clone(), &config.bridge_api_url)?;
        let host = ComfyHost::with_client(client, config.comfyui_url.clone());
        let store = JsonFileStore::new(config.selection_file.clone());

        Ok(Self::new(
            config,
            Arc::new(backend),
            Arc::new(host),
            Arc::new(store),
        ))
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn selection(&self) -> &Arc<SelectionState> {
        &self.selection
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn ledger(&self) -> &Arc<CleanupLedger> {
        &self.ledger
    }

    pub fn sweeper(&self) -> &Arc<CleanupSweeper> {
        &self.sweeper
    }

    /// Execute `workflow` with the current GPU selection.
    pub async fn execute(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<ExecutionReport, DispatchError> {
        let selection: ResourceSelection = self.selection.current();
        self.dispatcher.execute(workflow, &selection).await
    }

    pub async fn ensure_model<F>(
        &self,
        descriptor: &str,
        source_url: &str,
        on_progress: F,
    ) -> Result<Availability, CoordinatorError>
    where
        F: Fn(&ProgressReport) + Send + Sync,
    {
        self.coordinator
            .ensure_available(descriptor, source_url, on_progress)
            .await
    }

    pub fn select_gpu(&self, class: &str) -> Result<ResourceSelection, CoreError> {
        self.selection.select(class)
    }

    pub fn set_gpu_count(&self, class: &str, count: u32) -> Result<u32, CoreError> {
        self.selection.set_count(class, count)
    }

    /// Start the background cleanup sweeper. It stops on [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        Arc::clone(&self.sweeper).spawn(self.cancel.child_token())
    }

    /// Stop every watch and background task. Remote jobs keep running.
    pub fn shutdown(&self) {
        tracing::info!(pending_cleanups = self.ledger.len(), "Relay shutting down");
        self.dispatcher.shutdown();
        self.cancel.cancel();
    }
}
