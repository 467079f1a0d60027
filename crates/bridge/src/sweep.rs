//! Periodic retry of failed remote cleanups.
//!
//! Artifacts whose `/delete_temp` call failed during reconciliation are
//! recorded in the [`CleanupLedger`]. The sweeper retries those deletions
//! on a fixed interval until they succeed. A 404 means the copy is already
//! gone and also resolves the entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::BridgeBackend;
use crate::events::{EventHub, RelayEvent};
use crate::reconcile::CleanupLedger;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Result of one pass over the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub attempted: usize,
    pub cleaned: usize,
    pub still_pending: usize,
}

pub struct CleanupSweeper {
    backend: Arc<dyn BridgeBackend>,
    ledger: Arc<CleanupLedger>,
    events: Arc<EventHub>,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(
        backend: Arc<dyn BridgeBackend>,
        ledger: Arc<CleanupLedger>,
        events: Arc<EventHub>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            ledger,
            events,
            interval,
        }
    }

    /// Retry every pending deletion once.
    pub async fn sweep_once(&self) -> SweepSummary {
        let pending = self.ledger.pending();
        let mut summary = SweepSummary {
            attempted: pending.len(),
            ..Default::default()
        };

        for filename in pending {
            let cleaned = match self.backend.delete_temp(&filename).await {
                Ok(_) => true,
                Err(e) if e.status() == Some(404) => {
                    tracing::debug!(filename = %filename, "Temporary artifact already gone");
                    true
                }
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "Cleanup retry failed");
                    false
                }
            };

            if cleaned {
                self.ledger.resolve(&filename);
                summary.cleaned += 1;
            }
            self.events.publish(RelayEvent::CleanupRetried { filename, cleaned });
        }

        summary.still_pending = self.ledger.len();
        summary
    }

    /// Run [`sweep_once`](Self::sweep_once) every interval until `cancel`
    /// fires. The first sweep happens one interval after start.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = self.interval.as_secs(), "Cleanup sweeper started");
            let start = tokio::time::Instant::now() + self.interval;
            let mut interval = tokio::time::interval_at(start, self.interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Cleanup sweeper stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if self.ledger.is_empty() {
                            continue;
                        }
                        let summary = self.sweep_once().await;
                        tracing::info!(
                            attempted = summary.attempted,
                            cleaned = summary.cleaned,
                            still_pending = summary.still_pending,
                            "Cleanup sweep finished",
                        );
                    }
                }
            }
        })
    }
}
