//! Remote execution bridge for a ComfyUI-style host.
//!
//! Submits workflows and model downloads to a GPU-rental bridge over HTTP,
//! tracks the resulting jobs to completion, and splices produced artifacts
//! back into the local host as regular outputs.
//!
//! - [`api`]: HTTP client for the remote bridge ([`BridgeBackend`]).
//! - [`host`]: HTTP client for the local host ([`LocalHost`]).
//! - [`poller`]: cancellable job progress watches.
//! - [`models`]: model availability checks and deduplicated downloads.
//! - [`dispatcher`]: workflow execution lifecycle.
//! - [`reconcile`]: per-artifact fetch → inject → settle → delete cycle.
//! - [`sweep`]: out-of-band retry of failed remote cleanups.
//! - [`selection`]: persisted GPU selection state.
//! - [`events`]: broadcast of relay events.
//! - [`relay`]: wiring of all of the above.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod host;
pub mod models;
pub mod poller;
pub mod reconcile;
pub mod relay;
pub mod selection;
pub mod sweep;

pub use api::{BridgeApi, BridgeApiError, BridgeBackend};
pub use config::RelayConfig;
pub use events::{EventHub, RelayEvent};
pub use host::{ComfyHost, HostError, LocalHost};
pub use relay::Relay;
