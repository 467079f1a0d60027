//! Persisted GPU selection state.
//!
//! [`SelectionState`] owns the current [`ResourceSelection`]. Every
//! mutation is saved through a [`SelectionStore`] and republished on a
//! `watch` channel before the call returns, so the next execution sees it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use gpurelay_core::error::CoreError;
use gpurelay_core::selection::ResourceSelection;
use tokio::sync::watch;

use crate::events::{EventHub, RelayEvent};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Selection file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Selection file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key-value persistence for the selection.
pub trait SelectionStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<ResourceSelection>, StoreError>;

    fn save(&self, selection: &ResourceSelection) -> Result<(), StoreError>;
}

/// Stores the selection as a small JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SelectionStore for JsonFileStore {
    fn load(&self) -> Result<Option<ResourceSelection>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, selection: &ResourceSelection) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(selection)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<ResourceSelection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(selection: ResourceSelection) -> Self {
        Self {
            saved: Mutex::new(Some(selection)),
        }
    }
}

impl SelectionStore for MemoryStore {
    fn load(&self) -> Result<Option<ResourceSelection>, StoreError> {
        Ok(self.saved.lock().ok().and_then(|saved| saved.clone()))
    }

    fn save(&self, selection: &ResourceSelection) -> Result<(), StoreError> {
        if let Ok(mut saved) = self.saved.lock() {
            *saved = Some(selection.clone());
        }
        Ok(())
    }
}

/// Live selection shared by the dispatcher and the user-facing surface.
pub struct SelectionState {
    /// Serializes mutations; the watch channel holds the published copy.
    lock: Mutex<()>,
    store: Arc<dyn SelectionStore>,
    tx: watch::Sender<ResourceSelection>,
    events: Arc<EventHub>,
}

impl SelectionState {
    /// Load the saved selection, falling back to the default on any error.
    pub fn load(store: Arc<dyn SelectionStore>, events: Arc<EventHub>) -> Self {
        let initial = match store.load() {
            Ok(Some(selection)) => selection,
            Ok(None) => ResourceSelection::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load saved GPU selection, using default");
                ResourceSelection::default()
            }
        };
        let (tx, _) = watch::channel(initial);

        Self {
            lock: Mutex::new(()),
            store,
            tx,
            events,
        }
    }

    pub fn current(&self) -> ResourceSelection {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSelection> {
        self.tx.subscribe()
    }

    /// Make `class` the active GPU class.
    pub fn select(&self, class: &str) -> Result<ResourceSelection, CoreError> {
        self.update(|selection| selection.select(class))?;
        Ok(self.current())
    }

    /// Set the instance count for `class`. Returns the clamped value stored.
    pub fn set_count(&self, class: &str, count: u32) -> Result<u32, CoreError> {
        self.update(|selection| selection.set_count(class, count))
    }

    fn update<T>(
        &self,
        apply: impl FnOnce(&mut ResourceSelection) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CoreError::Internal("selection lock poisoned".to_string()))?;

        let mut next = self.current();
        let value = apply(&mut next)?;

        if let Err(e) = self.store.save(&next) {
            tracing::warn!(error = %e, "Failed to persist GPU selection");
        }

        let (gpu_type, count) = next.current();
        let (gpu_type, count) = (gpu_type.to_string(), count);
        self.tx.send_replace(next);
        tracing::debug!(gpu_type = %gpu_type, count, "GPU selection changed");
        self.events
            .publish(RelayEvent::SelectionChanged { gpu_type, count });

        Ok(value)
    }
}
