//! GPU catalog and the resource selection invariant.
//!
//! A [`ResourceSelection`] holds a requested instance count per GPU class.
//! At most one class has a non-zero count at any time: giving a class a
//! non-zero count makes it the active class and zeroes all others.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// One selectable GPU class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuClass {
    /// Wire value sent as `gpu_type`.
    pub value: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Display price per instance-second, in USD.
    pub price_per_second: f64,
    /// Maximum instance count for this class.
    pub max_count: u32,
}

/// Every GPU class the remote backend offers, most expensive first.
pub const GPU_CATALOG: &[GpuClass] = &[
    GpuClass { value: "B200", name: "Nvidia B200", price_per_second: 0.001736, max_count: 8 },
    GpuClass { value: "H200", name: "Nvidia H200", price_per_second: 0.001261, max_count: 8 },
    GpuClass { value: "H100", name: "Nvidia H100", price_per_second: 0.001097, max_count: 8 },
    GpuClass { value: "A100-80GB", name: "Nvidia A100, 80 GB", price_per_second: 0.000694, max_count: 8 },
    GpuClass { value: "A100", name: "Nvidia A100, 40 GB", price_per_second: 0.000583, max_count: 8 },
    GpuClass { value: "L40S", name: "Nvidia L40S", price_per_second: 0.000542, max_count: 8 },
    GpuClass { value: "A10G", name: "Nvidia A10G", price_per_second: 0.000306, max_count: 4 },
    GpuClass { value: "L4", name: "Nvidia L4", price_per_second: 0.000222, max_count: 8 },
    GpuClass { value: "T4", name: "Nvidia T4", price_per_second: 0.000164, max_count: 8 },
];

/// Class selected when nothing has been persisted yet.
pub const DEFAULT_GPU_CLASS: &str = "T4";

/// Look up a catalog entry by wire value.
pub fn find_gpu_class(value: &str) -> Option<&'static GpuClass> {
    GPU_CATALOG.iter().find(|g| g.value == value)
}

/// Validate that `value` names a catalog class.
pub fn validate_gpu_class(value: &str) -> Result<&'static GpuClass, CoreError> {
    find_gpu_class(value).ok_or_else(|| {
        let valid: Vec<&str> = GPU_CATALOG.iter().map(|g| g.value).collect();
        CoreError::Validation(format!(
            "Unknown GPU class: '{value}'. Valid classes: {}",
            valid.join(", ")
        ))
    })
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Persisted shape of a selection. Normalised on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRecord {
    #[serde(default)]
    pub active_gpu: Option<String>,
    #[serde(default)]
    pub gpu_counts: BTreeMap<String, u32>,
}

/// The user's current GPU class and instance count choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SelectionRecord", into = "SelectionRecord")]
pub struct ResourceSelection {
    active: String,
    counts: BTreeMap<String, u32>,
}

impl Default for ResourceSelection {
    fn default() -> Self {
        Self::from(SelectionRecord::default())
    }
}

impl From<SelectionRecord> for ResourceSelection {
    /// Unknown classes are dropped, counts clamped, and only the active
    /// class keeps a non-zero count. An active class stored at zero comes
    /// back with one instance.
    fn from(record: SelectionRecord) -> Self {
        let active = record
            .active_gpu
            .as_deref()
            .and_then(find_gpu_class)
            .unwrap_or_else(default_class)
            .value
            .to_string();

        let mut counts: BTreeMap<String, u32> =
            GPU_CATALOG.iter().map(|g| (g.value.to_string(), 0)).collect();
        let stored = record.gpu_counts.get(&active).copied().unwrap_or(0);
        counts.insert(active.clone(), clamp_count(&active, stored.max(1)));

        Self { active, counts }
    }
}

impl From<ResourceSelection> for SelectionRecord {
    fn from(selection: ResourceSelection) -> Self {
        Self {
            active_gpu: Some(selection.active),
            gpu_counts: selection.counts,
        }
    }
}

impl ResourceSelection {
    /// Currently active class (wire value).
    pub fn active_class(&self) -> &str {
        &self.active
    }

    /// Requested count for `class` (0 for unknown classes).
    pub fn count(&self, class: &str) -> u32 {
        self.counts.get(class).copied().unwrap_or(0)
    }

    /// `(class, count)` for the active class.
    pub fn current(&self) -> (&str, u32) {
        (&self.active, self.count(&self.active))
    }

    pub fn counts(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }

    /// Make `class` active. Its count becomes 1 if it was 0; all others become 0.
    pub fn select(&mut self, class: &str) -> Result<(), CoreError> {
        let gpu = validate_gpu_class(class)?;
        let count = self.count(gpu.value).max(1);
        self.activate(gpu.value, count);
        Ok(())
    }

    /// Set the count for `class`, clamped to `[0, max]`. Returns the stored value.
    ///
    /// A non-zero count makes the class active. Zero leaves the active class
    /// unchanged.
    pub fn set_count(&mut self, class: &str, count: u32) -> Result<u32, CoreError> {
        let gpu = validate_gpu_class(class)?;
        let clamped = clamp_count(gpu.value, count);
        if clamped > 0 {
            self.activate(gpu.value, clamped);
        } else {
            self.counts.insert(gpu.value.to_string(), 0);
        }
        Ok(clamped)
    }

    /// Display estimate for the active class: price per second times count.
    pub fn estimated_cost_per_second(&self) -> f64 {
        let (class, count) = self.current();
        find_gpu_class(class)
            .map(|g| g.price_per_second * count as f64)
            .unwrap_or(0.0)
    }

    fn activate(&mut self, class: &str, count: u32) {
        for (name, value) in self.counts.iter_mut() {
            *value = if name == class { count } else { 0 };
        }
        self.active = class.to_string();
    }
}

fn default_class() -> &'static GpuClass {
    find_gpu_class(DEFAULT_GPU_CLASS).unwrap_or(&GPU_CATALOG[GPU_CATALOG.len() - 1])
}

fn clamp_count(class: &str, count: u32) -> u32 {
    let max = find_gpu_class(class).map(|g| g.max_count).unwrap_or(0);
    count.min(max)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
