//! Model asset descriptors and download-source validation.
//!
//! The host's missing-models list labels each entry as
//! `"<subfolder> / <filename>"` (e.g. `"checkpoints / sdxl.safetensors"`).
//! Anything else is noise from unrelated UI state and is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Separator between subfolder and filename in a display descriptor.
pub const DESCRIPTOR_SEPARATOR: &str = " / ";

/// A model file in remote storage, keyed by `(subfolder, filename)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelAsset {
    pub subfolder: String,
    pub filename: String,
}

impl ModelAsset {
    pub fn new(subfolder: impl Into<String>, filename: impl Into<String>) -> Result<Self, CoreError> {
        let subfolder = subfolder.into().trim().to_string();
        let filename = filename.into().trim().to_string();

        if subfolder.is_empty() || filename.is_empty() {
            return Err(CoreError::Validation(
                "Model subfolder and filename must not be empty".to_string(),
            ));
        }
        Ok(Self {
            subfolder,
            filename,
        })
    }

    /// Parse a `"<subfolder> / <filename>"` display descriptor.
    pub fn parse(descriptor: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = descriptor.trim().split(DESCRIPTOR_SEPARATOR).collect();
        match parts.as_slice() {
            [subfolder, filename] => Self::new(*subfolder, *filename),
            _ => Err(CoreError::Validation(format!(
                "Model descriptor must look like '<subfolder>{DESCRIPTOR_SEPARATOR}<filename>', got: '{descriptor}'"
            ))),
        }
    }
}

impl fmt::Display for ModelAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DESCRIPTOR_SEPARATOR}{}", self.subfolder, self.filename)
    }
}

/// Validate that a model source URL is non-empty and uses http(s).
pub fn validate_source_url(url: &str) -> Result<(), CoreError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Model source URL must not be empty".to_string(),
        ));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(CoreError::Validation(format!(
            "Model source URL must start with http:// or https://, got: '{trimmed}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
