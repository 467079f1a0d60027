//! Core domain types for the GPU relay.
//!
//! Pure data, constants and validation shared by the bridge and the
//! command-line agent. Nothing in this crate performs I/O.

pub mod artifact;
pub mod error;
pub mod job;
pub mod model_asset;
pub mod selection;
pub mod types;
