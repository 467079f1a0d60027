//! Command-line front end for the gpurelay bridge.
//!
//! Reads a serialized workflow from disk, runs it on a remote GPU through
//! the bridge, and registers the produced images with the local host.
//! Also manages the persisted GPU selection and model downloads.

pub mod cli;
pub mod commands;
pub mod logging;
