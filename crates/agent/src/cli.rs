use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run ComfyUI workflows on rented GPUs.
#[derive(Debug, Parser)]
#[command(name = "gpurelay")]
#[command(about = "Run ComfyUI workflows on a remote GPU bridge", long_about = None)]
pub struct Cli {
    /// Emit machine-readable JSON instead of text (output and logs).
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a workflow remotely and pull its images back locally.
    Execute {
        /// Workflow JSON file (API format, or a file with an `output`/`prompt` key).
        workflow: PathBuf,

        /// GPU class to use; becomes the saved selection.
        #[arg(long, value_name = "CLASS")]
        gpu: Option<String>,

        /// Instance count for the chosen class.
        #[arg(long, value_name = "N")]
        count: Option<u32>,
    },

    /// Make sure a model exists on the bridge, downloading it if needed.
    EnsureModel {
        /// Model descriptor, e.g. "checkpoints / sdxl.safetensors".
        descriptor: String,

        /// HTTP(S) URL to download the model from.
        url: String,
    },

    /// Show or change the GPU selection.
    Gpu {
        #[command(subcommand)]
        action: GpuAction,
    },

    /// Check the bridge's health.
    Health,

    /// List jobs currently running on the backend.
    Queue,

    /// List completed executions.
    History,
}

#[derive(Debug, Subcommand)]
pub enum GpuAction {
    /// Show the catalog and the current selection.
    Show,

    /// Make a GPU class active.
    Select { class: String },

    /// Set the instance count for a GPU class.
    Set { class: String, count: u32 },
}
