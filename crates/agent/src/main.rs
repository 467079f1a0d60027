//! `gpurelay-agent` -- run ComfyUI workflows on a remote GPU bridge.
//!
//! # Environment variables
//!
//! | Variable                        | Default                   | Description                          |
//! |---------------------------------|---------------------------|--------------------------------------|
//! | `BRIDGE_API_URL`                | `http://127.0.0.1:5001`   | Remote GPU bridge                    |
//! | `COMFYUI_URL`                   | `http://127.0.0.1:8188`   | Local ComfyUI host                   |
//! | `SELECTION_FILE`                | `gpurelay-selection.json` | Saved GPU selection                  |
//! | `RUST_LOG`                      | see [`logging`]           | Log filter                           |
//!
//! See `RelayConfig::from_env` for the polling and timeout knobs.

use clap::Parser;
use gpurelay_agent::cli::Cli;
use gpurelay_agent::{commands, logging};
use gpurelay_bridge::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init_tracing(cli.json);

    let config = RelayConfig::from_env()?;
    tracing::debug!(
        bridge = %config.bridge_api_url,
        host = %config.comfyui_url,
        "Configuration loaded",
    );

    commands::run(cli, config).await
}
