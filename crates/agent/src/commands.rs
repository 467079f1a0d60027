//! Command handlers. Results go to stdout; progress and logs go to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gpurelay_bridge::api::BridgeApi;
use gpurelay_bridge::dispatcher::ExecutionReport;
use gpurelay_bridge::events::{EventHub, RelayEvent};
use gpurelay_bridge::models::Availability;
use gpurelay_bridge::selection::{JsonFileStore, SelectionState};
use gpurelay_bridge::{Relay, RelayConfig};
use gpurelay_core::job::ProgressReport;
use gpurelay_core::selection::{ResourceSelection, GPU_CATALOG};
use serde_json::{json, Value};

use crate::cli::{Cli, Command, GpuAction};

/// Dispatch a parsed command line.
pub async fn run(cli: Cli, config: RelayConfig) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Command::Execute {
            workflow,
            gpu,
            count,
        } => execute(&config, &workflow, gpu, count, json).await,
        Command::EnsureModel { descriptor, url } => {
            ensure_model(&config, &descriptor, &url, json).await
        }
        Command::Gpu { action } => gpu(&config, action, json),
        Command::Health => health(&config, json).await,
        Command::Queue => queue(&config, json).await,
        Command::History => history(&config, json).await,
    }
}

// ---------------------------------------------------------------------------
// Workflow loading
// ---------------------------------------------------------------------------

/// Read a workflow file and return the executable prompt inside it.
pub fn load_workflow(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("workflow {} is not valid JSON", path.display()))?;
    Ok(extract_prompt(value))
}

/// Unwrap a prompt saved under an `output` or `prompt` key; otherwise the
/// document is taken to be the prompt itself.
pub fn extract_prompt(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in ["output", "prompt"] {
                if map.get(key).is_some_and(Value::is_object) {
                    return map.remove(key).unwrap_or_default();
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

async fn execute(
    config: &RelayConfig,
    path: &Path,
    gpu: Option<String>,
    count: Option<u32>,
    json: bool,
) -> Result<()> {
    let workflow = load_workflow(path)?;
    let relay = Relay::from_config(config)?;

    if let Some(class) = gpu.as_deref() {
        relay.select_gpu(class)?;
    }
    if let Some(count) = count {
        let class = gpu.unwrap_or_else(|| relay.selection().current().active_class().to_string());
        relay.set_gpu_count(&class, count)?;
    }

    let printer = (!json).then(|| spawn_progress_printer(relay.events()));
    let sweeper = relay.start_sweeper();

    let result = relay.execute(&workflow).await;

    if !relay.ledger().is_empty() {
        let summary = relay.sweeper().sweep_once().await;
        tracing::info!(still_pending = summary.still_pending, "Final cleanup sweep");
    }
    relay.shutdown();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Cleanup sweeper ended abnormally");
    }
    if let Some(printer) = printer {
        printer.abort();
    }

    let report = result?;
    print_report(&report, json)
}

fn spawn_progress_printer(events: &Arc<EventHub>) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(stamped) = rx.recv().await {
            match stamped.event {
                RelayEvent::ExecutionStarted { job_id, gpu_type } => {
                    eprintln!("Started {job_id} on {gpu_type}");
                }
                RelayEvent::ExecutionProgress {
                    percent, message, ..
                } => eprintln!("[{percent:>3}%] {message}"),
                RelayEvent::ArtifactReconciled {
                    filename, state, ..
                } => eprintln!("  {filename}: {}", state.as_str()),
                _ => {}
            }
        }
    })
}

fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        let value = json!({
            "job_id": report.job_id,
            "gpu_type": report.gpu_type,
            "message": report.message,
            "processed": report.processed(),
            "artifacts": report.artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{} finished on {}: {} of {} images registered",
        report.job_id,
        report.gpu_type,
        report.processed(),
        report.artifacts.len()
    );
    for artifact in &report.artifacts {
        match &artifact.error {
            Some(error) => println!("  {} [{}] {error}", artifact.filename, artifact.state.as_str()),
            None => println!("  {} [{}]", artifact.filename, artifact.state.as_str()),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ensure-model
// ---------------------------------------------------------------------------

async fn ensure_model(config: &RelayConfig, descriptor: &str, url: &str, json: bool) -> Result<()> {
    let relay = Relay::from_config(config)?;
    let availability = relay
        .ensure_model(descriptor, url, |report: &ProgressReport| {
            if !json {
                eprintln!(
                    "[{:>3}%] {}",
                    report.percent.unwrap_or_default(),
                    report.message_or_empty()
                );
            }
        })
        .await?;
    relay.shutdown();

    let (status, detail) = describe_availability(&availability);
    if json {
        println!("{}", json!({ "model": descriptor, "status": status, "detail": detail }));
    } else {
        println!("{descriptor}: {status}{}", detail.map(|d| format!(" ({d})")).unwrap_or_default());
    }

    if !availability.is_available() {
        bail!("model {descriptor} is not available: {status}");
    }
    Ok(())
}

/// Short status word plus optional detail for an availability outcome.
pub fn describe_availability(availability: &Availability) -> (&'static str, Option<String>) {
    match availability {
        Availability::AlreadyAvailable { size_gb } => {
            ("already_available", size_gb.map(|gb| format!("{gb:.2} GB")))
        }
        Availability::Downloaded { message, .. } => ("downloaded", Some(message.clone())),
        Availability::Failed { message } => ("failed", Some(message.clone())),
        Availability::TimedOut { attempts, .. } => {
            ("timed_out", Some(format!("after {attempts} polls")))
        }
        Availability::Cancelled => ("cancelled", None),
        Availability::InFlight => ("in_flight", None),
    }
}

// ---------------------------------------------------------------------------
// gpu
// ---------------------------------------------------------------------------

fn gpu(config: &RelayConfig, action: GpuAction, json: bool) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(config.selection_file.clone()));
    let state = SelectionState::load(store, Arc::new(EventHub::default()));

    match action {
        GpuAction::Show => {}
        GpuAction::Select { class } => {
            state.select(&class)?;
        }
        GpuAction::Set { class, count } => {
            let stored = state.set_count(&class, count)?;
            if stored != count {
                tracing::warn!(class = %class, requested = count, stored, "Count clamped to class maximum");
            }
        }
    }

    print_selection(&state.current(), json)
}

fn print_selection(selection: &ResourceSelection, json: bool) -> Result<()> {
    let (active, count) = selection.current();
    if json {
        let value = json!({
            "active_gpu": active,
            "count": count,
            "estimated_cost_per_second": selection.estimated_cost_per_second(),
            "gpu_counts": selection.counts(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for gpu in GPU_CATALOG {
        let marker = if gpu.value == active { "*" } else { " " };
        println!(
            "{marker} {:<10} {:<16} ${:.6}/s  {}/{}",
            gpu.value,
            gpu.name,
            gpu.price_per_second,
            selection.count(gpu.value),
            gpu.max_count
        );
    }
    println!(
        "Active: {active} x{count} (~${:.6}/s)",
        selection.estimated_cost_per_second()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// health / queue / history
// ---------------------------------------------------------------------------

fn bridge(config: &RelayConfig) -> Result<BridgeApi> {
    Ok(BridgeApi::new(&config.bridge_api_url, config.request_timeout())?)
}

async fn health(config: &RelayConfig, json: bool) -> Result<()> {
    let health = bridge(config)?
        .health()
        .await
        .with_context(|| format!("bridge at {} is unreachable", config.bridge_api_url))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        println!("Bridge: {}", health.status);
        if let Some(message) = &health.message {
            println!("  {message}");
        }
        if let Some(modal) = &health.modal_status {
            println!("  backend: {modal}");
        }
        if !health.available_gpus.is_empty() {
            println!("  GPUs: {}", health.available_gpus.join(", "));
        }
    }
    Ok(())
}

async fn queue(config: &RelayConfig, json: bool) -> Result<()> {
    let queue = bridge(config)?.queue().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&queue)?);
        return Ok(());
    }
    if queue.queue.is_empty() {
        println!("No jobs running");
    }
    for entry in &queue.queue {
        println!(
            "{}  {}  {}",
            entry.task_id,
            entry.gpu_type.as_deref().unwrap_or("-"),
            entry.status.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn history(config: &RelayConfig, json: bool) -> Result<()> {
    let history = bridge(config)?.history().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.history.is_empty() {
        println!("No completed executions");
    }
    for entry in &history.history {
        println!(
            "{}  {}  {}  {} images",
            entry.task_id,
            entry.gpu_type.as_deref().unwrap_or("-"),
            entry.completed_at.as_deref().unwrap_or("-"),
            entry.images.len()
        );
    }
    Ok(())
}
