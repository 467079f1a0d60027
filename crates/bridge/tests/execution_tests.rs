//! End-to-end execution tests: submit, watch, reconcile, sweep.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{count_prefix, entries, new_log, CallLog, Completion, FakeBackend, FakeHost};
use gpurelay_bridge::api::SubmitResponse;
use gpurelay_bridge::config::RelayConfig;
use gpurelay_bridge::dispatcher::{DispatchError, Dispatcher};
use gpurelay_bridge::events::{EventHub, RelayEvent, Stamped};
use gpurelay_bridge::poller::{JobPoller, PollConfig};
use gpurelay_bridge::reconcile::{CleanupLedger, ReconcileConfig, ReconciliationPipeline};
use gpurelay_bridge::selection::MemoryStore;
use gpurelay_bridge::sweep::CleanupSweeper;
use gpurelay_bridge::Relay;
use gpurelay_core::artifact::ArtifactState;
use gpurelay_core::job::ProgressReport;
use gpurelay_core::selection::ResourceSelection;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct Harness {
    log: CallLog,
    backend: Arc<FakeBackend>,
    host: Arc<FakeHost>,
    events: Arc<EventHub>,
    ledger: Arc<CleanupLedger>,
    dispatcher: Dispatcher,
}

fn harness_with(poll: PollConfig) -> Harness {
    let log = new_log();
    let backend = Arc::new(FakeBackend::new(log.clone()));
    let host = Arc::new(FakeHost::new(log.clone()));
    let events = Arc::new(EventHub::default());
    let ledger = Arc::new(CleanupLedger::new());

    let pipeline = Arc::new(ReconciliationPipeline::new(
        backend.clone(),
        host.clone(),
        ledger.clone(),
        events.clone(),
        ReconcileConfig::default(),
    ));
    let dispatcher = Dispatcher::new(
        backend.clone(),
        host.clone(),
        JobPoller::new(backend.clone()),
        pipeline,
        events.clone(),
        poll,
    );

    Harness {
        log,
        backend,
        host,
        events,
        ledger,
        dispatcher,
    }
}

fn harness() -> Harness {
    harness_with(PollConfig::every(Duration::from_millis(2000)))
}

fn workflow() -> serde_json::Value {
    json!({
        "3": { "class_type": "KSampler", "inputs": { "seed": 1 } },
        "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0] } }
    })
}

fn script_success(backend: &FakeBackend, images: &[&str]) {
    backend.script_progress(
        "exec-1",
        vec![
            Ok(ProgressReport::new(45, "Processing...")),
            Ok(ProgressReport::new(100, "Done").with_images(images.iter().copied())),
        ],
    );
}

/// A pipeline on its own, without the dispatcher's polling in front.
fn pipeline(completion: Completion) -> (CallLog, ReconciliationPipeline) {
    let log = new_log();
    let host = Arc::new(FakeHost::new(log.clone()));
    host.set_completion(completion);
    let pipeline = ReconciliationPipeline::new(
        Arc::new(FakeBackend::new(log.clone())),
        host,
        Arc::new(CleanupLedger::new()),
        Arc::new(EventHub::default()),
        ReconcileConfig::default(),
    );
    (log, pipeline)
}

fn drain(rx: &mut broadcast::Receiver<Stamped>) -> Vec<RelayEvent> {
    let mut out = Vec::new();
    while let Ok(stamped) = rx.try_recv() {
        out.push(stamped.event);
    }
    out
}

// ---------------------------------------------------------------------------
// Test: two artifacts are reconciled strictly in order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn completed_execution_reconciles_artifacts_in_order() {
    let h = harness();
    script_success(&h.backend, &["a.png", "b.png"]);
    let mut rx = h.events.subscribe();

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.job_id, "exec-1");
    assert_eq!(report.gpu_type, "T4");
    assert_eq!(report.processed(), 2);
    assert!(report
        .artifacts
        .iter()
        .all(|a| a.state == ArtifactState::CleanedUp));

    assert_eq!(
        entries(&h.log),
        vec![
            "execute T4",
            "progress exec-1",
            "progress exec-1",
            "fetch a.png",
            "prompt a.png",
            "await p-1",
            "delete a.png",
            "fetch b.png",
            "prompt b.png",
            "await p-2",
            "delete b.png",
            "refresh",
        ]
    );

    let events = drain(&mut rx);
    let progress: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            RelayEvent::ExecutionProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![45, 100]);
    assert!(events.iter().any(|e| matches!(
        e,
        RelayEvent::ArtifactsReady { job_id, filenames }
            if job_id == "exec-1" && filenames == &["a.png", "b.png"]
    )));
    assert!(h.dispatcher.active_execution().is_none());
}

#[tokio::test(start_paused = true)]
async fn confirmed_gpu_type_overrides_requested() {
    let h = harness();
    h.backend.set_execute_reply(SubmitResponse {
        status: "started".into(),
        task_id: Some("exec-1".into()),
        gpu_type: Some("A100".into()),
        ..Default::default()
    });
    script_success(&h.backend, &[]);

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.gpu_type, "A100");
    assert!(report.artifacts.is_empty());
    assert_eq!(count_prefix(&h.log, "fetch"), 0);
}

// ---------------------------------------------------------------------------
// Test: remote failure never invokes the pipeline
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_execution_skips_reconciliation() {
    let h = harness();
    h.backend
        .script_progress("exec-1", vec![Ok(ProgressReport::new(0, "Error: out of memory"))]);
    let mut rx = h.events.subscribe();

    let result = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await;

    assert_matches!(
        result,
        Err(DispatchError::JobFailed { job_id, message })
            if job_id == "exec-1" && message == "Error: out of memory"
    );
    assert_eq!(count_prefix(&h.log, "fetch"), 0);
    assert_eq!(count_prefix(&h.log, "refresh"), 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, RelayEvent::ExecutionFailed { .. })));
    assert!(h.dispatcher.active_execution().is_none());
}

#[tokio::test(start_paused = true)]
async fn bounded_watch_times_out() {
    let h = harness_with(PollConfig::every(Duration::from_millis(2000)).with_max_attempts(Some(2)));
    h.backend
        .script_progress("exec-1", vec![Ok(ProgressReport::new(30, "Running"))]);

    let result = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await;

    assert_matches!(result, Err(DispatchError::TimedOut { attempts: 2, .. }));
}

// ---------------------------------------------------------------------------
// Test: invalid submissions are rejected locally
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_workflow_is_rejected_before_submission() {
    let h = harness();

    let result = h
        .dispatcher
        .execute(&json!({}), &ResourceSelection::default())
        .await;

    assert_matches!(result, Err(DispatchError::Rejected(_)));
    assert!(entries(&h.log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_instances_is_rejected_before_submission() {
    let h = harness();
    let mut selection = ResourceSelection::default();
    selection.set_count("T4", 0).unwrap();

    let result = h.dispatcher.execute(&workflow(), &selection).await;

    assert_matches!(result, Err(DispatchError::Rejected(_)));
    assert!(entries(&h.log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn backend_refusal_is_surfaced() {
    let h = harness();
    h.backend.set_execute_reply(SubmitResponse {
        status: "error".into(),
        error: Some("Modal is not connected".into()),
        ..Default::default()
    });

    let result = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await;

    assert_matches!(
        result,
        Err(DispatchError::NotStarted { message, .. }) if message == "Modal is not connected"
    );
    assert_eq!(count_prefix(&h.log, "progress"), 0);
}

// ---------------------------------------------------------------------------
// Test: per-artifact failures halt only that artifact
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fetch_failure_skips_to_next_artifact() {
    let h = harness();
    script_success(&h.backend, &["a.png", "b.png"]);
    h.backend.fail_fetch("a.png");

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.artifacts[0].state, ArtifactState::NotStarted);
    assert!(report.artifacts[0].error.is_some());
    assert_eq!(report.artifacts[1].state, ArtifactState::CleanedUp);
    assert_eq!(report.processed(), 1);
    assert_eq!(count_prefix(&h.log, "prompt a.png"), 0);
    assert_eq!(count_prefix(&h.log, "delete a.png"), 0);
}

#[tokio::test(start_paused = true)]
async fn injection_failure_leaves_temp_copy() {
    let h = harness();
    script_success(&h.backend, &["a.png", "b.png"]);
    h.host.reject_prompt_for("b.png");

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.artifacts[0].state, ArtifactState::CleanedUp);
    assert_eq!(report.artifacts[1].state, ArtifactState::Downloaded);
    assert_eq!(count_prefix(&h.log, "delete b.png"), 0);
}

#[tokio::test(start_paused = true)]
async fn unsafe_filename_is_never_fetched() {
    let h = harness();
    script_success(&h.backend, &["../etc/passwd", "ok.png"]);

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.artifacts[0].state, ArtifactState::NotStarted);
    assert_eq!(report.processed(), 1);
    assert_eq!(count_prefix(&h.log, "fetch"), 1);
}

// ---------------------------------------------------------------------------
// Test: settle step
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unsupported_completion_falls_back_to_settle_delay() {
    let h = harness();
    script_success(&h.backend, &["a.png"]);
    h.host.set_completion(Completion::Unsupported);

    let started = tokio::time::Instant::now();
    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    // Two 2000 ms polls, then the 500 ms settle delay.
    assert!(started.elapsed() >= Duration::from_millis(4500));
    assert_eq!(report.processed(), 1);
}

#[tokio::test(start_paused = true)]
async fn confirmed_completion_deletes_without_settle_delay() {
    let (log, pipeline) = pipeline(Completion::Succeeds);

    let started = tokio::time::Instant::now();
    let artifacts = pipeline.reconcile("exec-1", &["a.png".to_string()]).await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(artifacts[0].state, ArtifactState::CleanedUp);
    assert_eq!(count_prefix(&log, "delete a.png"), 1);
}

#[tokio::test(start_paused = true)]
async fn unsupported_completion_waits_settle_delay_before_delete() {
    let (log, pipeline) = pipeline(Completion::Unsupported);

    let started = tokio::time::Instant::now();
    pipeline.reconcile("exec-1", &["a.png".to_string()]).await;

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(count_prefix(&log, "delete a.png"), 1);
}

#[tokio::test(start_paused = true)]
async fn host_fault_during_completion_still_waits_settle_delay() {
    let (log, pipeline) = pipeline(Completion::Unavailable);

    let started = tokio::time::Instant::now();
    let artifacts = pipeline.reconcile("exec-1", &["a.png".to_string()]).await;

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(
        entries(&log),
        vec!["fetch a.png", "prompt a.png", "await p-1", "delete a.png"]
    );
    assert_eq!(artifacts[0].state, ArtifactState::CleanedUp);
}

#[tokio::test(start_paused = true)]
async fn hung_registration_is_bounded_then_deleted() {
    let h = harness();
    script_success(&h.backend, &["a.png"]);
    h.host.set_completion(Completion::Hangs);

    let started = tokio::time::Instant::now();
    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(report.artifacts[0].state, ArtifactState::CleanedUp);
    assert_eq!(count_prefix(&h.log, "delete a.png"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_registration_still_deletes() {
    let h = harness();
    script_success(&h.backend, &["a.png"]);
    h.host.set_completion(Completion::Fails);

    let started = tokio::time::Instant::now();
    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(4500));
    assert_eq!(report.artifacts[0].state, ArtifactState::CleanedUp);
}

// ---------------------------------------------------------------------------
// Test: cleanup failures go to the ledger and the sweeper retries them
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cleanup_failure_is_recorded_and_swept() {
    let h = harness();
    script_success(&h.backend, &["a.png", "b.png"]);
    h.backend.fail_delete("a.png", 500);

    let report = h
        .dispatcher
        .execute(&workflow(), &ResourceSelection::default())
        .await
        .unwrap();

    assert_eq!(report.artifacts[0].state, ArtifactState::CleanupFailed);
    assert_eq!(report.processed(), 2);
    assert_eq!(h.ledger.pending(), vec!["a.png"]);

    let sweeper = CleanupSweeper::new(
        h.backend.clone(),
        h.ledger.clone(),
        h.events.clone(),
        Duration::from_secs(60),
    );

    let summary = sweeper.sweep_once().await;
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.cleaned, 0);
    assert_eq!(summary.still_pending, 1);

    h.backend.allow_delete("a.png");
    let summary = sweeper.sweep_once().await;
    assert_eq!(summary.cleaned, 1);
    assert!(h.ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweeper_treats_missing_file_as_cleaned() {
    let log = new_log();
    let backend = Arc::new(FakeBackend::new(log.clone()));
    let ledger = Arc::new(CleanupLedger::new());
    ledger.record("gone.png");
    backend.fail_delete("gone.png", 404);

    let sweeper = CleanupSweeper::new(
        backend,
        ledger.clone(),
        Arc::new(EventHub::default()),
        Duration::from_secs(60),
    );

    assert_eq!(sweeper.sweep_once().await.cleaned, 1);
    assert!(ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn spawned_sweeper_runs_on_interval_until_cancelled() {
    let log = new_log();
    let backend = Arc::new(FakeBackend::new(log.clone()));
    let ledger = Arc::new(CleanupLedger::new());
    ledger.record("late.png");

    let sweeper = Arc::new(CleanupSweeper::new(
        backend,
        ledger.clone(),
        Arc::new(EventHub::default()),
        Duration::from_secs(60),
    ));
    let cancel = CancellationToken::new();
    let handle = sweeper.spawn(cancel.clone());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count_prefix(&log, "delete"), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(count_prefix(&log, "delete late.png"), 1);
    assert!(ledger.is_empty());

    cancel.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: relay wiring uses the live selection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn relay_executes_with_current_selection() {
    let log = new_log();
    let backend = Arc::new(FakeBackend::new(log.clone()));
    let host = Arc::new(FakeHost::new(log.clone()));
    script_success(&backend, &["a.png"]);

    let relay = Relay::new(
        &RelayConfig::default(),
        backend,
        host,
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(relay.set_gpu_count("H100", 2).unwrap(), 2);

    let selection = relay.selection().current();
    assert_eq!(selection.count("T4"), 0);
    assert_eq!(selection.current(), ("H100", 2));

    let report = relay.execute(&workflow()).await.unwrap();
    assert_eq!(report.processed(), 1);
    assert_eq!(entries(&log)[0], "execute H100");

    relay.shutdown();
}
