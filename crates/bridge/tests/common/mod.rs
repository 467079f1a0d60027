//! In-memory fakes for the bridge and the local host.
//!
//! Both fakes append to one shared call log so tests can assert the exact
//! interleaving of remote and local calls.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gpurelay_bridge::api::{
    BridgeApiError, BridgeBackend, CheckModelResponse, DeleteTempResponse, FetchArtifactResponse,
    SubmitResponse,
};
use gpurelay_bridge::host::{HostError, LocalHost};
use gpurelay_core::job::ProgressReport;
use gpurelay_core::model_asset::ModelAsset;

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn count_prefix(log: &CallLog, prefix: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .count()
}

fn api_error(status: u16) -> BridgeApiError {
    BridgeApiError::ApiError {
        status,
        body: format!("fake status {status}"),
    }
}

pub fn started(task_id: &str) -> SubmitResponse {
    SubmitResponse {
        status: "started".into(),
        task_id: Some(task_id.into()),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Fake bridge
// ---------------------------------------------------------------------------

/// Scripted [`BridgeBackend`].
///
/// Progress replies are consumed in order per job; the last one repeats
/// once the script runs out.
pub struct FakeBackend {
    log: CallLog,
    progress: Mutex<HashMap<String, VecDeque<Result<ProgressReport, u16>>>>,
    execute_reply: Mutex<SubmitResponse>,
    download_reply: Mutex<Result<SubmitResponse, u16>>,
    check_reply: Mutex<Result<CheckModelResponse, u16>>,
    fetch_failures: Mutex<HashSet<String>>,
    delete_failures: Mutex<HashMap<String, u16>>,
}

impl FakeBackend {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            progress: Mutex::new(HashMap::new()),
            execute_reply: Mutex::new(started("exec-1")),
            download_reply: Mutex::new(Ok(started("dl-1"))),
            check_reply: Mutex::new(Ok(CheckModelResponse::default())),
            fetch_failures: Mutex::new(HashSet::new()),
            delete_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn script_progress(&self, job_id: &str, replies: Vec<Result<ProgressReport, u16>>) {
        self.progress
            .lock()
            .unwrap()
            .insert(job_id.to_string(), replies.into());
    }

    pub fn set_execute_reply(&self, reply: SubmitResponse) {
        *self.execute_reply.lock().unwrap() = reply;
    }

    pub fn set_download_reply(&self, reply: Result<SubmitResponse, u16>) {
        *self.download_reply.lock().unwrap() = reply;
    }

    pub fn set_check_reply(&self, reply: Result<CheckModelResponse, u16>) {
        *self.check_reply.lock().unwrap() = reply;
    }

    pub fn fail_fetch(&self, filename: &str) {
        self.fetch_failures.lock().unwrap().insert(filename.into());
    }

    pub fn fail_delete(&self, filename: &str, status: u16) {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(filename.into(), status);
    }

    pub fn allow_delete(&self, filename: &str) {
        self.delete_failures.lock().unwrap().remove(filename);
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl BridgeBackend for FakeBackend {
    async fn execute_workflow(
        &self,
        _workflow: &serde_json::Value,
        gpu_type: &str,
    ) -> Result<SubmitResponse, BridgeApiError> {
        self.record(format!("execute {gpu_type}"));
        Ok(self.execute_reply.lock().unwrap().clone())
    }

    async fn progress(&self, task_id: &str) -> Result<ProgressReport, BridgeApiError> {
        self.record(format!("progress {task_id}"));
        let mut scripts = self.progress.lock().unwrap();
        let script = scripts
            .get_mut(task_id)
            .ok_or_else(|| api_error(404))?;
        let reply = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match reply {
            Some(Ok(report)) => Ok(report),
            Some(Err(status)) => Err(api_error(status)),
            None => Err(api_error(404)),
        }
    }

    async fn fetch_artifact(
        &self,
        filename: &str,
    ) -> Result<FetchArtifactResponse, BridgeApiError> {
        self.record(format!("fetch {filename}"));
        if self.fetch_failures.lock().unwrap().contains(filename) {
            return Err(api_error(500));
        }
        Ok(FetchArtifactResponse {
            status: Some("success".into()),
            filename: Some(filename.into()),
            path: Some(format!("/output/{filename}")),
            error: None,
        })
    }

    async fn delete_temp(&self, filename: &str) -> Result<DeleteTempResponse, BridgeApiError> {
        self.record(format!("delete {filename}"));
        if let Some(status) = self.delete_failures.lock().unwrap().get(filename) {
            return Err(api_error(*status));
        }
        Ok(DeleteTempResponse {
            status: Some("success".into()),
            message: Some(format!("Deleted: {filename}")),
        })
    }

    async fn check_model(&self, asset: &ModelAsset) -> Result<CheckModelResponse, BridgeApiError> {
        self.record(format!("check {asset}"));
        self.check_reply.lock().unwrap().clone().map_err(api_error)
    }

    async fn download_model(
        &self,
        _source_url: &str,
        asset: &ModelAsset,
    ) -> Result<SubmitResponse, BridgeApiError> {
        self.record(format!("download {asset}"));
        self.download_reply.lock().unwrap().clone().map_err(api_error)
    }
}

// ---------------------------------------------------------------------------
// Fake host
// ---------------------------------------------------------------------------

/// How [`FakeHost::await_completion`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeds,
    Fails,
    /// The host answers the completion query with a 503.
    Unavailable,
    Unsupported,
    /// Never resolves.
    Hangs,
}

pub struct FakeHost {
    log: CallLog,
    completion: Mutex<Completion>,
    reject_prompts: Mutex<HashSet<String>>,
    next_prompt: Mutex<u32>,
}

impl FakeHost {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            completion: Mutex::new(Completion::Succeeds),
            reject_prompts: Mutex::new(HashSet::new()),
            next_prompt: Mutex::new(0),
        }
    }

    pub fn set_completion(&self, completion: Completion) {
        *self.completion.lock().unwrap() = completion;
    }

    /// Fail registration prompts that load `filename`.
    pub fn reject_prompt_for(&self, filename: &str) {
        self.reject_prompts.lock().unwrap().insert(filename.into());
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl LocalHost for FakeHost {
    async fn submit_prompt(&self, workflow: &serde_json::Value) -> Result<String, HostError> {
        let filename = workflow["0"]["inputs"]["filename"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.record(format!("prompt {filename}"));
        if self.reject_prompts.lock().unwrap().contains(&filename) {
            return Err(HostError::ApiError {
                status: 400,
                body: "invalid prompt".into(),
            });
        }
        let mut next = self.next_prompt.lock().unwrap();
        *next += 1;
        Ok(format!("p-{next}"))
    }

    async fn await_completion(&self, prompt_id: &str) -> Result<(), HostError> {
        self.record(format!("await {prompt_id}"));
        let completion = *self.completion.lock().unwrap();
        match completion {
            Completion::Succeeds => Ok(()),
            Completion::Fails => Err(HostError::ExecutionFailed {
                prompt_id: prompt_id.into(),
                message: "loader failed".into(),
            }),
            Completion::Unavailable => Err(HostError::ApiError {
                status: 503,
                body: "service unavailable".into(),
            }),
            Completion::Unsupported => Err(HostError::CompletionUnsupported),
            Completion::Hangs => std::future::pending().await,
        }
    }

    async fn refresh_outputs(&self) -> Result<(), HostError> {
        self.record("refresh".into());
        Ok(())
    }
}
