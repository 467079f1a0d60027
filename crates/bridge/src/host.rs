//! REST client for the local ComfyUI host.
//!
//! The relay needs three things from the host editor: queue a prompt,
//! learn when that prompt has finished, and nudge the host to reload its
//! output history. [`LocalHost`] names that seam; [`ComfyHost`] implements
//! it against the ComfyUI HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// How often [`ComfyHost::await_completion`] re-reads `/history/{prompt_id}`.
const HISTORY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Number of history entries requested when refreshing output views.
const REFRESH_HISTORY_ITEMS: u32 = 64;

/// Response returned by `/prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct PromptResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

/// Errors from the local host layer.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The HTTP request itself failed.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The host returned a non-2xx status code.
    #[error("Host API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// The host ran the prompt and reported an error.
    #[error("Local job {prompt_id} failed: {message}")]
    ExecutionFailed { prompt_id: String, message: String },

    /// This host cannot signal prompt completion.
    #[error("Host does not report prompt completion")]
    CompletionUnsupported,
}

/// Operations the relay needs from the local host editor.
#[async_trait]
pub trait LocalHost: Send + Sync {
    /// Queue a workflow locally. Returns the host's prompt id.
    async fn submit_prompt(&self, workflow: &serde_json::Value) -> Result<String, HostError>;

    /// Resolve once the prompt has finished executing.
    ///
    /// Implementations that cannot observe completion return
    /// [`HostError::CompletionUnsupported`] immediately.
    async fn await_completion(&self, prompt_id: &str) -> Result<(), HostError>;

    /// Ask the host to re-synchronize its output views.
    async fn refresh_outputs(&self) -> Result<(), HostError>;
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyHost {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyHost {
    /// Create a client for the host at `api_url` (e.g. `http://127.0.0.1:8188`).
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /history/{prompt_id}`. The returned JSON is keyed by prompt id
    /// and only contains the prompt once it has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, HostError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, HostError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(HostError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HostError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Inspect one `/history/{prompt_id}` payload.
///
/// Returns `None` while the prompt is still queued or running, and
/// `Some(Err(message))` when the host recorded an execution error.
pub fn history_outcome(history: &serde_json::Value, prompt_id: &str) -> Option<Result<(), String>> {
    let entry = history.get(prompt_id)?;
    let status = &entry["status"];
    if status["status_str"] == "error" {
        let message = status["messages"]
            .as_array()
            .and_then(|msgs| {
                msgs.iter()
                    .find(|m| m[0] == "execution_error")
                    .and_then(|m| m[1]["exception_message"].as_str())
            })
            .unwrap_or("execution error")
            .to_string();
        return Some(Err(message));
    }
    Some(Ok(()))
}

#[async_trait]
impl LocalHost for ComfyHost {
    async fn submit_prompt(&self, workflow: &serde_json::Value) -> Result<String, HostError> {
        let client_id = format!("gpurelay-register-{}", uuid::Uuid::new_v4());
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let queued: PromptResponse = Self::parse_response(response).await?;
        tracing::debug!(
            prompt_id = %queued.prompt_id,
            queue_position = queued.number,
            "Prompt queued on local host",
        );
        Ok(queued.prompt_id)
    }

    /// Polls `/history/{prompt_id}` until the prompt shows up. Faults on
    /// individual polls are logged and retried; callers bound the wait.
    async fn await_completion(&self, prompt_id: &str) -> Result<(), HostError> {
        loop {
            match self.get_history(prompt_id).await {
                Ok(history) => match history_outcome(&history, prompt_id) {
                    Some(Ok(())) => return Ok(()),
                    Some(Err(message)) => {
                        return Err(HostError::ExecutionFailed {
                            prompt_id: prompt_id.to_string(),
                            message,
                        })
                    }
                    None => {}
                },
                Err(e) => {
                    tracing::warn!(prompt_id, error = %e, "History poll failed, retrying");
                }
            }
            tokio::time::sleep(HISTORY_POLL_INTERVAL).await;
        }
    }

    async fn refresh_outputs(&self) -> Result<(), HostError> {
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .query(&[("max_items", REFRESH_HISTORY_ITEMS)])
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }
}
