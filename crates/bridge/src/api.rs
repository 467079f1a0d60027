//! REST client for the remote GPU bridge.
//!
//! [`BridgeBackend`] is the seam the orchestration code talks to;
//! [`BridgeApi`] implements it over HTTP using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use gpurelay_core::job::ProgressReport;
use gpurelay_core::model_asset::ModelAsset;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Response from `/execute_workflow` and `/download_model`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResponse {
    /// `"started"`, `"already_exists"` or `"error"`.
    #[serde(default)]
    pub status: String,
    /// Backend-assigned job id, present when started.
    #[serde(default)]
    pub task_id: Option<String>,
    /// GPU class the backend actually scheduled on (executions only).
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubmitResponse {
    /// Best human-readable explanation the backend gave.
    pub fn reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| format!("unexpected status '{}'", self.status))
    }
}

/// Response from `/check_model`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckModelResponse {
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub size_gb: Option<f64>,
}

/// Response from `/get_image/{filename}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchArtifactResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// Where the bridge stored the temporary copy.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FetchArtifactResponse {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }
}

/// Response from `/delete_temp/{filename}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteTempResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response from `/health`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub modal_status: Option<String>,
    #[serde(default)]
    pub available_gpus: Vec<String>,
    #[serde(default)]
    pub local_output_dir: Option<String>,
}

/// One job in the backend's run queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueEntry {
    pub task_id: String,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response from `/modal_queue`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub count: usize,
}

/// One completed execution in the backend's history.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Response from `/gpu_history`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub count: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the bridge REST layer.
#[derive(Debug, thiserror::Error)]
pub enum BridgeApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The bridge returned a non-2xx status code.
    #[error("Bridge API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The configured base URL cannot carry path segments.
    #[error("Invalid bridge URL: {0}")]
    InvalidUrl(String),
}

impl BridgeApiError {
    /// HTTP status for [`BridgeApiError::ApiError`], if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::InvalidUrl(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Operations the relay needs from the remote bridge.
#[async_trait]
pub trait BridgeBackend: Send + Sync {
    /// `POST /execute_workflow`.
    async fn execute_workflow(
        &self,
        workflow: &serde_json::Value,
        gpu_type: &str,
    ) -> Result<SubmitResponse, BridgeApiError>;

    /// `GET /progress/{task_id}`.
    async fn progress(&self, task_id: &str) -> Result<ProgressReport, BridgeApiError>;

    /// `GET /get_image/{filename}`: copy one artifact into temporary storage.
    async fn fetch_artifact(&self, filename: &str)
        -> Result<FetchArtifactResponse, BridgeApiError>;

    /// `DELETE /delete_temp/{filename}`.
    async fn delete_temp(&self, filename: &str) -> Result<DeleteTempResponse, BridgeApiError>;

    /// `POST /check_model`.
    async fn check_model(&self, asset: &ModelAsset) -> Result<CheckModelResponse, BridgeApiError>;

    /// `POST /download_model`.
    async fn download_model(
        &self,
        source_url: &str,
        asset: &ModelAsset,
    ) -> Result<SubmitResponse, BridgeApiError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for one bridge instance.
pub struct BridgeApi {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl BridgeApi {
    /// Create a client for the bridge at `api_url` (e.g. `http://127.0.0.1:5001`)
    /// with a per-request timeout.
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, BridgeApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(client, api_url)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: &str) -> Result<Self, BridgeApiError> {
        let base_url = reqwest::Url::parse(api_url)
            .map_err(|e| BridgeApiError::InvalidUrl(format!("{api_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BridgeApiError::InvalidUrl(api_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthResponse, BridgeApiError> {
        let response = self.client.get(self.endpoint(&["health"])?).send().await?;
        Self::parse_response(response).await
    }

    /// `GET /modal_queue`: jobs the backend is currently running.
    pub async fn queue(&self) -> Result<QueueResponse, BridgeApiError> {
        let response = self
            .client
            .get(self.endpoint(&["modal_queue"])?)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `GET /gpu_history`: completed executions, newest first.
    pub async fn history(&self) -> Result<HistoryResponse, BridgeApiError> {
        let response = self
            .client
            .get(self.endpoint(&["gpu_history"])?)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Join path segments onto the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, BridgeApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| BridgeApiError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// Ensure the response has a success status code.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BridgeApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BridgeApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BridgeApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl BridgeBackend for BridgeApi {
    async fn execute_workflow(
        &self,
        workflow: &serde_json::Value,
        gpu_type: &str,
    ) -> Result<SubmitResponse, BridgeApiError> {
        let body = serde_json::json!({
            "workflow": workflow,
            "gpu_type": gpu_type,
        });

        let response = self
            .client
            .post(self.endpoint(&["execute_workflow"])?)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn progress(&self, task_id: &str) -> Result<ProgressReport, BridgeApiError> {
        let response = self
            .client
            .get(self.endpoint(&["progress", task_id])?)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn fetch_artifact(
        &self,
        filename: &str,
    ) -> Result<FetchArtifactResponse, BridgeApiError> {
        let response = self
            .client
            .get(self.endpoint(&["get_image", filename])?)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn delete_temp(&self, filename: &str) -> Result<DeleteTempResponse, BridgeApiError> {
        let response = self
            .client
            .delete(self.endpoint(&["delete_temp", filename])?)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn check_model(&self, asset: &ModelAsset) -> Result<CheckModelResponse, BridgeApiError> {
        let response = self
            .client
            .post(self.endpoint(&["check_model"])?)
            .json(asset)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn download_model(
        &self,
        source_url: &str,
        asset: &ModelAsset,
    ) -> Result<SubmitResponse, BridgeApiError> {
        let body = serde_json::json!({
            "url": source_url,
            "subfolder": asset.subfolder,
            "filename": asset.filename,
        });

        let response = self
            .client
            .post(self.endpoint(&["download_model"])?)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> BridgeApi {
        BridgeApi::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn client_creation() {
        assert!(BridgeApi::new("http://127.0.0.1:5001", Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(BridgeApi::new("not a url", Duration::from_secs(30)).is_err());
    }

    #[test]
    fn rejects_non_hierarchical_base_url() {
        assert!(BridgeApi::new("mailto:ops@example.com", Duration::from_secs(30)).is_err());
    }

    #[test]
    fn endpoint_joins_segments() {
        let url = api("http://127.0.0.1:5001").endpoint(&["progress", "abc-123"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5001/progress/abc-123");
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let url = api("http://host:5001/bridge/").endpoint(&["health"]).unwrap();
        assert_eq!(url.as_str(), "http://host:5001/bridge/health");
    }

    #[test]
    fn endpoint_encodes_filenames() {
        let url = api("http://host:5001").endpoint(&["get_image", "my image#1.png"]).unwrap();
        assert_eq!(url.as_str(), "http://host:5001/get_image/my%20image%231.png");
    }

    #[test]
    fn submit_reason_prefers_message() {
        let response: SubmitResponse =
            serde_json::from_str(r#"{"status": "error", "message": "GPU 'X' not valid"}"#).unwrap();
        assert_eq!(response.reason(), "GPU 'X' not valid");

        let response: SubmitResponse = serde_json::from_str(r#"{"status": "weird"}"#).unwrap();
        assert_eq!(response.reason(), "unexpected status 'weird'");
    }

    #[test]
    fn fetch_response_success_flag() {
        let ok: FetchArtifactResponse =
            serde_json::from_str(r#"{"status": "success", "filename": "a.png", "path": "/out/a.png"}"#)
                .unwrap();
        assert!(ok.is_success());

        let failed: FetchArtifactResponse = serde_json::from_str(r#"{"error": "boom"}"#).unwrap();
        assert!(!failed.is_success());
    }

    #[test]
    fn api_error_exposes_status() {
        let err = BridgeApiError::ApiError {
            status: 404,
            body: "{}".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(BridgeApiError::InvalidUrl("x".into()).status(), None);
    }
}
