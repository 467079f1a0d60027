use std::path::PathBuf;
use std::time::Duration;

use gpurelay_core::error::CoreError;

use crate::poller::PollConfig;
use crate::reconcile::ReconcileConfig;

/// Relay configuration loaded from environment variables.
///
/// All fields have defaults suitable for a bridge and host running on the
/// same machine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the remote GPU bridge.
    pub bridge_api_url: String,
    /// Base URL of the local ComfyUI host.
    pub comfyui_url: String,
    /// Per-request HTTP timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Download progress poll interval in milliseconds (default: `1000`).
    pub poll_interval_ms: u64,
    /// Execution progress poll interval in milliseconds (default: `2000`).
    pub execution_poll_interval_ms: u64,
    /// Fallback wait after a registration prompt, in milliseconds (default: `500`).
    pub settle_delay_ms: u64,
    /// Bound on waiting for a registration prompt, in seconds (default: `30`).
    pub local_completion_timeout_secs: u64,
    /// Maximum polls per job. `None` polls until terminal.
    pub watch_max_attempts: Option<u32>,
    /// Seconds between cleanup sweeps (default: `60`).
    pub cleanup_sweep_interval_secs: u64,
    /// Where the GPU selection is persisted.
    pub selection_file: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bridge_api_url: "http://127.0.0.1:5001".into(),
            comfyui_url: "http://127.0.0.1:8188".into(),
            request_timeout_secs: 30,
            poll_interval_ms: 1000,
            execution_poll_interval_ms: 2000,
            settle_delay_ms: 500,
            local_completion_timeout_secs: 30,
            watch_max_attempts: None,
            cleanup_sweep_interval_secs: 60,
            selection_file: PathBuf::from("gpurelay-selection.json"),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                         | Default                    |
    /// |---------------------------------|----------------------------|
    /// | `BRIDGE_API_URL`                | `http://127.0.0.1:5001`    |
    /// | `COMFYUI_URL`                   | `http://127.0.0.1:8188`    |
    /// | `REQUEST_TIMEOUT_SECS`          | `30`                       |
    /// | `POLL_INTERVAL_MS`              | `1000`                     |
    /// | `EXECUTION_POLL_INTERVAL_MS`    | `2000`                     |
    /// | `SETTLE_DELAY_MS`               | `500`                      |
    /// | `LOCAL_COMPLETION_TIMEOUT_SECS` | `30`                       |
    /// | `WATCH_MAX_ATTEMPTS`            | unset (unbounded)          |
    /// | `CLEANUP_SWEEP_INTERVAL_SECS`   | `60`                       |
    /// | `SELECTION_FILE`                | `gpurelay-selection.json`  |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();
        let get = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            bridge_api_url: get("BRIDGE_API_URL").unwrap_or(defaults.bridge_api_url),
            comfyui_url: get("COMFYUI_URL").unwrap_or(defaults.comfyui_url),
            request_timeout_secs: parse_or(&get, "REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            poll_interval_ms: parse_or(&get, "POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            execution_poll_interval_ms: parse_or(
                &get,
                "EXECUTION_POLL_INTERVAL_MS",
                defaults.execution_poll_interval_ms,
            )?,
            settle_delay_ms: parse_or(&get, "SETTLE_DELAY_MS", defaults.settle_delay_ms)?,
            local_completion_timeout_secs: parse_or(
                &get,
                "LOCAL_COMPLETION_TIMEOUT_SECS",
                defaults.local_completion_timeout_secs,
            )?,
            watch_max_attempts: get("WATCH_MAX_ATTEMPTS")
                .map(|v| parse_value::<u32>("WATCH_MAX_ATTEMPTS", &v))
                .transpose()?,
            cleanup_sweep_interval_secs: parse_or(
                &get,
                "CLEANUP_SWEEP_INTERVAL_SECS",
                defaults.cleanup_sweep_interval_secs,
            )?,
            selection_file: get("SELECTION_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.selection_file),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_poll_config(&self) -> PollConfig {
        PollConfig::every(Duration::from_millis(self.poll_interval_ms))
            .with_max_attempts(self.watch_max_attempts)
    }

    pub fn execution_poll_config(&self) -> PollConfig {
        PollConfig::every(Duration::from_millis(self.execution_poll_interval_ms))
            .with_max_attempts(self.watch_max_attempts)
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            completion_timeout: Duration::from_secs(self.local_completion_timeout_secs),
        }
    }

    pub fn cleanup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_sweep_interval_secs)
    }

    fn validate(&self) -> Result<(), CoreError> {
        for (key, url) in [
            ("BRIDGE_API_URL", &self.bridge_api_url),
            ("COMFYUI_URL", &self.comfyui_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(CoreError::Validation(format!(
                    "{key} must be an http(s) URL, got: '{url}'"
                )));
            }
        }
        for (key, value) in [
            ("REQUEST_TIMEOUT_SECS", self.request_timeout_secs),
            ("LOCAL_COMPLETION_TIMEOUT_SECS", self.local_completion_timeout_secs),
            ("POLL_INTERVAL_MS", self.poll_interval_ms),
            ("EXECUTION_POLL_INTERVAL_MS", self.execution_poll_interval_ms),
            ("CLEANUP_SWEEP_INTERVAL_SECS", self.cleanup_sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(CoreError::Validation(format!("{key} must be greater than 0")));
            }
        }
        if self.watch_max_attempts == Some(0) {
            return Err(CoreError::Validation(
                "WATCH_MAX_ATTEMPTS must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, CoreError> {
    raw.parse().map_err(|_| {
        CoreError::Validation(format!("{key} must be a non-negative integer, got: '{raw}'"))
    })
}
