//! Configuration for the orchestrator.

use std::time::Duration;

use anyhow::Result;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend task-management service URL.
    pub backend_url: String,

    /// Timeout for one-shot backend calls in seconds. Event streams are exempt.
    pub request_timeout_secs: u64,

    /// Interval between background catalog/running-status refreshes in seconds.
    pub refresh_interval_secs: u64,

    /// Running-status poll cadence while waiting for a stopped node, in milliseconds.
    pub stop_poll_interval_ms: u64,

    /// Upper bound on the post-stop poll loop in seconds.
    pub stop_poll_timeout_secs: u64,

    /// Silence after which an activation stream is treated as failed, in
    /// seconds. Zero waits indefinitely.
    pub activation_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable lines.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8765".to_string(),
            request_timeout_secs: 30,
            refresh_interval_secs: 10,
            stop_poll_interval_ms: 400,
            stop_poll_timeout_secs: 15,
            activation_timeout_secs: 300,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backend_url = std::env::var("NODEORCH_BACKEND_URL").unwrap_or(defaults.backend_url);
        if backend_url.trim().is_empty() {
            anyhow::bail!("NODEORCH_BACKEND_URL must not be empty");
        }

        let log_level = std::env::var("NODEORCH_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_json = std::env::var("NODEORCH_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(defaults.log_json);

        Ok(Self {
            backend_url,
            request_timeout_secs: env_u64("NODEORCH_REQUEST_TIMEOUT", defaults.request_timeout_secs),
            refresh_interval_secs: env_u64(
                "NODEORCH_REFRESH_INTERVAL",
                defaults.refresh_interval_secs,
            ),
            stop_poll_interval_ms: env_u64(
                "NODEORCH_STOP_POLL_INTERVAL_MS",
                defaults.stop_poll_interval_ms,
            ),
            stop_poll_timeout_secs: env_u64(
                "NODEORCH_STOP_POLL_TIMEOUT",
                defaults.stop_poll_timeout_secs,
            ),
            activation_timeout_secs: env_u64(
                "NODEORCH_ACTIVATION_TIMEOUT",
                defaults.activation_timeout_secs,
            ),
            log_level,
            log_json,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(50))
    }

    pub fn stop_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_poll_timeout_secs)
    }

    /// `None` disables the activation silence watchdog.
    pub fn activation_timeout(&self) -> Option<Duration> {
        (self.activation_timeout_secs > 0).then(|| Duration::from_secs(self.activation_timeout_secs))
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
