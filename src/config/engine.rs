//! # Engine Configuration
//!
//! Process-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_METRICS_PORT, DEFAULT_RETRY_INITIAL_INTERVAL_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
    DEFAULT_RETRY_MULTIPLIER, DEFAULT_WATCH_REOPEN_DELAY_MS,
};
use crate::retry::RetryConfiguration;
use std::time::Duration;

/// Engine-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port of the metrics and probe server
    pub metrics_port: u16,
    /// Global log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Delay before reopening a watch the server ended normally (milliseconds)
    pub watch_reopen_delay_ms: u64,
    /// Default retry policy: first delay (milliseconds)
    pub retry_initial_interval_ms: u64,
    /// Default retry policy: growth factor
    pub retry_multiplier: f64,
    /// Default retry policy: delay cap (milliseconds), 0 disables the cap
    pub retry_max_interval_ms: u64,
    /// Default retry policy: invocations per failure episode
    pub retry_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            watch_reopen_delay_ms: DEFAULT_WATCH_REOPEN_DELAY_MS,
            retry_initial_interval_ms: DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_max_interval_ms: 0,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            log_level: env_var_or_default_str("LOG_LEVEL", "info"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
            watch_reopen_delay_ms: env_var_or_default(
                "WATCH_REOPEN_DELAY_MS",
                DEFAULT_WATCH_REOPEN_DELAY_MS,
            ),
            retry_initial_interval_ms: env_var_or_default(
                "RETRY_INITIAL_INTERVAL_MS",
                DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            ),
            retry_multiplier: env_var_or_default("RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER),
            retry_max_interval_ms: env_var_or_default("RETRY_MAX_INTERVAL_MS", 0),
            retry_max_attempts: env_var_or_default(
                "RETRY_MAX_ATTEMPTS",
                DEFAULT_RETRY_MAX_ATTEMPTS,
            ),
        }
    }

    /// Get watch reopen delay duration
    pub fn watch_reopen_delay(&self) -> Duration {
        Duration::from_millis(self.watch_reopen_delay_ms)
    }

    /// Retry policy applied to controllers that do not set their own
    pub fn default_retry(&self) -> RetryConfiguration {
        RetryConfiguration {
            initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            multiplier: self.retry_multiplier,
            max_interval: (self.retry_max_interval_ms > 0)
                .then(|| Duration::from_millis(self.retry_max_interval_ms)),
            max_attempts: self.retry_max_attempts,
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
