//! # Logging
//!
//! Tracing subscriber setup for applications embedding the engine.

use crate::config::EngineConfig;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the filter is `operator_engine=<LOG_LEVEL>`.
/// Returns an error if a subscriber was already installed.
pub fn init_tracing(config: &EngineConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("operator_engine={}", config.log_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json_logs() {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
