//! # Runtime
//!
//! Process-level setup for applications that embed the engine: TLS crypto
//! provider, tracing subscriber, metrics registry and the probe server.

use crate::config::EngineConfig;
use crate::observability::{init_tracing, metrics};
use crate::server::{start_server, ServerState};
use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Install the rustls provider, tracing and metrics
///
/// Safe to call when an application already installed a crypto provider or a
/// subscriber of its own; those steps then log a warning and keep the existing one.
pub fn initialize(config: &EngineConfig) -> Result<()> {
    // Required for rustls 0.23+ before the kube client opens a connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed, keeping the existing one");
    }

    if let Err(e) = init_tracing(config) {
        warn!("Tracing subscriber init returned error (may already be initialized): {}", e);
    }

    metrics::register_metrics()?;
    info!(
        metrics_port = config.metrics_port,
        log_format = %config.log_format,
        "Engine runtime initialized"
    );
    Ok(())
}

/// Serve `/metrics`, `/healthz` and `/readyz` on `METRICS_PORT`
pub fn spawn_server(config: &EngineConfig, state: Arc<ServerState>) -> JoinHandle<()> {
    let port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(port, state).await {
            error!("HTTP server error: {}", e);
        }
    })
}
