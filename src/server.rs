//! # HTTP Server
//!
//! HTTP server for metrics, health checks, and Kubernetes probes.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (200 while the operator has controllers running and no watch was lost)
//!
//! The port comes from `METRICS_PORT` through [`crate::config::EngineConfig`].

use crate::error::Termination;
use crate::observability::metrics::REGISTRY;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Probe state of one operator
#[derive(Debug)]
pub struct ServerState {
    /// Set while at least one controller is registered and running
    pub is_ready: Arc<AtomicBool>,
    pub termination: Termination,
}

impl ServerState {
    #[must_use]
    pub fn new(termination: Termination) -> Self {
        Self {
            is_ready: Arc::new(AtomicBool::new(false)),
            termination,
        }
    }

    /// Why the operator cannot serve, `None` when it is ready
    #[must_use]
    pub fn unready_reason(&self) -> Option<String> {
        if let Some(lost) = self.termination.reason() {
            return Some(lost.to_string());
        }
        if self.is_ready.load(Ordering::SeqCst) {
            None
        } else {
            Some("no controller running".to_string())
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&REGISTRY.gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode engine metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain".to_string())],
                e.to_string().into_bytes(),
            )
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, String) {
    match state.unready_reason() {
        None => (StatusCode::OK, "ready".to_string()),
        Some(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
    }
}
