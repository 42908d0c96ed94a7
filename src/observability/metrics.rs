//! # Metrics
//!
//! Prometheus metrics for monitoring the engine.
//!
//! ## Metrics Exposed
//!
//! - `operator_engine_events_received_total` - Events accepted by the handler, by source and kind
//! - `operator_engine_events_skipped_total` - Events dropped before dispatch, by reason
//! - `operator_engine_reconciliations_total` - Total number of controller executions
//! - `operator_engine_reconciliation_errors_total` - Total number of failed executions
//! - `operator_engine_reconciliation_duration_seconds` - Duration of controller executions
//! - `operator_engine_retries_scheduled_total` - Retries handed to the retry timer
//! - `operator_engine_retries_exhausted_total` - Failure episodes that ran out of attempts
//! - `operator_engine_watch_reconnects_total` - Watches reopened after expiry or normal close
//! - `operator_engine_event_sources_registered` - Currently registered event sources, by controller

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static EVENTS_RECEIVED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_events_received_total",
            "Events accepted by the event handler by source and kind",
        ),
        &["source", "kind"],
    )
    .expect("Failed to create EVENTS_RECEIVED_TOTAL metric - this should never happen")
});

static EVENTS_SKIPPED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_events_skipped_total",
            "Events dropped before dispatch by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create EVENTS_SKIPPED_TOTAL metric - this should never happen")
});

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "operator_engine_reconciliations_total",
        "Total number of controller executions",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "operator_engine_reconciliation_errors_total",
        "Total number of failed controller executions",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "operator_engine_reconciliation_duration_seconds",
            "Duration of controller executions in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static RETRIES_SCHEDULED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "operator_engine_retries_scheduled_total",
        "Total number of retries handed to the retry timer",
    )
    .expect("Failed to create RETRIES_SCHEDULED_TOTAL metric - this should never happen")
});

static RETRIES_EXHAUSTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "operator_engine_retries_exhausted_total",
        "Total number of failure episodes that ran out of attempts",
    )
    .expect("Failed to create RETRIES_EXHAUSTED_TOTAL metric - this should never happen")
});

static WATCH_RECONNECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "operator_engine_watch_reconnects_total",
        "Total number of watches reopened",
    )
    .expect("Failed to create WATCH_RECONNECTS_TOTAL metric - this should never happen")
});

static EVENT_SOURCES_REGISTERED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "operator_engine_event_sources_registered",
            "Number of currently registered event sources by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create EVENT_SOURCES_REGISTERED metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Fails only when a metric is registered twice"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(EVENTS_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENTS_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(RETRIES_SCHEDULED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_EXHAUSTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENT_SOURCES_REGISTERED.clone()))?;
    Ok(())
}

pub fn increment_events_received(source: &str, kind: &str) {
    EVENTS_RECEIVED_TOTAL
        .with_label_values(&[source, kind])
        .inc();
}

pub fn increment_events_skipped(reason: &str) {
    EVENTS_SKIPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_retries_scheduled() {
    RETRIES_SCHEDULED_TOTAL.inc();
}

pub fn increment_retries_exhausted() {
    RETRIES_EXHAUSTED_TOTAL.inc();
}

pub fn increment_watch_reconnects() {
    WATCH_RECONNECTS_TOTAL.inc();
}

pub fn set_event_sources_registered(controller: &str, count: usize) {
    EVENT_SOURCES_REGISTERED
        .with_label_values(&[controller])
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}
