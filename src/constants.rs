//! # Constants
//!
//! Shared constants used throughout the engine.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Reserved registry name of the timer source that re-injects failed reconciliations
pub const RETRY_TIMER_EVENT_SOURCE_NAME: &str = "retry-timer-event-source";

/// Reserved registry name of the primary resource watch source
pub const CUSTOM_RESOURCE_EVENT_SOURCE_NAME: &str = "custom-resource-event-source";

/// Source name carried by the re-dispatch that follows a successful finalizer bootstrap
pub const FINALIZER_BOOTSTRAP_SOURCE_NAME: &str = "finalizer-bootstrap";

/// Suffix appended to the CRD name to build the default finalizer
pub const DEFAULT_FINALIZER_SUFFIX: &str = "/finalizer";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default delay before reopening a watch the server closed normally (milliseconds)
pub const DEFAULT_WATCH_REOPEN_DELAY_MS: u64 = 250;

/// Default initial retry interval (milliseconds)
pub const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 2000;

/// Default multiplier applied to the retry interval after each failure
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;

/// Default number of controller invocations per failure episode
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// HTTP status the API server uses for an expired watch resource version
pub const HTTP_GONE: u16 = 410;
