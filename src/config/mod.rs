//! # Configuration
//!
//! - `controller`: static per-controller configuration and its lookup service
//! - `engine`: process-level settings from environment variables

pub mod controller;
pub mod engine;

pub use controller::{
    default_finalizer, ConfigurationError, ConfigurationService, ControllerConfiguration,
    RetryPolicy, StaticConfigurationService,
};
pub use engine::EngineConfig;
