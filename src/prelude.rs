//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use operator_engine::prelude::*;
//! ```
//!
//! This brings into scope:
//! - The controller interface and its return values
//! - Configuration types and the configuration service
//! - The operator, event handler and event source types
//! - The resource store trait and its Kubernetes implementation
//! - Common error types

// Controller interface - implemented by users
pub use crate::controller::{Context, Controller, DeleteControl, RetryInfo, UpdateControl};

// Config types
pub use crate::config::{
    ConfigurationService, ControllerConfiguration, EngineConfig, StaticConfigurationService,
};

// Engine wiring
pub use crate::event::{Event, EventAction};
pub use crate::event_source::{
    CustomResourceEventSource, EventSource, EventSourceRegistry, TimerEventSource,
};
pub use crate::handler::EventHandler;
pub use crate::operator::Operator;
pub use crate::resource::{EngineResource, ResourceIdentity};
pub use crate::retry::RetryConfiguration;
pub use crate::store::{KubeStore, ResourceStore};

// Common error types
pub use crate::error::{EngineError, WatchLost};
pub use crate::event_source::RegistryError;
