//! Operator Engine Library
//!
//! Event pipeline for Kubernetes controllers: resource watches, timers and
//! user-defined event sources feed a per-controller event handler that
//! serializes work per resource, bootstraps finalizers, skips already
//! processed generations and retries failures with backoff.
//!
//! ## Quick Start
//!
//! ```rust
//! use operator_engine::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod cache;
pub mod config;
pub mod constants;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod event_source;
pub mod handler;
pub mod observability;
pub mod operator;
pub mod prelude;
pub mod resource;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod store;
