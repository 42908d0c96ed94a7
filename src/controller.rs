//! # Controller
//!
//! The interface user controllers implement, and the values they return to the
//! dispatcher.

use crate::event::Event;
use crate::event_source::{EventSourceRegistry, RegistryError};
use crate::resource::{EngineResource, ResourceIdentity};
use async_trait::async_trait;

/// What the dispatcher writes back after a successful reconcile
#[derive(Debug, Clone)]
pub enum UpdateControl<K> {
    NoUpdate,
    /// Replace the resource (spec and metadata)
    UpdateResource(K),
    /// Write the status subresource only
    UpdateStatus(K),
    /// Replace the resource, then write its status
    UpdateResourceAndStatus(K),
}

/// Outcome of a cleanup on a resource marked for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteControl {
    /// Cleanup finished: remove the finalizer and forget the resource
    DefaultDelete,
    /// Keep the finalizer, the controller will finish cleanup on a later event
    NoFinalizerRemoval,
}

/// Retry position of the current invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryInfo {
    /// Failed invocations so far in this episode
    pub attempt: u32,
    /// True when a failure of this invocation will not be retried
    pub last_attempt: bool,
}

/// Information handed to the controller alongside the snapshot
#[derive(Debug, Clone)]
pub struct Context<K> {
    pub identity: ResourceIdentity,
    /// Event that caused this invocation
    pub trigger: Event<K>,
    /// Set when this invocation is a retry of a failed one
    pub retry: Option<RetryInfo>,
}

#[async_trait]
pub trait Controller<K: EngineResource>: Send + Sync + 'static {
    /// Name used to look up the configuration of this controller
    fn name(&self) -> &str;

    /// Register secondary event sources; runs before the primary watch starts
    async fn init(&self, _registry: &EventSourceRegistry<K>) -> Result<(), RegistryError> {
        Ok(())
    }

    /// Bring the world toward the desired state of `resource`
    async fn reconcile(&self, resource: K, context: Context<K>)
        -> anyhow::Result<UpdateControl<K>>;

    /// Release what `reconcile` created; called while the resource is marked for deletion
    async fn cleanup(&self, _resource: K, _context: Context<K>) -> anyhow::Result<DeleteControl> {
        Ok(DeleteControl::DefaultDelete)
    }
}
