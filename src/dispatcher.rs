//! # Event Dispatcher
//!
//! Decides, for one snapshot, whether to bootstrap the finalizer, reconcile or
//! clean up, and writes the controller's answer back to the store. It runs
//! inside the per-resource execution slot held by the
//! [`crate::handler::EventHandler`] and never sees two snapshots of the same
//! resource at once.

use crate::controller::{Context, Controller, DeleteControl, UpdateControl};
use crate::observability::metrics;
use crate::resource::{
    add_finalizer, has_finalizer, is_marked_for_deletion, remove_finalizer, EngineResource,
};
use crate::store::{ResourceStore, StoreError};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("controller '{controller}' failed")]
    Controller {
        controller: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("store operation '{operation}' failed")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

/// What a dispatch did with the snapshot
#[derive(Debug, Clone)]
pub enum DispatchOutcome<K> {
    /// The finalizer was written; carries the stored resource
    FinalizerAdded(K),
    /// `reconcile` succeeded; carries the last snapshot written, if any
    Reconciled { written: Option<K> },
    /// `cleanup` asked to keep the finalizer
    CleanupDeferred,
    /// Cleanup finished and the finalizer is gone
    Deleted,
    /// Marked for deletion without our finalizer, nothing to do
    Skipped,
}

pub struct EventDispatcher<K: EngineResource> {
    controller: Arc<dyn Controller<K>>,
    store: Arc<dyn ResourceStore<K>>,
    finalizer: Option<String>,
}

impl<K: EngineResource> fmt::Debug for EventDispatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("controller", &self.controller.name())
            .field("finalizer", &self.finalizer)
            .finish_non_exhaustive()
    }
}

impl<K: EngineResource> EventDispatcher<K> {
    #[must_use]
    pub fn new(
        controller: Arc<dyn Controller<K>>,
        store: Arc<dyn ResourceStore<K>>,
        finalizer: Option<String>,
    ) -> Self {
        Self {
            controller,
            store,
            finalizer,
        }
    }

    #[must_use]
    pub fn controller_name(&self) -> &str {
        self.controller.name()
    }

    pub async fn dispatch(
        &self,
        resource: K,
        context: Context<K>,
    ) -> Result<DispatchOutcome<K>, DispatchError> {
        if is_marked_for_deletion(&resource) {
            return self.handle_delete(resource, context).await;
        }

        if let Some(finalizer) = self.finalizer.as_deref() {
            if !has_finalizer(&resource, finalizer) {
                let mut updated = resource;
                add_finalizer(&mut updated, finalizer);
                let stored = self.write("add_finalizer", &updated).await?;
                info!(
                    resource.name = %stored.name_any(),
                    finalizer = %finalizer,
                    "Added finalizer"
                );
                return Ok(DispatchOutcome::FinalizerAdded(stored));
            }
        }

        let control = self
            .timed(self.controller.reconcile(resource, context))
            .await?;
        let written = self.apply(control).await?;
        Ok(DispatchOutcome::Reconciled { written })
    }

    async fn handle_delete(
        &self,
        resource: K,
        context: Context<K>,
    ) -> Result<DispatchOutcome<K>, DispatchError> {
        if let Some(finalizer) = self.finalizer.as_deref() {
            if !has_finalizer(&resource, finalizer) {
                debug!(
                    resource.name = %resource.name_any(),
                    "Skipping event dispatching since resource is marked for deletion without our finalizer"
                );
                return Ok(DispatchOutcome::Skipped);
            }
        }

        let snapshot = resource.clone();
        let control = self
            .timed(self.controller.cleanup(resource, context))
            .await?;
        if control == DeleteControl::NoFinalizerRemoval {
            debug!(resource.name = %snapshot.name_any(), "dispatch.cleanup_deferred");
            return Ok(DispatchOutcome::CleanupDeferred);
        }

        if let Some(finalizer) = self.finalizer.as_deref() {
            let mut updated = snapshot;
            remove_finalizer(&mut updated, finalizer);
            match self.store.replace(&updated).await {
                Ok(_) => {
                    info!(
                        resource.name = %updated.name_any(),
                        finalizer = %finalizer,
                        "Removed finalizer"
                    );
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(resource.name = %updated.name_any(), "dispatch.remove_finalizer.already_gone");
                }
                Err(source) => {
                    return Err(DispatchError::Store {
                        operation: "remove_finalizer",
                        source,
                    })
                }
            }
        }
        Ok(DispatchOutcome::Deleted)
    }

    async fn apply(&self, control: UpdateControl<K>) -> Result<Option<K>, DispatchError> {
        match control {
            UpdateControl::NoUpdate => Ok(None),
            UpdateControl::UpdateResource(resource) => {
                Ok(Some(self.write("update_resource", &resource).await?))
            }
            UpdateControl::UpdateStatus(resource) => {
                let stored = self.store.update_status(&resource).await.map_err(|source| {
                    DispatchError::Store {
                        operation: "update_status",
                        source,
                    }
                })?;
                Ok(Some(stored))
            }
            UpdateControl::UpdateResourceAndStatus(resource) => {
                let stored = self.write("update_resource", &resource).await?;
                // carry the new resourceVersion into the status write
                let mut with_status = resource;
                with_status.meta_mut().resource_version = stored.resource_version();
                let stored = self.store.update_status(&with_status).await.map_err(|source| {
                    DispatchError::Store {
                        operation: "update_status",
                        source,
                    }
                })?;
                Ok(Some(stored))
            }
        }
    }

    async fn write(&self, operation: &'static str, resource: &K) -> Result<K, DispatchError> {
        self.store.replace(resource).await.map_err(|source| {
            if matches!(source, StoreError::Conflict(_)) {
                warn!(
                    resource.name = %resource.name_any(),
                    operation = operation,
                    "Write conflicted with a newer version of the resource"
                );
            }
            DispatchError::Store { operation, source }
        })
    }

    async fn timed<T>(
        &self,
        call: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, DispatchError> {
        let start = Instant::now();
        metrics::increment_reconciliations();
        let result = call.await;
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
        result.map_err(|source| DispatchError::Controller {
            controller: self.controller.name().to_string(),
            source,
        })
    }
}
