//! # Event Sources
//!
//! Everything that can trigger a reconciliation implements [`EventSource`]: the
//! primary resource watch, the retry timer and any source a controller
//! registers in [`crate::controller::Controller::init`]. Sources are kept by
//! name in the [`EventSourceRegistry`] of their controller and all deliver into
//! the same [`EventHandler`].

pub mod custom_resource;
pub mod timer;

pub use custom_resource::CustomResourceEventSource;
pub use timer::TimerEventSource;

use crate::handler::EventHandler;
use crate::observability::metrics;
use crate::resource::EngineResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait EventSource<K: EngineResource>: Send + Sync + 'static {
    /// Begin delivering events into `handler`
    async fn start(&self, handler: EventHandler<K>) -> anyhow::Result<()>;

    /// Stop delivering events and release what `start` acquired
    async fn close(&self) -> anyhow::Result<()>;

    /// Drop whatever this source keeps for the resource `uid`
    fn deregister_resource(&self, uid: &str);
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("an event source named '{0}' is already registered")]
    DuplicateRegistration(String),
    #[error("event source registry has no event handler bound")]
    NotBound,
    #[error("event source registry is closed")]
    Closed,
    #[error("event source '{name}' failed to start")]
    StartFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Named event sources of one controller
pub struct EventSourceRegistry<K: EngineResource> {
    controller_name: String,
    sources: Mutex<HashMap<String, Arc<dyn EventSource<K>>>>,
    handler: Mutex<Option<EventHandler<K>>>,
    closed: AtomicBool,
}

impl<K: EngineResource> fmt::Debug for EventSourceRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourceRegistry")
            .field("controller_name", &self.controller_name)
            .field("sources", &self.registered_names())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<K: EngineResource> EventSourceRegistry<K> {
    #[must_use]
    pub fn new(controller_name: impl Into<String>) -> Self {
        Self {
            controller_name: controller_name.into(),
            sources: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the handler that sources are started with
    pub fn bind(&self, handler: EventHandler<K>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Register `source` under `name` and start it
    ///
    /// Registration never overwrites: a second source under the same name is
    /// rejected and the first one stays registered. If the source fails to
    /// start, the registration is rolled back.
    pub async fn register(
        &self,
        name: impl Into<String>,
        source: Arc<dyn EventSource<K>>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RegistryError::NotBound)?;

        let registered = {
            let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
            if sources.contains_key(&name) {
                warn!(
                    controller = %self.controller_name,
                    event.source = %name,
                    "Rejected duplicate event source registration"
                );
                return Err(RegistryError::DuplicateRegistration(name));
            }
            sources.insert(name.clone(), Arc::clone(&source));
            sources.len()
        };

        if let Err(e) = source.start(handler).await {
            let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
            if sources
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, &source))
            {
                sources.remove(&name);
            }
            error!(
                controller = %self.controller_name,
                event.source = %name,
                error = %e,
                "Event source failed to start"
            );
            return Err(RegistryError::StartFailed { name, source: e });
        }

        metrics::set_event_sources_registered(&self.controller_name, registered);
        info!(
            controller = %self.controller_name,
            event.source = %name,
            "Registered event source"
        );
        Ok(())
    }

    /// Remove what the source `source_name` keeps for `uid`
    ///
    /// Unknown names are reported as `None`, never as an error.
    pub fn deregister_resource(
        &self,
        source_name: &str,
        uid: &str,
    ) -> Option<Arc<dyn EventSource<K>>> {
        let Some(source) = self.get(source_name) else {
            warn!(
                controller = %self.controller_name,
                event.source = %source_name,
                resource.uid = %uid,
                "No event source registered under this name, nothing to deregister"
            );
            return None;
        };
        source.deregister_resource(uid);
        Some(source)
    }

    /// Deregister `uid` from every source
    pub fn cleanup(&self, uid: &str) {
        let sources: Vec<Arc<dyn EventSource<K>>> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for source in sources {
            source.deregister_resource(uid);
        }
        debug!(controller = %self.controller_name, resource.uid = %uid, "registry.cleanup");
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn EventSource<K>>> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of the registered sources, sorted
    #[must_use]
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every registered source exactly once
    ///
    /// Individual failures are logged and returned, they never stop the other
    /// sources from being closed. Later calls find an empty table.
    pub async fn close(&self) -> Vec<(String, anyhow::Error)> {
        self.closed.store(true, Ordering::SeqCst);
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let drained: Vec<(String, Arc<dyn EventSource<K>>)> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut failures = Vec::new();
        for (name, source) in drained {
            match source.close().await {
                Ok(()) => {
                    debug!(controller = %self.controller_name, event.source = %name, "event_source.closed");
                }
                Err(e) => {
                    error!(
                        controller = %self.controller_name,
                        event.source = %name,
                        error = %e,
                        "Failed to close event source"
                    );
                    failures.push((name, e));
                }
            }
        }
        metrics::set_event_sources_registered(&self.controller_name, 0);
        failures
    }
}
