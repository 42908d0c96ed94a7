//! # Operator
//!
//! Owns the controllers of a process. Registering a controller wires its
//! event handler, cache, retry timer, dispatcher and primary watch together;
//! closing the operator closes every handler and, through them, every event
//! source.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use operator_engine::prelude::*;
//! use std::sync::Arc;
//! # async fn run<K, C>(client: kube::Client, controller: Arc<C>) -> anyhow::Result<()>
//! # where
//! #     K: EngineResource + kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
//! #     C: Controller<K>,
//! # {
//! let configurations = StaticConfigurationService::new()
//!     .with(ControllerConfiguration::new("demo", "demos.example.com"));
//! let operator = Operator::new(Arc::new(configurations), EngineConfig::from_env());
//!
//! operator
//!     .register(controller, Arc::new(KubeStore::<K>::new(client)))
//!     .await?;
//!
//! let lost = operator.terminated().await;
//! operator.close().await;
//! anyhow::bail!(lost);
//! # }
//! ```

use crate::cache::EventCache;
use crate::config::{ConfigurationService, ControllerConfiguration, EngineConfig};
use crate::constants::{CUSTOM_RESOURCE_EVENT_SOURCE_NAME, RETRY_TIMER_EVENT_SOURCE_NAME};
use crate::controller::Controller;
use crate::dispatcher::EventDispatcher;
use crate::error::{EngineError, Termination, WatchLost};
use crate::event_source::custom_resource::WatchSettings;
use crate::event_source::{CustomResourceEventSource, EventSourceRegistry, TimerEventSource};
use crate::handler::{EventHandler, RetrySupport};
use crate::resource::EngineResource;
use crate::retry::GenericRetry;
use crate::server::ServerState;
use crate::store::ResourceStore;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

/// A registered controller, with its resource type erased
#[async_trait]
trait ManagedController: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Vec<(String, anyhow::Error)>;
}

#[async_trait]
impl<K: EngineResource> ManagedController for EventHandler<K> {
    fn name(&self) -> &str {
        self.controller_name()
    }

    async fn close(&self) -> Vec<(String, anyhow::Error)> {
        EventHandler::close(self).await
    }
}

pub struct Operator {
    configuration_service: Arc<dyn ConfigurationService>,
    config: EngineConfig,
    controllers: Mutex<Vec<Box<dyn ManagedController>>>,
    termination: Termination,
    server_state: Arc<ServerState>,
    termination_watched: AtomicBool,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("controllers", &self.controller_names())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Operator {
    #[must_use]
    pub fn new(configuration_service: Arc<dyn ConfigurationService>, config: EngineConfig) -> Self {
        let termination = Termination::new();
        Self {
            configuration_service,
            config,
            controllers: Mutex::new(Vec::new()),
            server_state: Arc::new(ServerState::new(termination.clone())),
            termination,
            termination_watched: AtomicBool::new(false),
        }
    }

    /// Register `controller` with the configuration found under its name
    ///
    /// A controller without configuration is skipped with a warning and
    /// `Ok(None)` so that the other controllers of the process still run.
    pub async fn register<K, C>(
        &self,
        controller: Arc<C>,
        store: Arc<dyn ResourceStore<K>>,
    ) -> Result<Option<EventHandler<K>>, EngineError>
    where
        K: EngineResource,
        C: Controller<K>,
    {
        let Some(configuration) = self
            .configuration_service
            .configuration_for(controller.name())
        else {
            warn!(
                controller = %controller.name(),
                known = ?self.configuration_service.known_controller_names(),
                "No configuration found for controller, skipping registration"
            );
            return Ok(None);
        };
        self.register_with_configuration(controller, configuration, store)
            .await
            .map(Some)
    }

    /// Register `controller` with an explicit configuration
    pub async fn register_with_configuration<K, C>(
        &self,
        controller: Arc<C>,
        configuration: ControllerConfiguration,
        store: Arc<dyn ResourceStore<K>>,
    ) -> Result<EventHandler<K>, EngineError>
    where
        K: EngineResource,
        C: Controller<K>,
    {
        configuration.validate()?;
        let retry_configuration = configuration.resolve_retry(&self.config)?;
        let controller: Arc<dyn Controller<K>> = controller;
        let name = configuration.name.clone();

        let registry = Arc::new(EventSourceRegistry::new(name.clone()));
        let retry = retry_configuration.map(|policy| RetrySupport {
            policy: GenericRetry::new(policy),
            timer: TimerEventSource::new(RETRY_TIMER_EVENT_SOURCE_NAME),
        });
        let dispatcher = EventDispatcher::new(
            Arc::clone(&controller),
            Arc::clone(&store),
            configuration.finalizer.clone(),
        );
        let handler = EventHandler::new(
            dispatcher,
            Arc::new(EventCache::new()),
            Arc::clone(&registry),
            retry.clone(),
        );
        registry.bind(handler.clone());

        let watch = CustomResourceEventSource::new(
            CUSTOM_RESOURCE_EVENT_SOURCE_NAME,
            store,
            WatchSettings {
                controller_name: name.clone(),
                scopes: configuration.watch_scopes(),
                generation_aware: configuration.generation_aware,
                finalizer: configuration.finalizer.clone(),
                reopen_delay: self.config.watch_reopen_delay(),
            },
            self.termination.clone(),
        );
        handler.attach_watch(watch.clone());

        if let Err(e) = Self::start_sources(&registry, controller.as_ref(), retry, watch).await {
            handler.close().await;
            return Err(e);
        }

        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler.clone()));
        self.server_state.is_ready.store(true, Ordering::SeqCst);
        self.watch_termination();

        info!(
            controller = %name,
            crd = %configuration.crd_name,
            finalizer = ?configuration.finalizer,
            generation_aware = configuration.generation_aware,
            namespaces = ?configuration.namespaces,
            "Registered controller"
        );
        Ok(handler)
    }

    /// Retry timer first, then the controller's own sources, then the primary watch
    async fn start_sources<K: EngineResource>(
        registry: &EventSourceRegistry<K>,
        controller: &dyn Controller<K>,
        retry: Option<RetrySupport<K>>,
        watch: CustomResourceEventSource<K>,
    ) -> Result<(), EngineError> {
        if let Some(retry) = retry {
            registry
                .register(RETRY_TIMER_EVENT_SOURCE_NAME, Arc::new(retry.timer))
                .await?;
        }
        controller.init(registry).await?;
        registry
            .register(CUSTOM_RESOURCE_EVENT_SOURCE_NAME, Arc::new(watch))
            .await?;
        Ok(())
    }

    /// Clear readiness once a watch is lost
    fn watch_termination(&self) {
        if self.termination_watched.swap(true, Ordering::SeqCst) {
            return;
        }
        let termination = self.termination.clone();
        let ready = Arc::clone(&self.server_state.is_ready);
        tokio::spawn(async move {
            let lost = termination.wait().await;
            ready.store(false, Ordering::SeqCst);
            error!(error = %lost, "Operator is no longer ready");
        });
    }

    /// Close every registered controller and its event sources
    pub async fn close(&self) {
        self.server_state.is_ready.store(false, Ordering::SeqCst);
        let controllers: Vec<Box<dyn ManagedController>> = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for controller in controllers {
            let failures = controller.close().await;
            if !failures.is_empty() {
                warn!(
                    controller = %controller.name(),
                    failed_sources = failures.len(),
                    "Some event sources failed to close"
                );
            }
        }
        info!("Operator closed");
    }

    /// Resolves when a watch was lost and the operator cannot continue safely
    pub async fn terminated(&self) -> WatchLost {
        self.termination.wait().await
    }

    #[must_use]
    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.server_state.unready_reason().is_none()
    }

    /// Probe state shared with [`crate::server::start_server`]
    #[must_use]
    pub fn server_state(&self) -> Arc<ServerState> {
        Arc::clone(&self.server_state)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|controller| controller.name().to_string())
            .collect()
    }
}
