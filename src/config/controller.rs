//! # Controller Configuration
//!
//! Static per-controller settings supplied by the embedding application at
//! registration time, and the lookup service that maps controller names to them.

use crate::config::EngineConfig;
use crate::constants::DEFAULT_FINALIZER_SUFFIX;
use crate::retry::{RetryConfiguration, RetryConfigurationError};
use crate::store::WatchScope;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("controller name must not be empty")]
    EmptyName,
    #[error("CRD name must not be empty for controller {0}")]
    EmptyCrdName(String),
    #[error("finalizer of controller {0} must not be empty")]
    EmptyFinalizer(String),
    #[error("invalid retry configuration for controller {controller}: {source}")]
    Retry {
        controller: String,
        #[source]
        source: RetryConfigurationError,
    },
}

/// Retry behaviour of a controller
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Use the process-wide policy from [`EngineConfig::default_retry`]
    EngineDefault,
    Custom(RetryConfiguration),
    /// Failures are logged and never retried
    Disabled,
}

/// Settings of one registered controller
///
/// Immutable once the controller is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfiguration {
    pub name: String,
    pub crd_name: String,
    /// Finalizer the engine keeps on every resource; `None` disables finalizer handling
    pub finalizer: Option<String>,
    /// Skip updates whose generation was already dispatched
    pub generation_aware: bool,
    /// Namespaces to watch, empty means all namespaces
    pub namespaces: BTreeSet<String>,
    pub retry: RetryPolicy,
}

/// Default finalizer derived from the CRD name
#[must_use]
pub fn default_finalizer(crd_name: &str) -> String {
    format!("{crd_name}{DEFAULT_FINALIZER_SUFFIX}")
}

impl ControllerConfiguration {
    /// Configuration with the defaults: default finalizer, generation aware,
    /// all namespaces, engine retry policy
    pub fn new(name: impl Into<String>, crd_name: impl Into<String>) -> Self {
        let crd_name = crd_name.into();
        Self {
            name: name.into(),
            finalizer: Some(default_finalizer(&crd_name)),
            crd_name,
            generation_aware: true,
            namespaces: BTreeSet::new(),
            retry: RetryPolicy::EngineDefault,
        }
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = Some(finalizer.into());
        self
    }

    #[must_use]
    pub fn without_finalizer(mut self) -> Self {
        self.finalizer = None;
        self
    }

    #[must_use]
    pub fn generation_aware(mut self, generation_aware: bool) -> Self {
        self.generation_aware = generation_aware;
        self
    }

    #[must_use]
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfiguration) -> Self {
        self.retry = RetryPolicy::Custom(retry);
        self
    }

    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry = RetryPolicy::Disabled;
        self
    }

    pub fn watches_all_namespaces(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// One scope per target namespace, or a single cluster-wide scope
    pub fn watch_scopes(&self) -> Vec<WatchScope> {
        if self.watches_all_namespaces() {
            vec![WatchScope::AllNamespaces]
        } else {
            self.namespaces
                .iter()
                .cloned()
                .map(WatchScope::Namespace)
                .collect()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        if self.crd_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyCrdName(self.name.clone()));
        }
        if matches!(&self.finalizer, Some(f) if f.trim().is_empty()) {
            return Err(ConfigurationError::EmptyFinalizer(self.name.clone()));
        }
        if let RetryPolicy::Custom(retry) = &self.retry {
            self.validate_retry(retry)?;
        }
        Ok(())
    }

    /// Concrete retry parameters, `None` when retries are disabled
    pub fn resolve_retry(
        &self,
        engine: &EngineConfig,
    ) -> Result<Option<RetryConfiguration>, ConfigurationError> {
        let retry = match &self.retry {
            RetryPolicy::Disabled => return Ok(None),
            RetryPolicy::EngineDefault => engine.default_retry(),
            RetryPolicy::Custom(retry) => retry.clone(),
        };
        self.validate_retry(&retry)?;
        Ok(Some(retry))
    }

    fn validate_retry(&self, retry: &RetryConfiguration) -> Result<(), ConfigurationError> {
        retry.validate().map_err(|source| ConfigurationError::Retry {
            controller: self.name.clone(),
            source,
        })
    }
}

/// Resolves the configuration of a controller by name
pub trait ConfigurationService: Send + Sync {
    fn configuration_for(&self, controller_name: &str) -> Option<ControllerConfiguration>;

    /// Names listed when a lookup fails
    fn known_controller_names(&self) -> Vec<String>;
}

/// [`ConfigurationService`] over configurations built up front by the application
#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationService {
    configurations: BTreeMap<String, ControllerConfiguration>,
}

impl StaticConfigurationService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, configuration: ControllerConfiguration) -> Self {
        self.insert(configuration);
        self
    }

    pub fn insert(&mut self, configuration: ControllerConfiguration) {
        self.configurations
            .insert(configuration.name.clone(), configuration);
    }
}

impl ConfigurationService for StaticConfigurationService {
    fn configuration_for(&self, controller_name: &str) -> Option<ControllerConfiguration> {
        self.configurations.get(controller_name).cloned()
    }

    fn known_controller_names(&self) -> Vec<String> {
        self.configurations.keys().cloned().collect()
    }
}
