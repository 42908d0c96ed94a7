//! # Errors
//!
//! Operator-level errors and the fatal-termination signal raised when a watch
//! is lost for a reason other than expiry.

use crate::config::ConfigurationError;
use crate::event_source::RegistryError;
use crate::store::{WatchError, WatchScope};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidConfiguration(#[from] ConfigurationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    WatchLost(#[from] WatchLost),
}

/// A primary watch closed with a non-recoverable error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("watch of controller '{controller}' on scope '{scope}' lost: {error}")]
pub struct WatchLost {
    pub controller: String,
    pub scope: WatchScope,
    pub error: WatchError,
}

/// Shared fatal-termination signal
///
/// The first signal wins; later ones are ignored. Waiters are woken once.
#[derive(Debug, Clone)]
pub struct Termination {
    sender: Arc<watch::Sender<Option<WatchLost>>>,
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

impl Termination {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Record a fatal failure; returns false when one was already recorded
    pub fn signal(&self, lost: WatchLost) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(lost);
            true
        })
    }

    #[must_use]
    pub fn reason(&self) -> Option<WatchLost> {
        self.sender.borrow().clone()
    }

    /// Resolve once a fatal failure has been signalled
    pub async fn wait(&self) -> WatchLost {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(lost) = receiver.borrow_and_update().clone() {
                return lost;
            }
            // The sender lives in self, so changed() cannot fail while we wait.
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
