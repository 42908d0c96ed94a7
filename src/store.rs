//! # Resource Store
//!
//! The contract the engine needs from the backing resource store, and its
//! implementation over the Kubernetes API.
//!
//! The engine only needs list/watch/get/create/update/delete of namespaced
//! resources carrying `generation` and `resourceVersion`. A watch must report
//! "resource version expired, relist needed" distinctly from other failures so
//! the watch source can tell a recoverable closure from a fatal one.

use crate::constants::HTTP_GONE;
use crate::resource::EngineResource;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::{Client, Resource, ResourceExt};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::debug;

/// Namespace scope of a single watch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    AllNamespaces,
    Namespace(String),
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::AllNamespaces => f.write_str("*"),
            WatchScope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Raw notification delivered by a watch
#[derive(Debug, Clone)]
pub enum WatchNotification<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Error status that does not end the watch
    Error(String),
}

/// Why a watch stopped delivering notifications
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The resource version is too old, the watch has to be reopened
    #[error("watch expired (410 Gone): {0}")]
    Gone(String),
    #[error("watch transport failure: {0}")]
    Transport(String),
}

impl WatchError {
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, WatchError::Gone(_))
    }
}

/// Errors returned by store reads and writes
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {0} not found")]
    NotFound(String),
    #[error("conflicting write for {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize resource: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchNotification<K>, WatchError>>;

/// Backing store of one resource type
///
/// A stream returned by `watch` that ends without an error was closed by the
/// server and may be reopened. An `Err` item ends the watch.
#[async_trait]
pub trait ResourceStore<K: EngineResource>: Send + Sync {
    async fn watch(&self, scope: &WatchScope) -> Result<WatchStream<K>, WatchError>;

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError>;

    async fn create(&self, resource: &K) -> Result<K, StoreError>;

    /// Replace the whole resource, returning the stored version
    async fn replace(&self, resource: &K) -> Result<K, StoreError>;

    /// Write only the status subresource
    async fn update_status(&self, resource: &K) -> Result<K, StoreError>;

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _resource: PhantomData<fn() -> K>,
}

impl<K> fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: EngineResource + Resource<Scope = NamespaceResourceScope>,
{
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _resource: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn api_for(&self, resource: &K) -> Api<K> {
        self.api(resource.namespace().as_deref())
    }
}

fn classify_watch_failure(error: &kube::Error) -> WatchError {
    match error {
        kube::Error::Api(api_err) if api_err.code == HTTP_GONE => {
            WatchError::Gone(api_err.message.clone())
        }
        other => WatchError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: EngineResource + Resource<Scope = NamespaceResourceScope>,
{
    async fn watch(&self, scope: &WatchScope) -> Result<WatchStream<K>, WatchError> {
        let api = match scope {
            WatchScope::AllNamespaces => self.api(None),
            WatchScope::Namespace(ns) => self.api(Some(ns)),
        };
        // "0" starts from any recent version: the server replays current state
        // as Added notifications, which doubles as the relist after a 410.
        let events = api
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(|e| classify_watch_failure(&e))?;

        let stream = events.filter_map(|item| async move {
            match item {
                Ok(WatchEvent::Added(obj)) => Some(Ok(WatchNotification::Added(obj))),
                Ok(WatchEvent::Modified(obj)) => Some(Ok(WatchNotification::Modified(obj))),
                Ok(WatchEvent::Deleted(obj)) => Some(Ok(WatchNotification::Deleted(obj))),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(status)) if status.code == HTTP_GONE => {
                    Some(Err(WatchError::Gone(status.message.clone())))
                }
                Ok(WatchEvent::Error(status)) => {
                    debug!(code = status.code, "watch.status_error");
                    Some(Ok(WatchNotification::Error(status.message.clone())))
                }
                Err(e) => Some(Err(classify_watch_failure(&e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, resource: &K) -> Result<K, StoreError> {
        Ok(self
            .api_for(resource)
            .create(&PostParams::default(), resource)
            .await?)
    }

    async fn replace(&self, resource: &K) -> Result<K, StoreError> {
        let name = resource.name_any();
        match self
            .api_for(resource)
            .replace(&name, &PostParams::default(), resource)
            .await
        {
            Ok(stored) => Ok(stored),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                Err(StoreError::Conflict(name))
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                Err(StoreError::NotFound(name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, resource: &K) -> Result<K, StoreError> {
        let name = resource.name_any();
        let status = serde_json::to_value(resource)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let patch = serde_json::json!({ "status": status });
        Ok(self
            .api_for(resource)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
