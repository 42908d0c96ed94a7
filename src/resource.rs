//! # Resource
//!
//! Identity and metadata helpers for the resources the engine watches.
//!
//! The engine never interprets `spec` or `status`. Everything it needs lives in
//! `metadata`: the UID (stable identity), namespace and name (addressable
//! identity), `generation`, `resourceVersion`, `finalizers` and
//! `deletionTimestamp`.

use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Bound shared by every resource type the engine can watch and dispatch
pub trait EngineResource:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> EngineResource for T where
    T: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Stable and addressable identity of a live resource instance
///
/// A resource deleted and recreated under the same name gets a new UID and is
/// therefore a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
}

impl ResourceIdentity {
    /// Build the identity from resource metadata
    ///
    /// Returns `None` when the resource has no UID yet (never persisted).
    pub fn of<K: Resource>(resource: &K) -> Option<Self> {
        let uid = resource.uid()?;
        Some(Self {
            namespace: resource.namespace(),
            name: resource.name_any(),
            uid,
        })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{} ({})", namespace, self.name, self.uid),
            None => write!(f, "{} ({})", self.name, self.uid),
        }
    }
}

/// Generation of the resource, 0 when the store has not set one
pub fn generation<K: Resource>(resource: &K) -> i64 {
    resource.meta().generation.unwrap_or(0)
}

pub fn resource_version<K: Resource>(resource: &K) -> Option<String> {
    resource.resource_version()
}

/// True once the store has set a deletion timestamp
pub fn is_marked_for_deletion<K: Resource>(resource: &K) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(resource: &K, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// Append `finalizer` unless already present
pub fn add_finalizer<K: Resource>(resource: &mut K, finalizer: &str) {
    if !has_finalizer(resource, finalizer) {
        resource.finalizers_mut().push(finalizer.to_string());
    }
}

/// Remove every occurrence of `finalizer`, returning whether one was present
pub fn remove_finalizer<K: Resource>(resource: &mut K, finalizer: &str) -> bool {
    let finalizers = resource.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(uid: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                uid: uid.map(str::to_string),
                generation: Some(3),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_requires_uid() {
        assert!(ResourceIdentity::of(&config_map(None)).is_none());

        let identity = ResourceIdentity::of(&config_map(Some("u-1"))).unwrap();
        assert_eq!(identity.uid, "u-1");
        assert_eq!(identity.namespace.as_deref(), Some("default"));
        assert_eq!(identity.to_string(), "default/app (u-1)");
    }

    #[test]
    fn test_generation_defaults_to_zero() {
        let mut cm = config_map(Some("u-1"));
        assert_eq!(generation(&cm), 3);
        cm.metadata.generation = None;
        assert_eq!(generation(&cm), 0);
    }

    #[test]
    fn test_finalizer_add_is_idempotent_and_remove_reports_presence() {
        let mut cm = config_map(Some("u-1"));
        add_finalizer(&mut cm, "example.com/finalizer");
        add_finalizer(&mut cm, "example.com/finalizer");
        assert_eq!(cm.finalizers().len(), 1);
        assert!(has_finalizer(&cm, "example.com/finalizer"));

        assert!(remove_finalizer(&mut cm, "example.com/finalizer"));
        assert!(!remove_finalizer(&mut cm, "example.com/finalizer"));
    }

    #[test]
    fn test_marked_for_deletion() {
        let mut cm = config_map(Some("u-1"));
        assert!(!is_marked_for_deletion(&cm));
        cm.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2025-01-01T00:00:00Z")).unwrap());
        assert!(is_marked_for_deletion(&cm));
    }
}
