//! # Event Cache
//!
//! Last snapshot observed for each watched resource, keyed by UID.
//!
//! The cache is advisory. The store stays the source of truth and the cache may
//! lag behind a write until the next watch notification arrives. The only
//! guarantee is that an entry reflects the most recent snapshot this process
//! put for that UID.

use crate::resource::EngineResource;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

#[derive(Debug)]
pub struct EventCache<K> {
    resources: RwLock<HashMap<String, K>>,
}

impl<K: EngineResource> Default for EventCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EngineResource> EventCache<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Copy of the cached snapshot
    pub fn get(&self, uid: &str) -> Option<K> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Store `resource` under its UID, replacing any previous snapshot
    ///
    /// Resources without a UID are ignored.
    pub fn put(&self, resource: K) {
        let Some(uid) = resource.uid() else {
            debug!(resource.name = %resource.name_any(), "cache.put.skipped_without_uid");
            return;
        };
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid, resource);
    }

    /// Store `resource` only if the cached snapshot still has `expected_version`
    ///
    /// Used after our own writes so that a newer notification that arrived in
    /// the meantime is not overwritten. Returns whether the entry was replaced.
    pub fn put_if_version(&self, expected_version: Option<&str>, resource: K) -> bool {
        let Some(uid) = resource.uid() else {
            return false;
        };
        let mut resources = self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = resources.get(&uid).map(ResourceExt::resource_version);
        if current.is_some_and(|version| version.as_deref() != expected_version) {
            debug!(resource.uid = %uid, "cache.put_if_version.newer_snapshot_kept");
            return false;
        }
        resources.insert(uid, resource);
        true
    }

    pub fn remove(&self, uid: &str) -> Option<K> {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
