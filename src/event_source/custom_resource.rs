//! # Custom Resource Event Source
//!
//! Watches the primary resource of a controller and forwards notifications to
//! the event handler.
//!
//! ## Watch supervision
//!
//! One watch task per configured namespace, or a single cluster-wide watch.
//! A watch stream that ends without error (server-side timeout) is reopened
//! for its scope. A `410 Gone` closes every watch of the source and starts them
//! again. Anything else, including a failure to reopen, raises the operator's
//! [`Termination`] signal: a controller that silently lost its watch must not
//! keep running.
//!
//! ## Generation filtering
//!
//! For generation-aware controllers a notification is forwarded only when its
//! `metadata.generation` is newer than the last generation forwarded for that
//! UID. Resources marked for deletion and `Deleted` notifications always pass.
//! The marker is recorded right after forwarding, before the controller has
//! run, and only once the resource carries the controller's finalizer.

use crate::error::{Termination, WatchLost};
use crate::event::{CustomResourceEvent, Event, EventAction};
use crate::event_source::EventSource;
use crate::handler::EventHandler;
use crate::observability::metrics;
use crate::resource::{generation, has_finalizer, is_marked_for_deletion, EngineResource};
use crate::store::{ResourceStore, WatchError, WatchNotification, WatchScope, WatchStream};
use async_trait::async_trait;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Watch behaviour of a [`CustomResourceEventSource`]
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub controller_name: String,
    pub scopes: Vec<WatchScope>,
    pub generation_aware: bool,
    pub finalizer: Option<String>,
    /// Pause before reopening a watch the server closed
    pub reopen_delay: Duration,
}

struct SourceInner<K: EngineResource> {
    name: String,
    settings: WatchSettings,
    store: Arc<dyn ResourceStore<K>>,
    termination: Termination,
    markers: Mutex<HashMap<String, i64>>,
    watches: Mutex<Vec<JoinHandle<()>>>,
    handler: Mutex<Option<EventHandler<K>>>,
    /// Bumped on every full restart; stale watch tasks compare against it
    epoch: AtomicU64,
    closed: AtomicBool,
}

pub struct CustomResourceEventSource<K: EngineResource> {
    inner: Arc<SourceInner<K>>,
}

impl<K: EngineResource> Clone for CustomResourceEventSource<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: EngineResource> fmt::Debug for CustomResourceEventSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomResourceEventSource")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<K: EngineResource> CustomResourceEventSource<K> {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ResourceStore<K>>,
        settings: WatchSettings,
        termination: Termination,
    ) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                name: name.into(),
                settings,
                store,
                termination,
                markers: Mutex::new(HashMap::new()),
                watches: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Last generation forwarded for `uid`
    #[must_use]
    pub fn generation_marker(&self, uid: &str) -> Option<i64> {
        self.inner
            .markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .copied()
    }

    /// Route one watch notification, applying the generation filter
    pub fn on_notification(&self, notification: WatchNotification<K>) {
        self.inner.on_notification(notification);
    }
}

impl<K: EngineResource> SourceInner<K> {
    fn on_notification(&self, notification: WatchNotification<K>) {
        let (action, resource) = match notification {
            WatchNotification::Added(r) => (EventAction::Added, r),
            WatchNotification::Modified(r) => (EventAction::Modified, r),
            WatchNotification::Deleted(r) => (EventAction::Deleted, r),
            WatchNotification::Error(message) => {
                debug!(
                    controller = %self.settings.controller_name,
                    error = %message,
                    "watch.error_notification"
                );
                return;
            }
        };

        let Some(uid) = resource.uid() else {
            debug!(resource.name = %resource.name_any(), "watch.notification.without_uid");
            return;
        };

        if !self.should_forward(action, &uid, &resource) {
            metrics::increment_events_skipped("generation");
            debug!(
                resource.name = %resource.name_any(),
                resource.uid = %uid,
                generation = generation(&resource),
                "Skipping event, generation already processed"
            );
            return;
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };

        let record_marker = self.settings.generation_aware
            && action != EventAction::Deleted
            && !is_marked_for_deletion(&resource)
            && self
                .settings
                .finalizer
                .as_deref()
                .is_none_or(|finalizer| has_finalizer(&resource, finalizer));
        let resource_generation = generation(&resource);

        handler.handle(Event::CustomResource(CustomResourceEvent {
            action,
            resource,
            source_name: self.name.clone(),
        }));

        if record_marker {
            self.markers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(uid, resource_generation);
        }
    }

    fn should_forward(&self, action: EventAction, uid: &str, resource: &K) -> bool {
        if !self.settings.generation_aware
            || action == EventAction::Deleted
            || is_marked_for_deletion(resource)
        {
            return true;
        }
        let markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        match markers.get(uid) {
            None => true,
            Some(last) => generation(resource) > *last,
        }
    }

    /// Open a stream for every scope; fails on the first scope that cannot be watched
    async fn open_all(
        &self,
    ) -> Result<Vec<(WatchScope, WatchStream<K>)>, (WatchScope, WatchError)> {
        let mut streams = Vec::with_capacity(self.settings.scopes.len());
        for scope in &self.settings.scopes {
            match self.store.watch(scope).await {
                Ok(stream) => streams.push((scope.clone(), stream)),
                Err(e) => return Err((scope.clone(), e)),
            }
        }
        Ok(streams)
    }

    fn lost(&self, scope: WatchScope, error: WatchError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        error!(
            controller = %self.settings.controller_name,
            scope = %scope,
            error = %error,
            "❌ Watch lost, terminating controller"
        );
        self.termination.signal(WatchLost {
            controller: self.settings.controller_name.clone(),
            scope,
            error,
        });
    }
}

/// Spawn one supervised task per stream under the given epoch
fn spawn_watches<K: EngineResource>(
    inner: &Arc<SourceInner<K>>,
    epoch: u64,
    streams: Vec<(WatchScope, WatchStream<K>)>,
) {
    let mut watches = inner.watches.lock().unwrap_or_else(PoisonError::into_inner);
    for (scope, stream) in streams {
        let span = tracing::info_span!(
            "engine.watch",
            controller = %inner.settings.controller_name,
            scope = %scope
        );
        let task_inner = Arc::clone(inner);
        watches.push(tokio::spawn(
            run_watch(task_inner, epoch, scope, stream).instrument(span),
        ));
    }
}

async fn run_watch<K: EngineResource>(
    inner: Arc<SourceInner<K>>,
    epoch: u64,
    scope: WatchScope,
    mut stream: WatchStream<K>,
) {
    loop {
        match stream.next().await {
            Some(Ok(notification)) => inner.on_notification(notification),
            Some(Err(WatchError::Gone(message))) => {
                info!(scope = %scope, reason = %message, "🔄 Watch expired, restarting all watches");
                restart(&inner, epoch);
                return;
            }
            Some(Err(error)) => {
                inner.lost(scope, error);
                return;
            }
            None => {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                debug!(scope = %scope, "watch.stream_ended");
                tokio::time::sleep(inner.settings.reopen_delay).await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                match inner.store.watch(&scope).await {
                    Ok(reopened) => {
                        metrics::increment_watch_reconnects();
                        stream = reopened;
                    }
                    Err(WatchError::Gone(message)) => {
                        info!(scope = %scope, reason = %message, "🔄 Watch expired on reopen, restarting all watches");
                        restart(&inner, epoch);
                        return;
                    }
                    Err(error) => {
                        inner.lost(scope, error);
                        return;
                    }
                }
            }
        }
    }
}

/// Close every watch of the source and open them again
///
/// Only the first caller of an epoch restarts; the others are already being replaced.
fn restart<K: EngineResource>(inner: &Arc<SourceInner<K>>, epoch: u64) {
    if inner
        .epoch
        .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let old: Vec<JoinHandle<()>> = inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in old {
            task.abort();
        }
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(inner.settings.reopen_delay).await;
        match inner.open_all().await {
            Ok(streams) => {
                metrics::increment_watch_reconnects();
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                spawn_watches(&inner, epoch + 1, streams);
                info!(
                    controller = %inner.settings.controller_name,
                    "✅ Watches restarted"
                );
            }
            Err((scope, error)) => inner.lost(scope, error),
        }
    });
}

#[async_trait]
impl<K: EngineResource> EventSource<K> for CustomResourceEventSource<K> {
    async fn start(&self, handler: EventHandler<K>) -> anyhow::Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!("event source '{}' is closed", self.inner.name);
        }
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);

        let streams = self.inner.open_all().await.map_err(|(scope, error)| {
            anyhow::anyhow!("failed to open watch on scope '{scope}': {error}")
        })?;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        spawn_watches(&self.inner, epoch, streams);
        info!(
            controller = %self.inner.settings.controller_name,
            scopes = self.inner.settings.scopes.len(),
            generation_aware = self.inner.settings.generation_aware,
            "Started watching resources"
        );
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let watches: Vec<JoinHandle<()>> = self
            .inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in watches {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(
                        controller = %self.inner.settings.controller_name,
                        error = %e,
                        "Watch task ended abnormally during close"
                    );
                }
            }
        }
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(controller = %self.inner.settings.controller_name, "watch.closed");
        Ok(())
    }

    fn deregister_resource(&self, uid: &str) {
        self.inner
            .markers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
    }
}
