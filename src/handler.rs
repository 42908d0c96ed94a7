//! # Event Handler
//!
//! Single entry point for every event of a controller, whatever its source.
//!
//! `handle` never blocks: it records the snapshot in the cache and spawns the
//! processing task. Processing takes the execution slot of the resource UID,
//! so different resources reconcile in parallel while events of one resource
//! queue up and run one at a time (FIFO, `tokio::sync::Mutex`).
//!
//! Inside the slot the handler:
//! - deregisters the UID on a `Deleted` notification,
//! - skips custom resource events whose resource version was already
//!   processed (the watch echo of our own writes),
//! - dispatches the latest cached snapshot,
//! - on failure advances the resource's retry state and schedules a retry on
//!   the retry timer, which comes back through `handle` like any other event.

use crate::cache::EventCache;
use crate::constants::FINALIZER_BOOTSTRAP_SOURCE_NAME;
use crate::controller::{Context, RetryInfo};
use crate::dispatcher::{DispatchError, DispatchOutcome, EventDispatcher};
use crate::event::{Event, EventAction, ExternalEvent};
use crate::event_source::{CustomResourceEventSource, EventSourceRegistry, TimerEventSource};
use crate::observability::metrics;
use crate::resource::{resource_version, EngineResource, ResourceIdentity};
use crate::retry::{GenericRetry, RetryState};
use chrono::Utc;
use kube::ResourceExt;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn, Instrument};

/// Retry policy of a controller and the timer its retries are scheduled on
#[derive(Debug, Clone)]
pub struct RetrySupport<K: EngineResource> {
    pub policy: GenericRetry,
    pub timer: TimerEventSource<K>,
}

struct HandlerInner<K: EngineResource> {
    controller_name: String,
    dispatcher: EventDispatcher<K>,
    cache: Arc<EventCache<K>>,
    registry: Arc<EventSourceRegistry<K>>,
    retry: Option<RetrySupport<K>>,
    watch: Mutex<Option<CustomResourceEventSource<K>>>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    retry_states: Mutex<HashMap<String, RetryState>>,
    processed_versions: Mutex<HashMap<String, String>>,
    executions: AtomicU64,
    closed: AtomicBool,
}

pub struct EventHandler<K: EngineResource> {
    inner: Arc<HandlerInner<K>>,
}

impl<K: EngineResource> Clone for EventHandler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: EngineResource> fmt::Debug for EventHandler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("controller_name", &self.inner.controller_name)
            .field("cached", &self.inner.cache.len())
            .field("executions", &self.executions())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<K: EngineResource> EventHandler<K> {
    #[must_use]
    pub fn new(
        dispatcher: EventDispatcher<K>,
        cache: Arc<EventCache<K>>,
        registry: Arc<EventSourceRegistry<K>>,
        retry: Option<RetrySupport<K>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                controller_name: dispatcher.controller_name().to_string(),
                dispatcher,
                cache,
                registry,
                retry,
                watch: Mutex::new(None),
                slots: Mutex::new(HashMap::new()),
                retry_states: Mutex::new(HashMap::new()),
                processed_versions: Mutex::new(HashMap::new()),
                executions: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Accept an event; processing happens on a spawned task
    pub fn handle(&self, event: Event<K>) {
        if self.is_closed() {
            metrics::increment_events_skipped("closed");
            debug!(controller = %self.inner.controller_name, event.source = %event.source_name(), "handler.closed.event_dropped");
            return;
        }
        let Some(uid) = event.related_uid() else {
            debug!(controller = %self.inner.controller_name, event.source = %event.source_name(), "handler.event_without_uid");
            return;
        };
        metrics::increment_events_received(event.source_name(), event.kind());

        if let Event::CustomResource(e) = &event {
            if e.action != EventAction::Deleted {
                self.inner.cache.put(e.resource.clone());
            }
        }

        let handler = self.clone();
        tokio::spawn(async move { handler.process(uid, event).await });
    }

    async fn process(self, uid: String, event: Event<K>) {
        let slot = self.slot(&uid);
        {
            let _guard = slot.lock().await;
            let span = tracing::info_span!(
                "engine.dispatch",
                controller = %self.inner.controller_name,
                resource.uid = %uid,
                event.source = %event.source_name(),
                event.kind = event.kind()
            );
            self.process_locked(&uid, event).instrument(span).await;
        }
        drop(slot);
        self.release_slot(&uid);
    }

    async fn process_locked(&self, uid: &str, event: Event<K>) {
        if self.is_closed() {
            return;
        }

        if let Event::CustomResource(e) = &event {
            if e.action == EventAction::Deleted {
                info!(resource.name = %e.resource.name_any(), "Resource deleted");
                self.deregister(uid);
                return;
            }
        }

        let Some(resource) = self.inner.cache.get(uid) else {
            metrics::increment_events_skipped("not_cached");
            debug!("No cached snapshot for resource, skipping event");
            return;
        };
        let Some(identity) = ResourceIdentity::of(&resource) else {
            return;
        };

        if matches!(event, Event::CustomResource(_)) && self.already_processed(uid, &resource) {
            metrics::increment_events_skipped("processed_version");
            debug!(resource = %identity, "Skipping event, resource version already processed");
            return;
        }

        let retry = self.retry_info(uid);
        let context = Context {
            identity: identity.clone(),
            trigger: event,
            retry,
        };

        let dispatched_version = resource_version(&resource);
        self.inner.executions.fetch_add(1, Ordering::SeqCst);
        match self.inner.dispatcher.dispatch(resource.clone(), context).await {
            Ok(DispatchOutcome::FinalizerAdded(stored)) => {
                self.record_processed(uid, &stored);
                self.inner
                    .cache
                    .put_if_version(dispatched_version.as_deref(), stored);
                self.clear_retry(uid);
                self.handle(Event::External(ExternalEvent {
                    uid: uid.to_string(),
                    source_name: FINALIZER_BOOTSTRAP_SOURCE_NAME.to_string(),
                    reason: "finalizer added".to_string(),
                }));
            }
            Ok(DispatchOutcome::Reconciled { written }) => {
                match written {
                    Some(stored) => {
                        self.record_processed(uid, &stored);
                        self.inner
                            .cache
                            .put_if_version(dispatched_version.as_deref(), stored);
                    }
                    None => self.record_processed(uid, &resource),
                }
                self.clear_retry(uid);
                debug!(resource = %identity, "Reconciled resource");
            }
            Ok(DispatchOutcome::CleanupDeferred) => {
                self.record_processed(uid, &resource);
                self.clear_retry(uid);
            }
            Ok(DispatchOutcome::Skipped) => {}
            Ok(DispatchOutcome::Deleted) => {
                info!(resource = %identity, "Cleanup finished, forgetting resource");
                self.deregister(uid);
            }
            Err(e) => self.on_failure(uid, &identity, &e),
        }
    }

    fn already_processed(&self, uid: &str, resource: &K) -> bool {
        let Some(version) = resource_version(resource) else {
            return false;
        };
        self.inner
            .processed_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .is_some_and(|processed| *processed == version)
    }

    fn record_processed(&self, uid: &str, resource: &K) {
        if let Some(version) = resource_version(resource) {
            self.inner
                .processed_versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(uid.to_string(), version);
        }
    }

    /// Retry position of the next invocation; an exhausted episode starts over
    fn retry_info(&self, uid: &str) -> Option<RetryInfo> {
        let mut states = self
            .inner
            .retry_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.get(uid)?;
        if state.exhausted {
            debug!("Retries were exhausted, starting a new failure episode");
            states.remove(uid);
            return None;
        }
        Some(RetryInfo {
            attempt: state.error_count(),
            last_attempt: state.execution.is_last_attempt(),
        })
    }

    fn clear_retry(&self, uid: &str) {
        let previous = self
            .inner
            .retry_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        if let (Some(_), Some(retry)) = (previous, &self.inner.retry) {
            retry.timer.cancel_once(uid);
        }
    }

    fn on_failure(&self, uid: &str, identity: &ResourceIdentity, failure: &DispatchError) {
        metrics::increment_reconciliation_errors();
        let reason = error_chain(failure);

        let Some(retry) = &self.inner.retry else {
            error!(resource = %identity, error = %reason, "❌ Reconciliation failed, retry disabled");
            return;
        };

        let (delay, attempt) = {
            let mut states = self
                .inner
                .retry_states
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(uid.to_string())
                .or_insert_with(|| RetryState::new(retry.policy.init_execution()));
            let delay = state.execution.next_delay();
            match delay {
                Some(delay) => {
                    state.next_attempt_at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay));
                }
                None => {
                    state.exhausted = true;
                    state.next_attempt_at = None;
                }
            }
            (delay, state.error_count())
        };

        match delay {
            Some(delay) => {
                warn!(
                    resource = %identity,
                    error = %reason,
                    attempt = attempt,
                    "🔄 Retrying with {}ms backoff",
                    delay.as_millis()
                );
                metrics::increment_retries_scheduled();
                retry.timer.schedule_once(uid, delay);
            }
            None => {
                metrics::increment_retries_exhausted();
                error!(
                    resource = %identity,
                    error = %reason,
                    attempts = attempt,
                    "❌ Reconciliation failed, retries exhausted"
                );
            }
        }
    }

    /// Forget everything kept for `uid`, in the handler and in every source
    fn deregister(&self, uid: &str) {
        self.inner.cache.remove(uid);
        self.inner
            .processed_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        self.inner
            .retry_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        self.inner.registry.cleanup(uid);
        debug!(resource.uid = %uid, "handler.deregistered");
    }

    fn slot(&self, uid: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(uid.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drop the slot of `uid` once no task holds or waits for it
    fn release_slot(&self, uid: &str) {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(uid)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(uid);
        }
    }

    /// Stop accepting events and close every registered event source
    ///
    /// Reconciles already running finish, but their outcome produces no new
    /// events. Returns the sources that failed to close.
    pub async fn close(&self) -> Vec<(String, anyhow::Error)> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let failures = self.inner.registry.close().await;
        info!(
            controller = %self.inner.controller_name,
            failed_sources = failures.len(),
            "Closed event handler"
        );
        failures
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn controller_name(&self) -> &str {
        &self.inner.controller_name
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventSourceRegistry<K>> {
        &self.inner.registry
    }

    /// Latest cached snapshot of `uid`
    #[must_use]
    pub fn cached(&self, uid: &str) -> Option<K> {
        self.inner.cache.get(uid)
    }

    /// Keep a typed handle on the primary watch of this controller
    pub(crate) fn attach_watch(&self, watch: CustomResourceEventSource<K>) {
        *self
            .inner
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watch);
    }

    /// Last generation the primary watch forwarded for `uid`
    #[must_use]
    pub fn generation_marker(&self, uid: &str) -> Option<i64> {
        self.inner
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|watch| watch.generation_marker(uid))
    }

    #[must_use]
    pub fn retry_state(&self, uid: &str) -> Option<RetryState> {
        self.inner
            .retry_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Dispatches performed so far, finalizer bootstraps included
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    /// Number of resources with a live execution slot
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
