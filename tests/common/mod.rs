//! Common test utilities for engine integration tests
//!
//! Provides an in-memory resource store with scriptable watches, a recording
//! controller, a probe event source and the `Widget` test resource.

#![allow(dead_code, reason = "Each test binary uses a different subset of helpers")]

use anyhow::anyhow;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use operator_engine::config::{ControllerConfiguration, EngineConfig, StaticConfigurationService};
use operator_engine::controller::{Context, Controller, DeleteControl, RetryInfo, UpdateControl};
use operator_engine::event::{Event, ExternalEvent};
use operator_engine::event_source::EventSource;
use operator_engine::handler::EventHandler;
use operator_engine::operator::Operator;
use operator_engine::retry::RetryConfiguration;
use operator_engine::store::{
    ResourceStore, StoreError, WatchError, WatchNotification, WatchScope, WatchStream,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

pub const CONTROLLER: &str = "widget-controller";
pub const CRD: &str = "widgets.test.operator-engine.io";
pub const FINALIZER: &str = "widgets.test.operator-engine.io/finalizer";
pub const NAMESPACE: &str = "default";

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "test.operator-engine.io",
    version = "v1",
    kind = "Widget",
    namespaced,
    status = "WidgetStatus"
)]
pub struct WidgetSpec {
    pub replicas: i32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct WidgetStatus {
    pub observed_replicas: i32,
}

fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2025-01-01T00:00:00Z"))
        .expect("valid RFC 3339 timestamp")
}

pub type WatchItem = Result<WatchNotification<Widget>, WatchError>;

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, String), Widget>,
    watchers: Vec<(WatchScope, UnboundedSender<WatchItem>)>,
    next_version: u64,
    next_uid: u64,
    watch_opens: usize,
    watch_failures: VecDeque<WatchError>,
    replace_failures: usize,
    replace_calls: usize,
    status_calls: usize,
}

impl StoreState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn broadcast(&mut self, namespace: &str, item: &WatchItem) {
        self.watchers.retain(|(scope, sender)| {
            let in_scope = match scope {
                WatchScope::AllNamespaces => true,
                WatchScope::Namespace(ns) => ns == namespace,
            };
            !in_scope || sender.unbounded_send(item.clone()).is_ok()
        });
    }
}

/// In-memory [`ResourceStore`] that behaves like the API server for `Widget`
///
/// Spec changes bump `generation`, every write bumps `resourceVersion`, delete
/// of a resource with finalizers only sets `deletionTimestamp`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a widget as an external client would
    pub fn create_widget(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        finalizers: &[&str],
    ) -> Widget {
        let mut state = self.state.lock().unwrap();
        state.next_uid += 1;
        let mut widget = Widget::new(name, WidgetSpec { replicas });
        widget.metadata.namespace = Some(namespace.to_string());
        widget.metadata.uid = Some(format!("uid-{}", state.next_uid));
        widget.metadata.generation = Some(1);
        widget.metadata.resource_version = Some(state.bump_version());
        if !finalizers.is_empty() {
            widget.metadata.finalizers = Some(finalizers.iter().map(ToString::to_string).collect());
        }
        state
            .objects
            .insert((namespace.to_string(), name.to_string()), widget.clone());
        state.broadcast(namespace, &Ok(WatchNotification::Added(widget.clone())));
        widget
    }

    /// Change the spec as an external client would
    pub fn update_spec(&self, namespace: &str, name: &str, replicas: i32) -> Widget {
        let mut state = self.state.lock().unwrap();
        let version = state.bump_version();
        let widget = state
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("widget exists");
        widget.spec.replicas = replicas;
        widget.metadata.generation = Some(widget.metadata.generation.unwrap_or(0) + 1);
        widget.metadata.resource_version = Some(version);
        let widget = widget.clone();
        state.broadcast(namespace, &Ok(WatchNotification::Modified(widget.clone())));
        widget
    }

    /// Change labels only; generation stays the same
    pub fn touch_metadata(&self, namespace: &str, name: &str, label: &str) -> Widget {
        let mut state = self.state.lock().unwrap();
        let version = state.bump_version();
        let widget = state
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("widget exists");
        widget
            .labels_mut()
            .insert(label.to_string(), "true".to_string());
        widget.metadata.resource_version = Some(version);
        let widget = widget.clone();
        state.broadcast(namespace, &Ok(WatchNotification::Modified(widget.clone())));
        widget
    }

    pub fn widget(&self, namespace: &str, name: &str) -> Option<Widget> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Delete as an external client would; false when the widget does not exist
    pub fn delete_widget(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(mut existing) = state.objects.get(&key).cloned() else {
            return false;
        };
        if existing.finalizers().is_empty() {
            state.objects.remove(&key);
            state.broadcast(namespace, &Ok(WatchNotification::Deleted(existing)));
        } else {
            existing.metadata.deletion_timestamp = Some(deletion_time());
            existing.metadata.resource_version = Some(state.bump_version());
            state.objects.insert(key, existing.clone());
            state.broadcast(namespace, &Ok(WatchNotification::Modified(existing)));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Push a raw item to every open watch
    pub fn emit(&self, item: WatchItem) {
        let mut state = self.state.lock().unwrap();
        let watchers = std::mem::take(&mut state.watchers);
        state.watchers = watchers
            .into_iter()
            .filter(|(_, sender)| sender.unbounded_send(item.clone()).is_ok())
            .collect();
    }

    /// End every open watch stream without an error
    pub fn end_watches(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    pub fn fail_next_watch(&self, error: WatchError) {
        self.state.lock().unwrap().watch_failures.push_back(error);
    }

    pub fn fail_next_replaces(&self, count: usize) {
        self.state.lock().unwrap().replace_failures = count;
    }

    pub fn watch_opens(&self) -> usize {
        self.state.lock().unwrap().watch_opens
    }

    pub fn open_watches(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|(_, sender)| !sender.is_closed());
        state.watchers.len()
    }

    pub fn replace_calls(&self) -> usize {
        self.state.lock().unwrap().replace_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }
}

fn key_of(widget: &Widget) -> (String, String) {
    (widget.namespace().unwrap_or_default(), widget.name_any())
}

#[async_trait]
impl ResourceStore<Widget> for MemoryStore {
    async fn watch(&self, scope: &WatchScope) -> Result<WatchStream<Widget>, WatchError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.watch_failures.pop_front() {
            return Err(error);
        }
        state.watch_opens += 1;
        let (sender, receiver) = unbounded();
        for widget in state.objects.values() {
            let in_scope = match scope {
                WatchScope::AllNamespaces => true,
                WatchScope::Namespace(ns) => widget.namespace().as_deref() == Some(ns.as_str()),
            };
            if in_scope {
                let _ = sender.unbounded_send(Ok(WatchNotification::Added(widget.clone())));
            }
        }
        state.watchers.push((scope.clone(), sender));
        Ok(receiver.boxed())
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Widget>, StoreError> {
        Ok(self.widget(namespace.unwrap_or(NAMESPACE), name))
    }

    async fn create(&self, resource: &Widget) -> Result<Widget, StoreError> {
        let finalizers: Vec<String> = resource.finalizers().to_vec();
        let refs: Vec<&str> = finalizers.iter().map(String::as_str).collect();
        Ok(self.create_widget(
            &resource.namespace().unwrap_or_else(|| NAMESPACE.to_string()),
            &resource.name_any(),
            resource.spec.replicas,
            &refs,
        ))
    }

    async fn replace(&self, resource: &Widget) -> Result<Widget, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.replace_calls += 1;
        if state.replace_failures > 0 {
            state.replace_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let key = key_of(resource);
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        if existing.metadata.resource_version != resource.metadata.resource_version {
            return Err(StoreError::Conflict(key.1.clone()));
        }

        let mut stored = resource.clone();
        stored.metadata.uid = existing.metadata.uid.clone();
        stored.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        stored.status = existing.status.clone();
        let generation = existing.metadata.generation.unwrap_or(0);
        stored.metadata.generation = Some(if stored.spec == existing.spec {
            generation
        } else {
            generation + 1
        });
        stored.metadata.resource_version = Some(state.bump_version());

        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.objects.remove(&key);
            state.broadcast(&key.0, &Ok(WatchNotification::Deleted(stored.clone())));
        } else {
            state.objects.insert(key.clone(), stored.clone());
            state.broadcast(&key.0, &Ok(WatchNotification::Modified(stored.clone())));
        }
        Ok(stored)
    }

    async fn update_status(&self, resource: &Widget) -> Result<Widget, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        let key = key_of(resource);
        let version = state.bump_version();
        let stored = {
            let existing = state
                .objects
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
            existing.status = resource.status.clone();
            existing.metadata.resource_version = Some(version);
            existing.clone()
        };
        state.broadcast(&key.0, &Ok(WatchNotification::Modified(stored.clone())));
        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        if self.delete_widget(namespace.unwrap_or(NAMESPACE), name) {
            Ok(())
        } else {
            Err(StoreError::NotFound(name.to_string()))
        }
    }
}

/// Controller that records every invocation
pub struct RecordingController {
    name: String,
    pub reconciles: AtomicUsize,
    pub cleanups: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    delay: Duration,
    failures_left: AtomicUsize,
    update_status: bool,
    delete_control: DeleteControl,
    pub retries: Mutex<Vec<Option<RetryInfo>>>,
    pub triggers: Mutex<Vec<String>>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self {
            name: CONTROLLER.to_string(),
            reconciles: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
            update_status: false,
            delete_control: DeleteControl::DefaultDelete,
            retries: Mutex::new(Vec::new()),
            triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` reconciles
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(usize::MAX)
    }

    pub fn updating_status(mut self) -> Self {
        self.update_status = true;
        self
    }

    pub fn deferring_cleanup(mut self) -> Self {
        self.delete_control = DeleteControl::NoFinalizerRemoval;
        self
    }

    pub fn reconciles(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                match left {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok()
    }
}

#[async_trait]
impl Controller<Widget> for RecordingController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(
        &self,
        resource: Widget,
        context: Context<Widget>,
    ) -> anyhow::Result<UpdateControl<Widget>> {
        self.run().await;
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        self.retries.lock().unwrap().push(context.retry);
        self.triggers
            .lock()
            .unwrap()
            .push(context.trigger.source_name().to_string());
        if self.should_fail() {
            return Err(anyhow!("reconcile of {} failed", context.identity));
        }
        if self.update_status {
            let mut updated = resource;
            updated.status = Some(WidgetStatus {
                observed_replicas: updated.spec.replicas,
            });
            return Ok(UpdateControl::UpdateStatus(updated));
        }
        Ok(UpdateControl::NoUpdate)
    }

    async fn cleanup(
        &self,
        _resource: Widget,
        _context: Context<Widget>,
    ) -> anyhow::Result<DeleteControl> {
        self.run().await;
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(self.delete_control)
    }
}

/// Event source that records the calls it receives
#[derive(Default)]
pub struct ProbeSource {
    pub starts: AtomicUsize,
    pub closes: AtomicUsize,
    pub deregistered: Mutex<Vec<String>>,
    handler: Mutex<Option<EventHandler<Widget>>>,
    fail_start: AtomicBool,
    close_log: Option<(Arc<Mutex<Vec<String>>>, String)>,
}

impl ProbeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Probe that appends `label` to `log` when closed
    pub fn logging_close(log: Arc<Mutex<Vec<String>>>, label: &str) -> Arc<Self> {
        Arc::new(Self {
            close_log: Some((log, label.to_string())),
            ..Self::default()
        })
    }

    pub fn failing_start() -> Arc<Self> {
        let probe = Self::default();
        probe.fail_start.store(true, Ordering::SeqCst);
        Arc::new(probe)
    }

    /// Deliver an external event for `uid`; false when not started
    pub fn fire(&self, uid: &str) -> bool {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                handler.handle(Event::External(ExternalEvent {
                    uid: uid.to_string(),
                    source_name: "probe".to_string(),
                    reason: "test".to_string(),
                }));
                true
            }
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource<Widget> for ProbeSource {
    async fn start(&self, handler: EventHandler<Widget>) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("probe refused to start"));
        }
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.handler.lock().unwrap().take();
        if let Some((log, label)) = &self.close_log {
            log.lock().unwrap().push(label.clone());
        }
        Ok(())
    }

    fn deregister_resource(&self, uid: &str) {
        self.deregistered.lock().unwrap().push(uid.to_string());
    }
}

/// Retry policy with short delays for tests
pub fn fast_retry(max_attempts: u32) -> RetryConfiguration {
    RetryConfiguration {
        initial_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_interval: None,
        max_attempts,
    }
}

/// Finalizer, no generation filtering, fast retries
pub fn configuration() -> ControllerConfiguration {
    ControllerConfiguration::new(CONTROLLER, CRD)
        .generation_aware(false)
        .with_retry(fast_retry(3))
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        watch_reopen_delay_ms: 10,
        ..EngineConfig::default()
    }
}

pub fn operator() -> Operator {
    Operator::new(
        Arc::new(StaticConfigurationService::new().with(configuration())),
        engine_config(),
    )
}

pub struct Harness {
    pub operator: Operator,
    pub store: Arc<MemoryStore>,
    pub controller: Arc<RecordingController>,
    pub handler: EventHandler<Widget>,
}

/// Register `controller` with `configuration` against a fresh store
pub async fn start(
    controller: RecordingController,
    configuration: ControllerConfiguration,
) -> Harness {
    let store = MemoryStore::new();
    start_with_store(controller, configuration, store).await
}

pub async fn start_with_store(
    controller: RecordingController,
    configuration: ControllerConfiguration,
    store: Arc<MemoryStore>,
) -> Harness {
    let operator = operator();
    let controller = Arc::new(controller);
    let handler = operator
        .register_with_configuration(
            Arc::clone(&controller),
            configuration,
            Arc::clone(&store) as Arc<dyn ResourceStore<Widget>>,
        )
        .await
        .expect("controller registers");
    Harness {
        operator,
        store,
        controller,
        handler,
    }
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight events time to be processed
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
