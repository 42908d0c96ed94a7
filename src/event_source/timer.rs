//! # Timer Event Source
//!
//! Delivers [`Event::Timer`] for a resource after a delay, once or
//! periodically. The retry policy uses an instance of this source registered
//! under [`crate::constants::RETRY_TIMER_EVENT_SOURCE_NAME`]; controllers can
//! register their own for periodic resyncs.

use crate::event::{Event, TimerEvent};
use crate::event_source::EventSource;
use crate::handler::EventHandler;
use crate::resource::EngineResource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ScheduledTimer {
    id: u64,
    task: JoinHandle<()>,
}

struct TimerInner<K: EngineResource> {
    name: String,
    handler: Mutex<Option<EventHandler<K>>>,
    once: Mutex<HashMap<String, ScheduledTimer>>,
    periodic: Mutex<HashMap<String, ScheduledTimer>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

pub struct TimerEventSource<K: EngineResource> {
    inner: Arc<TimerInner<K>>,
}

impl<K: EngineResource> Clone for TimerEventSource<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: EngineResource> fmt::Debug for TimerEventSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEventSource")
            .field("name", &self.inner.name)
            .field("pending_once", &self.pending_once())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<K: EngineResource> TimerEventSource<K> {
    /// `name` is the registry name, it becomes the source name of fired events
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                name: name.into(),
                handler: Mutex::new(None),
                once: Mutex::new(HashMap::new()),
                periodic: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fire once for `uid` after `delay`, replacing a pending one-shot for it
    pub fn schedule_once(&self, uid: &str, delay: Duration) {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(timer = %self.inner.name, resource.uid = %uid, "timer.schedule_once.closed");
            return;
        }
        let mut once = self
            .inner
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let task_uid = uid.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut once = inner.once.lock().unwrap_or_else(PoisonError::into_inner);
                if once.get(&task_uid).is_some_and(|timer| timer.id == id) {
                    once.remove(&task_uid);
                }
            }
            inner.fire(&task_uid);
        });

        let previous = once.insert(uid.to_string(), ScheduledTimer { id, task });
        drop(once);
        if let Some(previous) = previous {
            previous.task.abort();
        }
        debug!(
            timer = %self.inner.name,
            resource.uid = %uid,
            delay_ms = delay.as_millis(),
            "timer.scheduled_once"
        );
    }

    /// Fire for `uid` after `initial_delay` and then every `period`
    ///
    /// A resource has at most one periodic timer; scheduling another is ignored.
    /// A zero `period` is rejected.
    pub fn schedule(&self, uid: &str, initial_delay: Duration, period: Duration) {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(timer = %self.inner.name, resource.uid = %uid, "timer.schedule.closed");
            return;
        }
        if period.is_zero() {
            warn!(
                timer = %self.inner.name,
                resource.uid = %uid,
                "⚠️  Periodic timer needs a non-zero period, ignoring"
            );
            return;
        }
        let mut periodic = self
            .inner
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if periodic.contains_key(uid) {
            warn!(
                timer = %self.inner.name,
                resource.uid = %uid,
                "Periodic timer already scheduled for resource, ignoring"
            );
            return;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<TimerInner<K>> = Arc::downgrade(&self.inner);
        let task_uid = uid.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.fire(&task_uid);
                drop(inner);
                tokio::time::sleep(period).await;
            }
        });
        periodic.insert(uid.to_string(), ScheduledTimer { id, task });
    }

    /// Cancel every timer of `uid`
    pub fn cancel(&self, uid: &str) {
        self.inner.cancel(uid);
    }

    /// Cancel only the pending one-shot of `uid`
    pub fn cancel_once(&self, uid: &str) {
        let removed = self
            .inner
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        if let Some(timer) = removed {
            timer.task.abort();
        }
    }

    /// Number of pending one-shot timers
    #[must_use]
    pub fn pending_once(&self) -> usize {
        self.inner
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_scheduled(&self, uid: &str) -> bool {
        self.inner
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uid)
            || self
                .inner
                .periodic
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(uid)
    }
}

impl<K: EngineResource> TimerInner<K> {
    fn fire(&self, uid: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            warn!(timer = %self.name, resource.uid = %uid, "Timer fired before the source was started");
            return;
        };
        handler.handle(Event::Timer(TimerEvent {
            uid: uid.to_string(),
            source_name: self.name.clone(),
        }));
    }

    fn cancel(&self, uid: &str) {
        let once = self
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        let periodic = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        for timer in once.into_iter().chain(periodic) {
            timer.task.abort();
        }
    }

    fn cancel_all(&self) {
        let once: Vec<ScheduledTimer> = self
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        let periodic: Vec<ScheduledTimer> = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in once.into_iter().chain(periodic) {
            timer.task.abort();
        }
    }
}

#[async_trait]
impl<K: EngineResource> EventSource<K> for TimerEventSource<K> {
    async fn start(&self, handler: EventHandler<K>) -> anyhow::Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!("timer event source '{}' is closed", self.inner.name);
        }
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel_all();
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(timer = %self.inner.name, "timer.closed");
        Ok(())
    }

    fn deregister_resource(&self, uid: &str) {
        self.inner.cancel(uid);
    }
}
