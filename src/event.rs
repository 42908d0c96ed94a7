//! # Events
//!
//! Transient values that flow from event sources into the event handler.
//! Every event resolves to the UID of the resource it concerns; all triggers
//! (primary watch, timers, user-defined sources) converge on that key.

use crate::resource::{EngineResource, ResourceIdentity};
use kube::ResourceExt;

/// Watch action carried by a custom resource notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Added,
    Modified,
    Deleted,
    /// Transport-level signal, never forwarded to the handler
    Error,
}

impl EventAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Added => "added",
            EventAction::Modified => "modified",
            EventAction::Deleted => "deleted",
            EventAction::Error => "error",
        }
    }
}

/// Change of the primary resource observed by a watch
#[derive(Debug, Clone)]
pub struct CustomResourceEvent<K> {
    pub action: EventAction,
    pub resource: K,
    pub source_name: String,
}

/// Fired by a timer source for a resource it was scheduled for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub uid: String,
    pub source_name: String,
}

/// Raised by any other source (dependent resource watch, external trigger)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub uid: String,
    pub source_name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum Event<K> {
    CustomResource(CustomResourceEvent<K>),
    Timer(TimerEvent),
    External(ExternalEvent),
}

impl<K: EngineResource> Event<K> {
    /// UID of the resource this event targets
    pub fn related_uid(&self) -> Option<String> {
        match self {
            Event::CustomResource(e) => e.resource.uid(),
            Event::Timer(e) => Some(e.uid.clone()),
            Event::External(e) => Some(e.uid.clone()),
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            Event::CustomResource(e) => &e.source_name,
            Event::Timer(e) => &e.source_name,
            Event::External(e) => &e.source_name,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CustomResource(e) => e.action.as_str(),
            Event::Timer(_) => "timer",
            Event::External(_) => "external",
        }
    }

    /// Snapshot carried by the event, only custom resource events have one
    pub fn resource(&self) -> Option<&K> {
        match self {
            Event::CustomResource(e) => Some(&e.resource),
            Event::Timer(_) | Event::External(_) => None,
        }
    }

    pub fn identity(&self) -> Option<ResourceIdentity> {
        self.resource().and_then(ResourceIdentity::of)
    }
}
