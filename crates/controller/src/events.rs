//! Kubernetes Events for ResourceSets. Publishing is fire-and-forget: a
//! failed event is logged and never fails a reconcile.

use std::sync::Mutex;

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use rset_core::crd::ResourceSet;

pub const ACTION_RECONCILE: &str = "Reconcile";

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, rs: &ResourceSet, type_: EventType, reason: &str, message: &str);
}

/// Publishes through the kube-runtime `Recorder`.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        Self { client, reporter: Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() } }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, rs: &ResourceSet, type_: EventType, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), rs.object_ref(&()));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: ACTION_RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(name = %rs.name_any(), reason, error = %e, "failed to publish event");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, rs: &ResourceSet, type_: EventType, reason: &str, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: rs.key().to_string(),
                type_,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        }
    }
}
