//! Operational events recorded against resources.
//!
//! Every state transition and failure of a reconciler produces an [`Event`].
//! Events are kept in a bounded ring for the HTTP API, broadcast as JSON lines
//! on the [`EventBus`], and mirrored to the log.

use chrono::{DateTime, Utc};
use kude_common::ObjectReference;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const DEFAULT_BUFFER: usize = 256;
pub const DEFAULT_EVENT_HISTORY: usize = 1024;

/// Broadcast channel for daemon events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub involved_object: ObjectReference,
    pub timestamp: DateTime<Utc>,
}

/// Records events against resources.
pub struct EventRecorder {
    history: RwLock<VecDeque<Event>>,
    capacity: usize,
    bus: EventBus,
}

impl EventRecorder {
    pub fn new(capacity: usize, bus: EventBus) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_HISTORY))),
            capacity,
            bus,
        }
    }

    pub fn normal(&self, object: &ObjectReference, reason: &str, message: impl Into<String>) {
        self.record(EventType::Normal, object, reason, message.into());
    }

    pub fn warning(&self, object: &ObjectReference, reason: &str, message: impl Into<String>) {
        self.record(EventType::Warning, object, reason, message.into());
    }

    fn record(&self, event_type: EventType, object: &ObjectReference, reason: &str, message: String) {
        match event_type {
            EventType::Normal => info!(
                kind = %object.kind,
                namespace = %object.namespace,
                name = %object.name,
                reason,
                "{message}"
            ),
            EventType::Warning => warn!(
                kind = %object.kind,
                namespace = %object.namespace,
                name = %object.name,
                reason,
                "{message}"
            ),
        }

        let event = Event {
            event_type,
            reason: reason.to_string(),
            message,
            involved_object: object.clone(),
            timestamp: Utc::now(),
        };
        self.bus.emit("resource_event", &event);

        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Events recorded against one object, oldest first.
    pub fn for_object(&self, kind: &str, namespace: &str, name: &str) -> Vec<Event> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .filter(|e| {
                e.involved_object.kind == kind
                    && e.involved_object.namespace == namespace
                    && e.involved_object.name == name
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
