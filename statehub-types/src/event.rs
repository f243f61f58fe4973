//! Events routed by the event bus.
//!
//! An event is immutable once published. The bus only looks at the topic,
//! the optional target and the batch metadata; the payload is opaque JSON.

use crate::{BatchId, EventId, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Event type used for the synthetic event produced by batched delivery.
pub const BATCH_EVENT_TYPE: &str = "batch";

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Free-form event type (e.g. `"state_changed"`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Dot-segmented routing topic.
    pub topic: String,

    /// Who published the event.
    pub source: String,

    /// When set, only subscriptions registered under this subscriber name receive it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,

    pub payload: Value,

    #[serde(default)]
    pub priority: Priority,

    /// Set when the event was published as part of `publish_batch` or is a batch aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,

    /// Position inside the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

impl Event {
    /// Creates an event on `topic` with default metadata.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            event_type: "message".to_string(),
            topic: topic.into(),
            source: "anonymous".to_string(),
            target: None,
            timestamp: now_millis(),
            payload,
            priority: Priority::Normal,
            batch_id: None,
            sequence: None,
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the publishing source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Restricts delivery to one subscriber.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builds the single event handed to a batched subscription.
    ///
    /// The payload is `{"count": n, "events": [...]}` with the accumulated events
    /// in delivery order.
    #[must_use]
    pub fn aggregate(topic: impl Into<String>, events: &[Event]) -> Self {
        let list: Vec<Value> = events
            .iter()
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect();
        let priority = events
            .iter()
            .map(|e| e.priority)
            .max()
            .unwrap_or_default();
        let mut event = Self::new(
            topic,
            serde_json::json!({ "count": events.len(), "events": list }),
        )
        .with_type(BATCH_EVENT_TYPE)
        .with_source("event-bus")
        .with_priority(priority);
        event.batch_id = Some(BatchId::new());
        event
    }

    /// Returns true if this is a batch aggregate.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.event_type == BATCH_EVENT_TYPE
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
