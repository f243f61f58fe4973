//! Core type definitions for statehub.
//!
//! This crate defines the vocabulary shared by every statehub service:
//! - Component ids (caller-chosen strings) and generated ids (UUID v7)
//! - Priorities and operation kinds used by the queues
//! - Bus events
//! - Version records for synced payloads
//! - Clocks, retry backoff and owned background-task handles
//!
//! Payloads themselves are plain `serde_json::Value`s; no service interprets
//! them beyond field access.

mod clock;
mod event;
mod ids;
mod priority;
mod retry;
mod task;
mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{Event, BATCH_EVENT_TYPE};
pub use ids::{BatchId, ComponentId, ConflictId, EventId, OperationId, SubscriptionId};
pub use priority::{OperationKind, Priority};
pub use retry::RetryPolicy;
pub use task::TaskHandle;
pub use version::{checksum, VersionRecord};

/// Shallow overlay of `overlay`'s top-level fields onto `base`.
///
/// When either side is not an object the overlay replaces the base outright.
/// Used for patch updates, coalescing and the `merge` conflict strategy.
#[must_use]
pub fn overlay(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(b), serde_json::Value::Object(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}
