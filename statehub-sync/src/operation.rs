use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{OperationId, OperationKind, VersionRecord};
use std::collections::BTreeSet;

/// A local change waiting to reach the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub key: String,
    /// `None` for deletes.
    pub payload: Option<Value>,
    pub previous: Option<Value>,
    /// Remote version the change was made against.
    pub base_version: u64,
    /// Revision this change would become.
    pub version: VersionRecord,
    pub retries: u32,
    pub max_retries: u32,
    pub dependencies: Vec<OperationId>,
    pub tags: BTreeSet<String>,
    /// Epoch millis before which the operation is not retried.
    pub next_attempt_at: u64,
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn is_due(&self, now: u64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Options for [`crate::SyncManager::queue_operation`].
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Operations that must be applied first. Affects queue position.
    pub dependencies: Vec<OperationId>,
    pub tags: BTreeSet<String>,
    pub previous: Option<Value>,
    /// Overrides the configured retry budget.
    pub max_retries: Option<u32>,
}

impl QueueOptions {
    #[must_use]
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.dependencies.push(id);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}
