use crate::error::QueueError;
use serde_json::Value;
use statehub_types::{BatchId, OperationId, OperationKind, Priority};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Called with the request when it is cancelled before starting.
pub type CancelCallback = Arc<dyn Fn(&UpdateRequest) + Send + Sync>;

/// One state change waiting to be applied.
#[derive(Clone)]
pub struct UpdateRequest {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Target component id.
    pub key: String,
    /// Category for `Create`; ignored otherwise.
    pub category: Option<String>,
    pub payload: Value,
    pub priority: Priority,
    pub source: Option<String>,
    /// Updates that must finish before this one is admitted.
    pub dependencies: BTreeSet<OperationId>,
    /// Requests with equal coalesce keys and kinds merge while queued.
    /// Defaults to `key`.
    pub coalesce_key: Option<String>,
    /// Overrides the queue's retry budget.
    pub max_retries: Option<u32>,
    pub on_cancel: Option<CancelCallback>,
}

impl UpdateRequest {
    pub fn new(kind: OperationKind, key: impl Into<String>, payload: Value) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            key: key.into(),
            category: None,
            payload,
            priority: Priority::Normal,
            source: None,
            dependencies: BTreeSet::new(),
            coalesce_key: None,
            max_retries: None,
            on_cancel: None,
        }
    }

    pub fn create(key: impl Into<String>, category: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Create, key, payload).category(category)
    }

    pub fn update(key: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Update, key, payload)
    }

    pub fn patch(key: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Patch, key, payload)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, key, Value::Null)
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.dependencies.insert(id);
        self
    }

    #[must_use]
    pub fn coalesce_key(mut self, key: impl Into<String>) -> Self {
        self.coalesce_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn on_cancel(mut self, f: impl Fn(&UpdateRequest) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(f));
        self
    }

    pub(crate) fn coalesce_slot(&self) -> (String, OperationKind) {
        let key = self.coalesce_key.clone().unwrap_or_else(|| self.key.clone());
        (key, self.kind)
    }
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("on_cancel", &self.on_cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// A request that did not apply, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpdate {
    pub id: OperationId,
    pub key: String,
    pub error: QueueError,
}

/// Outcome of one dispatch unit: a batch, or a single request when
/// `batch_id` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub batch_id: Option<BatchId>,
    pub succeeded: Vec<OperationId>,
    pub failed: Vec<FailedUpdate>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}
