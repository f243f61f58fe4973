use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{OperationId, OperationKind, Priority};
use std::collections::BTreeSet;
use std::time::Duration;

/// Bookkeeping for one cache entry. All times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub expires_at: Option<u64>,
    /// Serialized payload size in bytes.
    pub size: usize,
    /// Starts at 1, bumped on every `set` of the same key.
    pub version: u64,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
    pub source: Option<String>,
}

impl EntryMetadata {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub metadata: EntryMetadata,
}

/// Identifies who wrote a persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStamp {
    pub session_id: String,
    pub writer_id: String,
}

/// On-disk layout: `{ data, metadata, session? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub data: Value,
    pub metadata: EntryMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStamp>,
}

/// Options for [`crate::CacheManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
    /// Write through to the persistence backend.
    pub persist: bool,
    pub source: Option<String>,
}

impl SetOptions {
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A change queued for background synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: OperationId,
    pub kind: OperationKind,
    pub key: String,
    pub data: Option<Value>,
    pub queued_at: u64,
}
