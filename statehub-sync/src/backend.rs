//! Authoritative store abstraction.
//!
//! The sync manager only ever talks to a [`SyncBackend`]; network transport
//! lives behind implementations of it.

use crate::error::{SyncError, SyncResult};
use crate::operation::SyncOperation;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{OperationKind, VersionRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;

/// The authoritative copy of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub payload: Value,
    pub version: VersionRecord,
}

/// The authoritative store operations are reconciled against.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Current authoritative copy, or `None` if the key does not exist.
    async fn fetch(&self, key: &str) -> SyncResult<Option<RemoteRecord>>;

    /// Applies the operation and returns the stored version, or `None`
    /// after a delete.
    ///
    /// Implementations should fail with [`SyncError::Conflict`] when the
    /// stored version is newer than `op.base_version`.
    async fn apply(&self, op: &SyncOperation) -> SyncResult<Option<VersionRecord>>;
}

/// In-process backend for tests and loopback hosts.
#[derive(Debug, Default)]
pub struct MemorySyncBackend {
    records: Mutex<HashMap<String, RemoteRecord>>,
    fail_next: AtomicU32,
    applied: AtomicUsize,
}

impl MemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the authoritative copy directly, as another writer would.
    pub fn put(&self, key: impl Into<String>, payload: Value, version: VersionRecord) {
        self.records
            .lock()
            .insert(key.into(), RemoteRecord { payload, version });
    }

    pub fn get(&self, key: &str) -> Option<RemoteRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Makes the next `n` calls fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful applies.
    pub fn apply_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> SyncResult<()> {
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(SyncError::Network("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SyncBackend for MemorySyncBackend {
    async fn fetch(&self, key: &str) -> SyncResult<Option<RemoteRecord>> {
        self.injected_failure()?;
        Ok(self.get(key))
    }

    async fn apply(&self, op: &SyncOperation) -> SyncResult<Option<VersionRecord>> {
        self.injected_failure()?;
        let mut records = self.records.lock();
        let current = records.get(&op.key).map_or(0, |r| r.version.version);
        if current > op.base_version {
            return Err(SyncError::Conflict {
                key: op.key.clone(),
                base: op.base_version,
                remote: current,
            });
        }

        let stored = match (op.kind, &op.payload) {
            (OperationKind::Delete, _) | (_, None) => {
                records.remove(&op.key);
                None
            }
            (_, Some(payload)) => {
                let version = VersionRecord::for_payload(
                    current + 1,
                    op.version.timestamp,
                    op.version.origin.clone(),
                    payload,
                );
                records.insert(
                    op.key.clone(),
                    RemoteRecord {
                        payload: payload.clone(),
                        version: version.clone(),
                    },
                );
                Some(version)
            }
        };
        self.applied.fetch_add(1, Ordering::SeqCst);
        debug!(key = %op.key, kind = %op.kind, "Applied to memory backend");
        Ok(stored)
    }
}
