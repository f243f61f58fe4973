//! Conflict records and resolution strategies.

use crate::operation::SyncOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{overlay, ConflictId, VersionRecord};
use std::sync::Arc;

/// Default policy for conflicts without a per-key resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    /// Later timestamp wins; a tie goes to the server.
    #[default]
    LastWriteWins,
    /// Local top-level fields overlaid onto the remote payload.
    Merge,
    /// Leave the conflict for [`crate::SyncManager::resolve_conflict`].
    Manual,
    /// Decided by a resolver registered for the key. As a default strategy
    /// it behaves like `Manual`.
    Custom,
}

/// How a conflict is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
    Merge,
    Custom(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    Auto,
    Manual,
}

/// Per-key resolver. Returning `None` leaves the conflict pending.
pub type ConflictResolver = Arc<dyn Fn(&ConflictRecord) -> Option<Resolution> + Send + Sync>;

/// A local change that met a newer authoritative version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub key: String,
    pub operation: SyncOperation,
    /// `None` when the local change is a delete.
    pub local: Option<Value>,
    pub local_version: VersionRecord,
    /// `None` when the key no longer exists remotely.
    pub remote: Option<Value>,
    pub remote_version: VersionRecord,
    pub strategy: ConflictStrategy,
    pub detected_at: u64,
    /// Resolved payload. `None` once resolved means the key was deleted.
    pub outcome: Option<Value>,
    pub resolved_by: Option<ResolvedBy>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_by.is_some()
    }

    /// The payload `resolution` produces. `None` means the key is deleted.
    pub fn resolved_value(&self, resolution: &Resolution) -> Option<Value> {
        match resolution {
            Resolution::UseLocal => self.local.clone(),
            Resolution::UseRemote => self.remote.clone(),
            Resolution::Merge => match (&self.remote, &self.local) {
                (Some(remote), Some(local)) => Some(overlay(remote, local)),
                (None, local) => local.clone(),
                (remote, None) => remote.clone(),
            },
            Resolution::Custom(value) => Some(value.clone()),
        }
    }
}

/// The resolution `strategy` picks for `record`, or `None` for manual.
pub fn auto_resolution(strategy: ConflictStrategy, record: &ConflictRecord) -> Option<Resolution> {
    match strategy {
        ConflictStrategy::ServerWins => Some(Resolution::UseRemote),
        ConflictStrategy::ClientWins => Some(Resolution::UseLocal),
        ConflictStrategy::LastWriteWins => {
            if record.local_version.timestamp > record.remote_version.timestamp {
                Some(Resolution::UseLocal)
            } else {
                Some(Resolution::UseRemote)
            }
        }
        ConflictStrategy::Merge => Some(Resolution::Merge),
        ConflictStrategy::Manual | ConflictStrategy::Custom => None,
    }
}
