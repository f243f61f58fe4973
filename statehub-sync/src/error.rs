//! Error types for the sync layer.

use statehub_cache::CacheError;
use statehub_types::{ConflictId, OperationId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient backend failure; the operation is retried.
    #[error("network error: {0}")]
    Network(String),

    /// The authoritative copy moved past the version the change was made against.
    #[error("conflict on {key}: remote version {remote} is newer than base {base}")]
    Conflict { key: String, base: u64, remote: u64 },

    #[error("operation {id} failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        id: OperationId,
        attempts: u32,
        last_error: String,
    },

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("sync queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}
