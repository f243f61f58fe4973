//! Offline sync for statehub.
//!
//! [`SyncManager`] keeps a durable queue of local changes and reconciles it
//! against an authoritative [`SyncBackend`]. Each change carries the remote
//! version it was made against; when the remote has moved on, a
//! [`ConflictRecord`] is raised and settled by a per-key resolver, the
//! configured [`ConflictStrategy`], or by hand.

mod backend;
mod conflict;
mod error;
mod manager;
mod operation;
mod store;

pub use backend::{MemorySyncBackend, RemoteRecord, SyncBackend};
pub use conflict::{
    auto_resolution, ConflictRecord, ConflictResolver, ConflictStrategy, Resolution, ResolvedBy,
};
pub use error::{SyncError, SyncResult};
pub use manager::{FailedOperation, SyncConfig, SyncManager, SyncReport, SyncStats};
pub use operation::{QueueOptions, SyncOperation};
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
