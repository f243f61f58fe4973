//! Tiered cache for statehub.
//!
//! [`CacheManager`] keeps entries in memory under size and count limits,
//! expires them by TTL, and evicts by a configurable [`EvictionPolicy`].
//! Entries may be written through to a [`PersistenceBackend`]; a memory miss
//! falls back to it. Changes bound for remote sync can be queued here and
//! drained by the sync manager.

mod entry;
mod error;
mod manager;
mod persist;
mod policy;

pub use entry::{CacheEntry, EntryMetadata, PersistedEntry, SessionStamp, SetOptions, SyncRequest};
pub use error::{CacheError, CacheResult};
pub use manager::{CacheConfig, CacheManager, CacheStats};
pub use persist::{MemoryBackend, PersistenceBackend, SqliteBackend};
pub use policy::{smart_score, EvictionPolicy};
