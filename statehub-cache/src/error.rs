use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry cannot fit, either because it is larger than the cache or
    /// because the manual policy forbids evicting to make room.
    #[error("cache capacity exceeded: entry needs {needed} bytes, limit is {limit}")]
    CapacityExceeded { needed: usize, limit: usize },

    #[error("sync queue full ({capacity} pending)")]
    SyncQueueFull { capacity: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
