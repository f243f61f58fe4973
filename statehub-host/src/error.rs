//! Error types for host start-up.

use statehub_cache::CacheError;
use statehub_registry::RegistryError;
use statehub_sync::SyncError;
use std::path::PathBuf;
use thiserror::Error;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid seed file: {0}")]
    Seed(#[from] serde_json::Error),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}
