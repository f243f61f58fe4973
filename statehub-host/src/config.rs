use crate::error::{HostError, HostResult};
use serde::Deserialize;
use statehub_bus::BusConfig;
use statehub_cache::CacheConfig;
use statehub_detect::DetectorConfig;
use statehub_queue::QueueConfig;
use statehub_registry::RegistryConfig;
use statehub_sync::SyncConfig;
use statehub_validate::ValidatorConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where durable state lives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file shared by the cache backend and the sync queue. Unset
    /// keeps everything in memory.
    pub sqlite_path: Option<PathBuf>,
}

/// Every service's configuration, one TOML table each. Missing tables
/// and fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub registry: RegistryConfig,
    pub bus: BusConfig,
    pub detector: DetectorConfig,
    pub validator: ValidatorConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

impl HostConfig {
    pub fn from_toml_str(s: &str) -> HostResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| HostError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Period of the change detector's cache pruning.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.detector.cache_max_age_ms.max(1_000))
    }
}
