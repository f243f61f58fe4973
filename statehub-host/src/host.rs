use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use serde::Deserialize;
use serde_json::Value;
use statehub_bus::EventBus;
use statehub_cache::{CacheManager, SqliteBackend};
use statehub_detect::ChangeDetector;
use statehub_queue::{RegistryExecutor, UpdateQueue};
use statehub_registry::{ComponentRegistration, StateRegistry};
use statehub_sync::{MemoryQueueStore, QueueStore, SqliteQueueStore, SyncBackend, SyncManager};
use statehub_types::TaskHandle;
use statehub_validate::Validator;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// One component to register at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedComponent {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SeedComponent {
    fn into_registration(self) -> ComponentRegistration {
        let mut registration = ComponentRegistration::new(self.id, self.category, self.state);
        if let Some(name) = self.name {
            registration = registration.name(name);
        }
        for tag in self.tags {
            registration = registration.tag(tag);
        }
        for dependency in self.depends_on {
            registration = registration.depends_on(dependency);
        }
        registration
    }
}

/// Reads a JSON array of [`SeedComponent`]s.
pub fn load_seed(path: impl AsRef<Path>) -> HostResult<Vec<SeedComponent>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| HostError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Every statehub service, wired together, with its background loops.
pub struct Host {
    bus: EventBus,
    detector: Arc<ChangeDetector>,
    validator: Arc<Validator>,
    registry: Arc<StateRegistry>,
    updates: UpdateQueue,
    cache: Arc<CacheManager>,
    sync: Arc<SyncManager>,
    tasks: Vec<TaskHandle>,
}

impl Host {
    /// Builds every service from `config` and starts their loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: HostConfig, backend: Arc<dyn SyncBackend>) -> HostResult<Self> {
        let bus = EventBus::new(config.bus.clone());
        let detector = Arc::new(ChangeDetector::new(config.detector.clone()));
        let validator = Arc::new(Validator::new(config.validator.clone()));
        let registry = Arc::new(
            StateRegistry::new(config.registry.clone())
                .with_detector(Arc::clone(&detector))
                .with_bus(bus.clone()),
        );
        let executor =
            RegistryExecutor::new(Arc::clone(&registry)).with_validator(Arc::clone(&validator));
        let updates = UpdateQueue::new(config.queue.clone(), Arc::new(executor));

        let mut cache = CacheManager::new(config.cache.clone());
        let store: Arc<dyn QueueStore> = match &config.storage.sqlite_path {
            Some(path) => {
                cache = cache.with_backend(Arc::new(SqliteBackend::open(path)?));
                Arc::new(SqliteQueueStore::open(path)?)
            }
            None => Arc::new(MemoryQueueStore::new()),
        };
        let cache = Arc::new(cache);
        let sync = Arc::new(
            SyncManager::open(config.sync.clone(), backend, store)?
                .with_cache(Arc::clone(&cache))
                .with_update_queue(updates.clone()),
        );

        let tasks = vec![
            bus.spawn_delivery_loop(),
            updates.spawn_dispatch_loop(),
            registry.spawn_health_check(),
            detector.spawn_pruning(config.prune_interval()),
            cache.spawn_cleanup(),
            sync.spawn_processing(),
        ];
        info!(
            tasks = tasks.len(),
            durable = config.storage.sqlite_path.is_some(),
            "Host started"
        );

        Ok(Self {
            bus,
            detector,
            validator,
            registry,
            updates,
            cache,
            sync,
            tasks,
        })
    }

    /// Registers `components` in order. Stops at the first failure.
    pub fn seed(&self, components: Vec<SeedComponent>) -> HostResult<usize> {
        let n = components.len();
        for component in components {
            self.registry.register(component.into_registration())?;
        }
        info!(components = n, "Seeded registry");
        Ok(n)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn updates(&self) -> &UpdateQueue {
        &self.updates
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Flushes partial event batches, drains queued updates, runs a final
    /// sync pass and joins every loop.
    pub async fn shutdown(self) {
        let flushed = self.bus.flush_batches();
        self.bus.process_pending();
        self.updates.drain().await;
        if let Err(e) = self.sync.ingest_cache_queue(usize::MAX) {
            warn!("Failed to ingest cache sync queue at shutdown: {}", e);
        }
        if let Err(e) = self.sync.process_queue().await {
            warn!("Final sync pass failed: {}", e);
        }
        for task in self.tasks {
            task.shutdown().await;
        }
        info!(flushed, "Host stopped");
    }
}
