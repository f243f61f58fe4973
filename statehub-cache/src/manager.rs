use crate::entry::{CacheEntry, EntryMetadata, PersistedEntry, SessionStamp, SetOptions, SyncRequest};
use crate::error::{CacheError, CacheResult};
use crate::persist::PersistenceBackend;
use crate::policy::{select_victim, EvictionPolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{Clock, OperationId, OperationKind, SystemClock, TaskHandle};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed payload size of in-memory entries.
    pub max_size_bytes: usize,
    pub max_entries: usize,
    /// Applied when `set` is called without a TTL. `None` means no expiry.
    pub default_ttl_ms: Option<u64>,
    pub policy: EvictionPolicy,
    pub cleanup_interval_ms: u64,
    /// Keys always persisted. Exact keys, or prefixes ending in `*`.
    pub persistent_keys: Vec<String>,
    /// Keys never persisted, even when requested. Same syntax.
    pub volatile_keys: Vec<String>,
    /// Stamp written with persisted entries to detect other writers.
    pub session: Option<SessionStamp>,
    pub max_sync_queue: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            max_entries: 10_000,
            default_ttl_ms: Some(60 * 60 * 1000),
            policy: EvictionPolicy::Smart,
            cleanup_interval_ms: 60_000,
            persistent_keys: Vec::new(),
            volatile_keys: Vec::new(),
            session: None,
            max_sync_queue: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits served by the persistence backend after a memory miss.
    pub backend_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub persisted: u64,
    /// Persisted entries loaded that were written by another writer.
    pub foreign_writes: u64,
    pub sync_queued: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    backend_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    persisted: AtomicU64,
    foreign_writes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    total_size: usize,
}

impl Store {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_size -= entry.metadata.size;
        Some(entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_size += entry.metadata.size;
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.total_size -= old.metadata.size;
        }
    }

    fn purge_expired(&mut self, now: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.metadata.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }
}

fn matches_key(patterns: &[String], key: &str) -> bool {
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => p == key,
    })
}

/// Tiered key/value cache.
///
/// Memory is the first tier; entries marked for persistence are written
/// through to a [`PersistenceBackend`] and rehydrated on a memory miss.
/// Evict-then-insert happens under one lock, so the size limits hold for
/// every observer.
pub struct CacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    store: Mutex<Store>,
    sync_queue: Mutex<VecDeque<SyncRequest>>,
    counters: Counters,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            backend: None,
            store: Mutex::new(Store::default()),
            sync_queue: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether `key` would be written to the backend.
    pub fn should_persist(&self, key: &str, requested: bool) -> bool {
        if self.backend.is_none() || matches_key(&self.config.volatile_keys, key) {
            return false;
        }
        requested || matches_key(&self.config.persistent_keys, key)
    }

    // ── Reads and writes ─────────────────────────────────────────

    /// Stores `data` under `key`, evicting per policy until it fits.
    pub fn set(&self, key: impl Into<String>, data: Value, options: SetOptions) -> CacheResult<()> {
        let key = key.into();
        let size = serde_json::to_vec(&data)?.len();
        let now = self.clock.now_millis();
        let ttl_ms = options
            .ttl
            .map(|d| d.as_millis() as u64)
            .or(self.config.default_ttl_ms);
        let persist = self.should_persist(&key, options.persist);

        let metadata = {
            let mut store = self.store.lock();
            let previous = store.entries.get(&key).map(|e| e.metadata.clone());
            self.make_room(&mut store, &key, size, now)?;

            let metadata = EntryMetadata {
                created_at: now,
                last_accessed: now,
                access_count: 0,
                expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
                size,
                version: previous.map_or(1, |p| p.version + 1),
                tags: options.tags,
                priority: options.priority,
                source: options.source,
            };
            store.insert(CacheEntry {
                key: key.clone(),
                data: data.clone(),
                metadata: metadata.clone(),
            });
            metadata
        };
        debug!(key = %key, size, persist, "Cache set");

        if persist {
            self.persist(&key, data, metadata)?;
        } else {
            // An older persisted copy would shadow this write after eviction.
            self.remove_persisted(&key);
        }
        Ok(())
    }

    /// Evicts until `size` more bytes (replacing `key` if present) fit.
    fn make_room(&self, store: &mut Store, key: &str, size: usize, now: u64) -> CacheResult<()> {
        let limit = self.config.max_size_bytes;
        if size > limit {
            return Err(CacheError::CapacityExceeded {
                needed: size,
                limit,
            });
        }

        let fits = |store: &Store| {
            let replaced = store.entries.get(key);
            let bytes = store.total_size - replaced.map_or(0, |e| e.metadata.size) + size;
            let count = store.entries.len() - usize::from(replaced.is_some()) + 1;
            bytes <= limit && count <= self.config.max_entries
        };
        if fits(&*store) {
            return Ok(());
        }

        for expired in store.purge_expired(now) {
            bump(&self.counters.expirations);
            debug!(key = %expired, "Expired entry purged to make room");
        }

        while !fits(&*store) {
            let victim = select_victim(
                self.config.policy,
                store.entries.values().filter(|e| e.key != key),
                now,
            )
            .map(|e| e.key.clone());
            let Some(victim) = victim else {
                warn!(key = %key, size, policy = ?self.config.policy, "Cache full, rejecting entry");
                return Err(CacheError::CapacityExceeded {
                    needed: size,
                    limit,
                });
            };
            store.remove(&victim);
            bump(&self.counters.evictions);
            debug!(key = %victim, policy = ?self.config.policy, "Evicted");
        }
        Ok(())
    }

    fn persist(&self, key: &str, data: Value, metadata: EntryMetadata) -> CacheResult<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let entry = PersistedEntry {
            data,
            metadata,
            session: self.config.session.clone(),
        };
        backend.save(key, &entry)?;
        bump(&self.counters.persisted);
        Ok(())
    }

    /// Returns the payload, or `None` if absent or expired.
    ///
    /// A memory miss falls back to the persistence backend; a live persisted
    /// entry is loaded back into memory.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        {
            let mut store = self.store.lock();
            if let Some(entry) = store.entries.get_mut(key) {
                if !entry.metadata.is_expired(now) {
                    entry.metadata.last_accessed = now;
                    entry.metadata.access_count += 1;
                    bump(&self.counters.hits);
                    return Some(entry.data.clone());
                }
                store.remove(key);
                bump(&self.counters.expirations);
                drop(store);
                self.remove_persisted(key);
                bump(&self.counters.misses);
                return None;
            }
        }

        match self.load_persisted(key, now) {
            Some(data) => {
                bump(&self.counters.hits);
                bump(&self.counters.backend_hits);
                Some(data)
            }
            None => {
                bump(&self.counters.misses);
                None
            }
        }
    }

    fn load_persisted(&self, key: &str, now: u64) -> Option<Value> {
        let backend = self.backend.as_ref()?;
        let persisted = match backend.load(key) {
            Ok(found) => found?,
            Err(e) => {
                warn!(key = %key, "Failed to load persisted entry: {}", e);
                return None;
            }
        };
        if persisted.metadata.is_expired(now) {
            bump(&self.counters.expirations);
            self.remove_persisted(key);
            return None;
        }
        if let (Some(theirs), Some(ours)) = (&persisted.session, &self.config.session) {
            if theirs.writer_id != ours.writer_id {
                bump(&self.counters.foreign_writes);
                warn!(
                    key = %key,
                    writer = %theirs.writer_id,
                    session = %theirs.session_id,
                    "Persisted entry was written by another writer"
                );
            }
        }

        let mut metadata = persisted.metadata;
        metadata.last_accessed = now;
        metadata.access_count += 1;
        let data = persisted.data;
        let mut store = self.store.lock();
        if self.make_room(&mut store, key, metadata.size, now).is_ok() {
            store.insert(CacheEntry {
                key: key.to_string(),
                data: data.clone(),
                metadata,
            });
        }
        Some(data)
    }

    fn remove_persisted(&self, key: &str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.remove(key) {
                warn!(key = %key, "Failed to remove persisted entry: {}", e);
            }
        }
    }

    /// Metadata of a live in-memory entry, without counting an access.
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        let now = self.clock.now_millis();
        self.store
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.metadata.is_expired(now))
            .map(|e| e.metadata.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.metadata(key).is_some()
    }

    /// Removes `key` from memory and the backend.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let in_memory = self.store.lock().remove(key).is_some();
        let persisted = match &self.backend {
            Some(backend) => backend.remove(key)?,
            None => false,
        };
        Ok(in_memory || persisted)
    }

    /// Removes every entry from memory and the backend.
    pub fn clear(&self) -> CacheResult<()> {
        let mut store = self.store.lock();
        store.entries.clear();
        store.total_size = 0;
        drop(store);
        if let Some(backend) = &self.backend {
            backend.clear()?;
        }
        info!("Cache cleared");
        Ok(())
    }

    /// Removes every entry carrying any of `tags`. Returns the number removed.
    pub fn invalidate_by_tags(&self, tags: &[&str]) -> CacheResult<usize> {
        let hit = |meta: &EntryMetadata| tags.iter().any(|t| meta.tags.contains(*t));

        let mut removed: Vec<String> = {
            let mut store = self.store.lock();
            let keys: Vec<String> = store
                .entries
                .values()
                .filter(|e| hit(&e.metadata))
                .map(|e| e.key.clone())
                .collect();
            for key in &keys {
                store.remove(key);
            }
            keys
        };

        if let Some(backend) = &self.backend {
            for key in backend.keys()? {
                if let Some(persisted) = backend.load(&key)? {
                    if hit(&persisted.metadata) {
                        backend.remove(&key)?;
                        if !removed.contains(&key) {
                            removed.push(key);
                        }
                    }
                }
            }
        }
        debug!(tags = ?tags, removed = removed.len(), "Invalidated by tags");
        Ok(removed.len())
    }

    /// Purges expired in-memory entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let expired = self.store.lock().purge_expired(now);
        for key in &expired {
            bump(&self.counters.expirations);
            self.remove_persisted(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired entries cleaned up");
        }
        expired.len()
    }

    /// Runs [`CacheManager::cleanup_expired`] every configured interval.
    pub fn spawn_cleanup(self: &Arc<Self>) -> TaskHandle {
        let cache = Arc::clone(self);
        TaskHandle::periodic("cache-cleanup", self.config.cleanup_interval(), move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.cleanup_expired();
            }
        })
    }

    /// Live in-memory keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let mut keys: Vec<String> = self
            .store
            .lock()
            .entries
            .values()
            .filter(|e| !e.metadata.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> usize {
        self.store.lock().total_size
    }

    // ── Background sync queue ────────────────────────────────────

    /// Queues a change for the sync manager. Does not touch the cache itself.
    pub fn queue_sync(
        &self,
        kind: OperationKind,
        key: impl Into<String>,
        data: Option<Value>,
    ) -> CacheResult<OperationId> {
        let mut queue = self.sync_queue.lock();
        if queue.len() >= self.config.max_sync_queue {
            return Err(CacheError::SyncQueueFull {
                capacity: self.config.max_sync_queue,
            });
        }
        let request = SyncRequest {
            id: OperationId::new(),
            kind,
            key: key.into(),
            data,
            queued_at: self.clock.now_millis(),
        };
        let id = request.id;
        debug!(key = %request.key, kind = %kind, "Queued for sync");
        queue.push_back(request);
        Ok(id)
    }

    /// Takes up to `max` queued sync requests, oldest first.
    pub fn drain_sync_queue(&self, max: usize) -> Vec<SyncRequest> {
        let mut queue = self.sync_queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn sync_queue_len(&self) -> usize {
        self.sync_queue.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, total_size) = {
            let store = self.store.lock();
            (store.entries.len(), store.total_size)
        };
        let c = &self.counters;
        CacheStats {
            entries,
            total_size,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            backend_hits: c.backend_hits.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            foreign_writes: c.foreign_writes.load(Ordering::Relaxed),
            sync_queued: self.sync_queue_len(),
        }
    }
}
