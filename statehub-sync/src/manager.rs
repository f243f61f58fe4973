use crate::backend::{RemoteRecord, SyncBackend};
use crate::conflict::{
    auto_resolution, ConflictRecord, ConflictResolver, ConflictStrategy, Resolution, ResolvedBy,
};
use crate::error::{SyncError, SyncResult};
use crate::operation::{QueueOptions, SyncOperation};
use crate::store::{MemoryQueueStore, QueueStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_cache::{CacheManager, SetOptions};
use statehub_queue::{UpdateQueue, UpdateRequest};
use statehub_types::{
    Clock, ConflictId, OperationId, OperationKind, RetryPolicy, SystemClock, TaskHandle,
    VersionRecord,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the sync manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations examined per `process_queue` call.
    pub batch_size: usize,
    pub default_strategy: ConflictStrategy,
    pub retry: RetryPolicy,
    pub process_interval_ms: u64,
    /// Origin stamped on local versions.
    pub origin: String,
    pub max_queue_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            default_strategy: ConflictStrategy::LastWriteWins,
            retry: RetryPolicy::default(),
            process_interval_ms: 5_000,
            origin: "local".to_string(),
            max_queue_size: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

/// An operation that ran out of retries, with the final error.
#[derive(Debug)]
pub struct FailedOperation {
    pub operation: SyncOperation,
    pub error: SyncError,
}

/// Aggregate result of one [`SyncManager::process_queue`] pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub applied: Vec<OperationId>,
    /// Retried later; still queued.
    pub retried: Vec<OperationId>,
    pub failed: Vec<FailedOperation>,
    /// Conflicts settled automatically.
    pub resolved: Vec<ConflictId>,
    /// Conflicts left for manual resolution.
    pub conflicts: Vec<ConflictId>,
    /// Queued operations skipped because their retry time has not come.
    pub deferred: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub queued: usize,
    pub pending_conflicts: usize,
    pub applied: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub retries: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct SyncState {
    queue: VecDeque<SyncOperation>,
    conflicts: BTreeMap<ConflictId, ConflictRecord>,
    /// Last known authoritative version per key.
    versions: HashMap<String, VersionRecord>,
    /// Most recently settled conflicts, oldest first.
    resolved: VecDeque<ConflictRecord>,
}

const RESOLVED_HISTORY: usize = 100;

enum Outcome {
    Applied(Option<VersionRecord>),
    Conflict(Box<ConflictRecord>),
    Failed(SyncError),
}

/// Reconciles locally queued changes against a [`SyncBackend`].
///
/// The queue, open conflicts and known remote versions live in a
/// [`QueueStore`] and are reloaded by [`SyncManager::open`].
pub struct SyncManager {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn SyncBackend>,
    store: Arc<dyn QueueStore>,
    state: Mutex<SyncState>,
    resolvers: RwLock<HashMap<String, ConflictResolver>>,
    cache: Option<Arc<CacheManager>>,
    updates: Option<UpdateQueue>,
    /// Serializes `process_queue` passes.
    processing: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl SyncManager {
    /// Creates a manager with an in-memory store.
    pub fn new(config: SyncConfig, backend: Arc<dyn SyncBackend>) -> Self {
        Self::with_state(config, backend, Arc::new(MemoryQueueStore::new()), SyncState::default())
    }

    /// Creates a manager on `store`, reloading whatever it holds.
    pub fn open(
        config: SyncConfig,
        backend: Arc<dyn SyncBackend>,
        store: Arc<dyn QueueStore>,
    ) -> SyncResult<Self> {
        let state = SyncState {
            queue: store.load_queue()?.into(),
            conflicts: store
                .load_conflicts()?
                .into_iter()
                .map(|c| (c.id, c))
                .collect(),
            versions: store.load_versions()?,
            resolved: VecDeque::new(),
        };
        info!(
            queued = state.queue.len(),
            conflicts = state.conflicts.len(),
            "Sync state loaded"
        );
        Ok(Self::with_state(config, backend, store, state))
    }

    fn with_state(
        config: SyncConfig,
        backend: Arc<dyn SyncBackend>,
        store: Arc<dyn QueueStore>,
        state: SyncState,
    ) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            backend,
            store,
            state: Mutex::new(state),
            resolvers: RwLock::new(HashMap::new()),
            cache: None,
            updates: None,
            processing: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refreshes cache entries as operations and resolutions land.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Applies resolved conflicts locally through `updates`.
    #[must_use]
    pub fn with_update_queue(mut self, updates: UpdateQueue) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ── Queueing ─────────────────────────────────────────────────

    /// Queues a local change.
    ///
    /// The operation goes right after its last dependency still in the
    /// queue, or at the end. Its base version is the last remote version
    /// seen for `key`.
    pub fn queue_operation(
        &self,
        kind: OperationKind,
        key: impl Into<String>,
        payload: Option<Value>,
        options: QueueOptions,
    ) -> SyncResult<OperationId> {
        let key = key.into();
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if state.queue.len() >= self.config.max_queue_size {
            return Err(SyncError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let base_version = state.versions.get(&key).map_or(0, |v| v.version);
        let version = VersionRecord::for_payload(
            base_version + 1,
            now,
            self.config.origin.clone(),
            payload.as_ref().unwrap_or(&Value::Null),
        );
        let op = SyncOperation {
            id: OperationId::new(),
            kind,
            key,
            payload,
            previous: options.previous,
            base_version,
            version,
            retries: 0,
            max_retries: options.max_retries.unwrap_or(self.config.retry.max_retries),
            dependencies: options.dependencies,
            tags: options.tags,
            next_attempt_at: now,
            last_error: None,
        };
        let id = op.id;

        let position = state
            .queue
            .iter()
            .rposition(|queued| op.dependencies.contains(&queued.id))
            .map_or(state.queue.len(), |i| i + 1);
        debug!(op = %id, key = %op.key, kind = %kind, position, "Queued sync operation");
        state.queue.insert(position, op);
        self.store.save_queue(state.queue.make_contiguous())?;
        Ok(id)
    }

    /// Moves up to `max` requests from the cache's sync queue into this one.
    pub fn ingest_cache_queue(&self, max: usize) -> SyncResult<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let requests = cache.drain_sync_queue(max);
        let n = requests.len();
        for request in requests {
            self.queue_operation(request.kind, request.key, request.data, QueueOptions::default())?;
        }
        Ok(n)
    }

    pub fn register_conflict_resolver(
        &self,
        key: impl Into<String>,
        resolver: impl Fn(&ConflictRecord) -> Option<Resolution> + Send + Sync + 'static,
    ) {
        self.resolvers.write().insert(key.into(), Arc::new(resolver));
    }

    // ── Processing ───────────────────────────────────────────────

    /// Runs one pass over up to `batch_size` due operations.
    ///
    /// Each operation is checked against the remote version; a newer remote
    /// version raises a conflict instead of writing. Failures are retried
    /// with backoff until the operation's budget runs out. One failing
    /// operation never stops the rest of the batch.
    pub async fn process_queue(&self) -> SyncResult<SyncReport> {
        let _pass = self.processing.lock().await;
        let now = self.clock.now_millis();
        let mut report = SyncReport::default();

        let batch: Vec<SyncOperation> = {
            let state = self.state.lock();
            report.deferred = state.queue.iter().filter(|op| !op.is_due(now)).count();
            state
                .queue
                .iter()
                .filter(|op| op.is_due(now))
                .take(self.config.batch_size)
                .cloned()
                .collect()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(batch = batch.len(), deferred = report.deferred, "Processing sync queue");

        for op in batch {
            let outcome = self.sync_one(&op, now).await;
            match outcome {
                Outcome::Applied(stored) => {
                    self.remove_queued(op.id);
                    self.record_version(&op.key, stored.as_ref())?;
                    self.refresh_cache(&op.key, op.payload.as_ref());
                    bump(&self.counters.applied);
                    report.applied.push(op.id);
                }
                Outcome::Conflict(mut record) => {
                    self.remove_queued(op.id);
                    bump(&self.counters.conflicts_detected);
                    warn!(
                        key = %record.key,
                        base = op.base_version,
                        remote = record.remote_version.version,
                        "Sync conflict"
                    );
                    let id = record.id;
                    let (strategy, resolution) = self.pick_resolution(&record);
                    record.strategy = strategy;
                    match resolution {
                        Some(resolution) => {
                            let pending = (*record).clone();
                            match self.settle(*record, &resolution, ResolvedBy::Auto) {
                                Ok(_) => report.resolved.push(id),
                                Err(e) => {
                                    warn!(
                                        conflict = %id,
                                        key = %pending.key,
                                        error = %e,
                                        "Automatic resolution failed, conflict left pending"
                                    );
                                    self.state.lock().conflicts.insert(id, pending);
                                    report.conflicts.push(id);
                                }
                            }
                        }
                        None => {
                            self.state.lock().conflicts.insert(id, *record);
                            report.conflicts.push(id);
                        }
                    }
                }
                Outcome::Failed(error) => {
                    let id = op.id;
                    match self.retry_or_fail(op, error, now) {
                        Some(failed) => report.failed.push(failed),
                        None => report.retried.push(id),
                    }
                }
            }
        }
        self.persist()?;
        info!(
            applied = report.applied.len(),
            resolved = report.resolved.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            "Sync pass complete"
        );
        Ok(report)
    }

    async fn sync_one(&self, op: &SyncOperation, now: u64) -> Outcome {
        let remote = match self.backend.fetch(&op.key).await {
            Ok(remote) => remote,
            Err(e) => return Outcome::Failed(e),
        };
        if let Some(remote) = remote {
            if remote.version.version > op.base_version {
                return Outcome::Conflict(Box::new(self.conflict(op, remote, now)));
            }
        }

        match self.backend.apply(op).await {
            Ok(stored) => Outcome::Applied(stored),
            // The remote moved between fetch and apply.
            Err(SyncError::Conflict { .. }) => match self.backend.fetch(&op.key).await {
                Ok(Some(remote)) => Outcome::Conflict(Box::new(self.conflict(op, remote, now))),
                Ok(None) => Outcome::Failed(SyncError::Network(format!(
                    "{} vanished during apply",
                    op.key
                ))),
                Err(e) => Outcome::Failed(e),
            },
            Err(e) => Outcome::Failed(e),
        }
    }

    fn conflict(&self, op: &SyncOperation, remote: RemoteRecord, now: u64) -> ConflictRecord {
        ConflictRecord {
            id: ConflictId::new(),
            key: op.key.clone(),
            operation: op.clone(),
            local: op.payload.clone(),
            local_version: op.version.clone(),
            remote: Some(remote.payload),
            remote_version: remote.version,
            strategy: self.config.default_strategy,
            detected_at: now,
            outcome: None,
            resolved_by: None,
        }
    }

    /// The strategy that decides `record` and the resolution it picks.
    fn pick_resolution(&self, record: &ConflictRecord) -> (ConflictStrategy, Option<Resolution>) {
        let resolver = self.resolvers.read().get(&record.key).cloned();
        match resolver {
            Some(resolver) => (ConflictStrategy::Custom, resolver(record)),
            None => (
                self.config.default_strategy,
                auto_resolution(self.config.default_strategy, record),
            ),
        }
    }

    /// Applies `resolution`: the remote version becomes the known base, the
    /// resolved payload is queued when it differs from the remote copy, and
    /// local state is brought in line.
    fn settle(
        &self,
        mut record: ConflictRecord,
        resolution: &Resolution,
        by: ResolvedBy,
    ) -> SyncResult<Option<OperationId>> {
        let value = record.resolved_value(resolution);
        self.record_version(&record.key, Some(&record.remote_version))?;

        let requeued = if value == record.remote {
            None
        } else {
            let kind = if value.is_some() {
                OperationKind::Update
            } else {
                OperationKind::Delete
            };
            Some(self.queue_operation(
                kind,
                record.key.clone(),
                value.clone(),
                QueueOptions::default()
                    .previous(record.remote.clone().unwrap_or(Value::Null))
                    .max_retries(record.operation.max_retries),
            )?)
        };

        self.refresh_cache(&record.key, value.as_ref());
        self.apply_locally(&record.key, value.as_ref());
        bump(&self.counters.conflicts_resolved);
        info!(
            key = %record.key,
            conflict = %record.id,
            by = ?by,
            requeued = requeued.is_some(),
            "Conflict resolved"
        );
        record.outcome = value;
        record.resolved_by = Some(by);
        let mut state = self.state.lock();
        if state.resolved.len() == RESOLVED_HISTORY {
            state.resolved.pop_front();
        }
        state.resolved.push_back(record);
        Ok(requeued)
    }

    /// Schedules a retry, or returns the failure once the budget is spent.
    fn retry_or_fail(
        &self,
        op: SyncOperation,
        error: SyncError,
        now: u64,
    ) -> Option<FailedOperation> {
        let mut state = self.state.lock();
        let Some(queued) = state.queue.iter_mut().find(|q| q.id == op.id) else {
            return None;
        };
        let policy = RetryPolicy {
            max_retries: queued.max_retries,
            ..self.config.retry
        };
        if policy.allows(queued.retries) {
            let delay = policy.delay(queued.retries);
            queued.retries += 1;
            queued.next_attempt_at = now.saturating_add(delay.as_millis() as u64);
            queued.last_error = Some(error.to_string());
            bump(&self.counters.retries);
            warn!(
                op = %op.id,
                key = %op.key,
                retry = queued.retries,
                delay_ms = delay.as_millis() as u64,
                "Sync operation failed, will retry: {}",
                error
            );
            return None;
        }

        let attempts = queued.retries + 1;
        state.queue.retain(|q| q.id != op.id);
        drop(state);
        bump(&self.counters.failed);
        error!(op = %op.id, key = %op.key, attempts, "Sync operation exhausted retries: {}", error);
        Some(FailedOperation {
            error: SyncError::ExhaustedRetries {
                id: op.id,
                attempts,
                last_error: error.to_string(),
            },
            operation: op,
        })
    }

    fn remove_queued(&self, id: OperationId) {
        self.state.lock().queue.retain(|op| op.id != id);
    }

    fn record_version(&self, key: &str, version: Option<&VersionRecord>) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            match version {
                Some(v) => {
                    state.versions.insert(key.to_string(), v.clone());
                }
                None => {
                    state.versions.remove(key);
                }
            }
        }
        self.store.save_version(key, version)
    }

    fn refresh_cache(&self, key: &str, payload: Option<&Value>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let result = match payload {
            Some(payload) => cache.set(key, payload.clone(), SetOptions::default()),
            None => cache.delete(key).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(key = %key, "Failed to refresh cache after sync: {}", e);
        }
    }

    fn apply_locally(&self, key: &str, payload: Option<&Value>) {
        let Some(updates) = &self.updates else {
            return;
        };
        let request = match payload {
            Some(payload) => UpdateRequest::update(key, payload.clone()),
            None => UpdateRequest::delete(key),
        };
        if let Err(e) = updates.enqueue(request.source("sync")) {
            warn!(key = %key, "Failed to apply resolution locally: {}", e);
        }
    }

    fn persist(&self) -> SyncResult<()> {
        let (queue, conflicts): (Vec<SyncOperation>, Vec<ConflictRecord>) = {
            let state = self.state.lock();
            (
                state.queue.iter().cloned().collect(),
                state.conflicts.values().cloned().collect(),
            )
        };
        self.store.save_queue(&queue)?;
        self.store.save_conflicts(&conflicts)
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Settles a pending conflict by hand. Returns the id of the queued
    /// operation carrying the result, if one was needed.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
    ) -> SyncResult<Option<OperationId>> {
        let record = self
            .state
            .lock()
            .conflicts
            .remove(&id)
            .ok_or(SyncError::ConflictNotFound(id))?;
        let requeued = self.settle(record, &resolution, ResolvedBy::Manual)?;
        self.persist()?;
        Ok(requeued)
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().conflicts.values().cloned().collect()
    }

    /// Recently settled conflicts with their outcome, oldest first. Not
    /// persisted.
    pub fn resolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().resolved.iter().cloned().collect()
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Queued operations in processing order.
    pub fn queued(&self) -> Vec<SyncOperation> {
        self.state.lock().queue.iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Last remote version seen for `key`.
    pub fn known_version(&self, key: &str) -> Option<VersionRecord> {
        self.state.lock().versions.get(key).cloned()
    }

    pub fn stats(&self) -> SyncStats {
        let (queued, pending_conflicts) = {
            let state = self.state.lock();
            (state.queue.len(), state.conflicts.len())
        };
        let c = &self.counters;
        SyncStats {
            queued,
            pending_conflicts,
            applied: c.applied.load(Ordering::Relaxed),
            conflicts_detected: c.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: c.conflicts_resolved.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Pulls the cache's sync queue and processes every interval.
    pub fn spawn_processing(self: &Arc<Self>) -> TaskHandle {
        let manager = Arc::clone(self);
        TaskHandle::periodic("sync-processing", self.config.process_interval(), move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(e) = manager.ingest_cache_queue(manager.config.batch_size) {
                    warn!("Failed to ingest cache sync queue: {}", e);
                }
                if let Err(e) = manager.process_queue().await {
                    warn!("Sync pass failed: {}", e);
                }
            }
        })
    }
}
