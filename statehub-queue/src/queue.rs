use crate::error::{QueueError, QueueResult};
use crate::executor::{ExecuteError, UpdateExecutor};
use crate::request::{DispatchReport, FailedUpdate, UpdateRequest};
use crate::state::{Limits, QueueState, Removed, Unit};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use statehub_types::{OperationId, OperationKind, RetryPolicy, TaskHandle};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Update queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dispatch units (batches or single requests) running at once.
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// A batch that waited longer than this before dispatch fails as expired.
    pub max_batch_age_ms: u64,
    pub max_queue_size: usize,
    pub enable_coalescing: bool,
    pub enable_batching: bool,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            batch_size: 10,
            batch_timeout_ms: 50,
            max_batch_age_ms: 5_000,
            max_queue_size: 10_000,
            enable_coalescing: true,
            enable_batching: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    fn limits(&self) -> Limits {
        Limits {
            max_concurrent: self.max_concurrent.max(1),
            batch_size: self.batch_size.max(1),
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            batching: self.enable_batching,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub expired: u64,
    pub retries: u64,
    pub cancelled: u64,
    /// Requests not yet started.
    pub waiting: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

struct QueueInner {
    config: QueueConfig,
    executor: Arc<dyn UpdateExecutor>,
    state: Mutex<QueueState>,
    /// Wakes the dispatch loop.
    wake: Notify,
    /// Signalled whenever a unit completes.
    completed: Notify,
    reports: broadcast::Sender<DispatchReport>,
    counters: Counters,
}

/// Priority queue that applies updates through an [`UpdateExecutor`].
///
/// Requests are admitted highest priority first, then in arrival order, and
/// only once every dependency has finished. Update and patch requests with
/// the same coalesce key merge while queued, and are grouped into batches
/// sealed by size or timeout. At most `max_concurrent` units run at once;
/// units may complete out of order.
///
/// Nothing is dispatched until [`UpdateQueue::spawn_dispatch_loop`] runs or
/// [`UpdateQueue::drain`] is awaited.
#[derive(Clone)]
pub struct UpdateQueue {
    inner: Arc<QueueInner>,
}

impl UpdateQueue {
    pub fn new(config: QueueConfig, executor: Arc<dyn UpdateExecutor>) -> Self {
        let (reports, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(QueueInner {
                config,
                executor,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                completed: Notify::new(),
                reports,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queues `request`. Returns the id that will carry it, which is the
    /// surviving request's id when it was coalesced.
    pub fn enqueue(&self, request: UpdateRequest) -> QueueResult<OperationId> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();

        let request = if config.enable_coalescing && request.kind.is_coalescable() {
            match state.coalesce(request) {
                Ok(id) => {
                    drop(state);
                    add(&self.inner.counters.coalesced, 1);
                    debug!(op = %id, "Coalesced into queued update");
                    self.inner.wake.notify_one();
                    return Ok(id);
                }
                Err(request) => request,
            }
        } else {
            request
        };

        if state.waiting() >= config.max_queue_size {
            return Err(QueueError::QueueFull {
                capacity: config.max_queue_size,
            });
        }
        let id = request.id;
        debug!(
            op = %id,
            kind = %request.kind,
            key = %request.key,
            priority = ?request.priority,
            "Enqueued update"
        );
        state.push(request);
        drop(state);

        add(&self.inner.counters.enqueued, 1);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Removes a request that has not started and runs its cancel callback.
    pub fn cancel(&self, id: OperationId) -> QueueResult<()> {
        let removed = self.inner.state.lock().remove(&id);
        match removed {
            Removed::Cancelled(request) => {
                self.cancelled(&request);
                self.inner.completed.notify_waiters();
                Ok(())
            }
            Removed::InFlight => Err(QueueError::InFlight(id)),
            Removed::NotFound => Err(QueueError::NotFound(id)),
        }
    }

    /// Cancels every not-yet-started request of `kind`. Returns how many.
    pub fn cancel_by_type(&self, kind: OperationKind) -> usize {
        let requests: Vec<UpdateRequest> = {
            let mut state = self.inner.state.lock();
            state
                .waiting_of_kind(kind)
                .into_iter()
                .filter_map(|id| match state.remove(&id) {
                    Removed::Cancelled(request) => Some(request),
                    _ => None,
                })
                .collect()
        };
        for request in &requests {
            self.cancelled(request);
        }
        if !requests.is_empty() {
            self.inner.completed.notify_waiters();
        }
        requests.len()
    }

    fn cancelled(&self, request: &UpdateRequest) {
        add(&self.inner.counters.cancelled, 1);
        debug!(op = %request.id, key = %request.key, "Cancelled update");
        if let Some(on_cancel) = &request.on_cancel {
            on_cancel(request);
        }
    }

    /// Stops admitting work. In-flight units run to completion.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("Update queue paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!("Update queue resumed");
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Requests not yet started.
    pub fn len(&self) -> usize {
        self.inner.state.lock().waiting()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight()
    }

    /// Receives a report for every completed dispatch unit.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DispatchReport> {
        self.inner.reports.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        let (waiting, in_flight) = {
            let state = self.inner.state.lock();
            (state.waiting(), state.in_flight())
        };
        let c = &self.inner.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            waiting,
            in_flight,
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Starts every unit that may run now. Returns how many were started.
    fn dispatch(&self, force: bool) -> usize {
        let units = self
            .inner
            .state
            .lock()
            .take_startable(self.inner.config.limits(), Instant::now(), force);
        let started = units.len();
        for unit in units {
            add(&self.inner.counters.dispatched, 1);
            let queue = self.clone();
            tokio::spawn(async move { queue.run_unit(unit).await });
        }
        started
    }

    /// Admits everything now, sealing the open batch early, and waits until
    /// nothing is queued or running. While paused, only waits for in-flight
    /// units.
    pub async fn drain(&self) {
        loop {
            let completed = self.inner.completed.notified();
            tokio::pin!(completed);
            completed.as_mut().enable();

            self.dispatch(true);
            if self.inner.state.lock().is_idle() {
                return;
            }
            completed.await;
        }
    }

    /// Runs dispatch reactively: on new work, on completions and when the
    /// open batch times out.
    pub fn spawn_dispatch_loop(&self) -> TaskHandle {
        let queue = self.clone();
        TaskHandle::spawn("update-queue", move |token| async move {
            loop {
                queue.dispatch(false);
                let deadline = queue
                    .inner
                    .state
                    .lock()
                    .batch_deadline(queue.inner.config.limits().batch_timeout);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = queue.inner.wake.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
        })
    }

    async fn run_unit(&self, unit: Unit) {
        let max_age = Duration::from_millis(self.inner.config.max_batch_age_ms);
        let age = unit.opened_at.elapsed();
        let expired = unit.batch_id.is_some() && age > max_age;
        let ids: Vec<OperationId> = unit.requests.iter().map(|r| r.id).collect();

        let mut report = DispatchReport {
            batch_id: unit.batch_id,
            ..DispatchReport::default()
        };
        if expired {
            warn!(
                batch = ?unit.batch_id,
                age_ms = age.as_millis() as u64,
                size = unit.requests.len(),
                "Batch expired before dispatch"
            );
            add(&self.inner.counters.expired, unit.requests.len());
        }

        for request in &unit.requests {
            let outcome = if expired {
                Err(QueueError::OperationExpired {
                    id: request.id,
                    age_ms: age.as_millis() as u64,
                })
            } else {
                self.execute_with_retry(request).await
            };
            match outcome {
                Ok(()) => report.succeeded.push(request.id),
                Err(error) => {
                    warn!(op = %request.id, key = %request.key, "Update failed: {}", error);
                    report.failed.push(FailedUpdate {
                        id: request.id,
                        key: request.key.clone(),
                        error,
                    });
                }
            }
        }

        self.inner.state.lock().finish(ids);
        add(&self.inner.counters.succeeded, report.succeeded.len());
        add(&self.inner.counters.failed, report.failed.len());
        debug!(
            batch = ?report.batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Dispatch unit finished"
        );
        // No receivers is fine.
        let _ = self.inner.reports.send(report);
        self.inner.wake.notify_one();
        self.inner.completed.notify_waiters();
    }

    async fn execute_with_retry(&self, request: &UpdateRequest) -> QueueResult<()> {
        let mut policy = self.inner.config.retry;
        if let Some(max) = request.max_retries {
            policy.max_retries = max;
        }
        let mut retries = 0;
        loop {
            match self.inner.executor.execute(request).await {
                Ok(()) => return Ok(()),
                Err(ExecuteError::Fatal(reason)) => {
                    return Err(QueueError::Rejected {
                        id: request.id,
                        reason,
                    });
                }
                Err(ExecuteError::Retryable(reason)) => {
                    if !policy.allows(retries) {
                        return Err(QueueError::ExhaustedRetries {
                            id: request.id,
                            attempts: retries + 1,
                            last_error: reason,
                        });
                    }
                    let delay = policy.delay(retries);
                    retries += 1;
                    add(&self.inner.counters.retries, 1);
                    debug!(op = %request.id, retry = retries, delay_ms = delay.as_millis() as u64, "Retrying update: {}", reason);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
