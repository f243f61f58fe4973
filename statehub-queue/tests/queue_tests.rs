use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use statehub_queue::{
    ExecuteError, QueueConfig, QueueError, UpdateExecutor, UpdateQueue, UpdateRequest,
};
use statehub_types::{OperationKind, Priority, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Records applied requests; can delay or fail chosen keys.
#[derive(Default)]
struct Recorder {
    applied: Mutex<Vec<(String, Value)>>,
    failures: Mutex<HashMap<String, (u32, ExecuteError)>>,
    delays: Mutex<HashMap<String, Duration>>,
    attempts: AtomicUsize,
}

impl Recorder {
    fn fail(&self, key: &str, times: u32, error: ExecuteError) {
        self.failures.lock().insert(key.to_string(), (times, error));
    }

    fn delay(&self, key: &str, by: Duration) {
        self.delays.lock().insert(key.to_string(), by);
    }

    fn keys(&self) -> Vec<String> {
        self.applied.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[async_trait]
impl UpdateExecutor for Recorder {
    async fn execute(&self, request: &UpdateRequest) -> Result<(), ExecuteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().get(&request.key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock();
            if let Some((remaining, error)) = failures.get_mut(&request.key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }
        self.applied
            .lock()
            .push((request.key.clone(), request.payload.clone()));
        Ok(())
    }
}

fn queue_with(config: QueueConfig) -> (UpdateQueue, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let queue = UpdateQueue::new(config, recorder.clone());
    (queue, recorder)
}

fn serial() -> QueueConfig {
    QueueConfig {
        max_concurrent: 1,
        enable_batching: false,
        ..QueueConfig::default()
    }
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn higher_priority_is_admitted_first() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    for (key, priority) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("normal", Priority::Normal),
    ] {
        queue
            .enqueue(UpdateRequest::create(key, "widget", json!({})).priority(priority))
            .unwrap();
    }
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["high", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn equal_priority_keeps_arrival_order() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    for key in ["a", "b", "c", "d"] {
        queue.enqueue(UpdateRequest::update(key, json!(1))).unwrap();
    }
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["a", "b", "c", "d"]);
}

#[tokio::test(start_paused = true)]
async fn immediate_outranks_critical() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    queue
        .enqueue(UpdateRequest::delete("crit").priority(Priority::Critical))
        .unwrap();
    queue
        .enqueue(UpdateRequest::delete("now").priority(Priority::Immediate))
        .unwrap();
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["now", "crit"]);
}

#[tokio::test(start_paused = true)]
async fn dependency_holds_back_higher_priority() {
    let config = QueueConfig {
        max_concurrent: 4,
        enable_batching: false,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    recorder.delay("parent", Duration::from_millis(100));
    queue.pause();
    let parent = queue
        .enqueue(UpdateRequest::create("parent", "widget", json!({})).priority(Priority::Low))
        .unwrap();
    queue
        .enqueue(
            UpdateRequest::create("child", "widget", json!({}))
                .priority(Priority::Immediate)
                .depends_on(parent),
        )
        .unwrap();
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["parent", "child"]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_limits_in_flight_units() {
    let config = QueueConfig {
        max_concurrent: 2,
        enable_batching: false,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    for key in ["a", "b", "c"] {
        recorder.delay(key, Duration::from_millis(100));
        queue
            .enqueue(UpdateRequest::create(key, "widget", json!({})))
            .unwrap();
    }
    let handle = queue.spawn_dispatch_loop();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.in_flight(), 2);
    assert_eq!(queue.len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(recorder.keys().len(), 3);
    handle.shutdown().await;
}

// ── Coalescing ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn queued_updates_to_one_key_merge() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    let first = queue
        .enqueue(UpdateRequest::update("cart", json!({"items": 1, "open": true})))
        .unwrap();
    let second = queue
        .enqueue(UpdateRequest::update("cart", json!({"items": 2})).priority(Priority::High))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.len(), 1);

    queue.resume();
    queue.drain().await;

    assert_eq!(
        *recorder.applied.lock(),
        vec![("cart".to_string(), json!({"items": 2, "open": true}))]
    );
    let stats = queue.stats();
    assert_eq!((stats.enqueued, stats.coalesced, stats.succeeded), (1, 1, 1));
}

#[tokio::test(start_paused = true)]
async fn coalescing_raises_priority() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    queue.enqueue(UpdateRequest::update("a", json!({}))).unwrap();
    queue
        .enqueue(UpdateRequest::update("b", json!({})).priority(Priority::Low))
        .unwrap();
    queue
        .enqueue(UpdateRequest::update("b", json!({"x": 1})).priority(Priority::Critical))
        .unwrap();
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["b", "a"]);
}

#[tokio::test(start_paused = true)]
async fn different_kinds_do_not_merge() {
    let (queue, _) = queue_with(serial());
    queue.pause();
    queue.enqueue(UpdateRequest::update("k", json!({"a": 1}))).unwrap();
    queue.enqueue(UpdateRequest::patch("k", json!({"b": 1}))).unwrap();
    queue.enqueue(UpdateRequest::delete("k")).unwrap();
    queue.enqueue(UpdateRequest::delete("k")).unwrap();
    assert_eq!(queue.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn coalescing_can_be_disabled() {
    let config = QueueConfig {
        enable_coalescing: false,
        ..serial()
    };
    let (queue, recorder) = queue_with(config);
    queue.pause();
    queue.enqueue(UpdateRequest::update("k", json!(1))).unwrap();
    queue.enqueue(UpdateRequest::update("k", json!(2))).unwrap();
    queue.resume();
    queue.drain().await;

    assert_eq!(
        *recorder.applied.lock(),
        vec![("k".to_string(), json!(1)), ("k".to_string(), json!(2))]
    );
}

// ── Batching ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_batch_dispatches_as_one_unit() {
    let config = QueueConfig {
        batch_size: 3,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    let mut reports = queue.subscribe_reports();
    let handle = queue.spawn_dispatch_loop();
    for key in ["a", "b", "c"] {
        queue.enqueue(UpdateRequest::update(key, json!(1))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    let report = reports.recv().await.unwrap();
    assert!(report.batch_id.is_some());
    assert_eq!(report.succeeded.len(), 3);
    assert!(report.is_success());
    assert_eq!(recorder.keys(), vec!["a", "b", "c"]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn partial_batch_waits_for_timeout() {
    let config = QueueConfig {
        batch_size: 10,
        batch_timeout_ms: 50,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    let handle = queue.spawn_dispatch_loop();
    queue.enqueue(UpdateRequest::update("a", json!(1))).unwrap();
    queue.enqueue(UpdateRequest::patch("b", json!(1))).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(recorder.keys().is_empty());
    assert_eq!(queue.len(), 2);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(recorder.keys(), vec!["a", "b"]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drain_flushes_open_batch() {
    let config = QueueConfig {
        batch_size: 10,
        batch_timeout_ms: 60_000,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    let mut reports = queue.subscribe_reports();
    queue.enqueue(UpdateRequest::update("a", json!(1))).unwrap();
    queue.enqueue(UpdateRequest::update("b", json!(1))).unwrap();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["a", "b"]);
    let report = reports.try_recv().unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_batch_fails_as_expired() {
    let config = QueueConfig {
        max_concurrent: 1,
        batch_size: 10,
        batch_timeout_ms: 10,
        max_batch_age_ms: 100,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    recorder.delay("slow", Duration::from_millis(500));
    let mut reports = queue.subscribe_reports();
    let handle = queue.spawn_dispatch_loop();

    let batched = queue.enqueue(UpdateRequest::update("a", json!(1))).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    queue
        .enqueue(UpdateRequest::create("slow", "widget", json!({})).priority(Priority::Immediate))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let first = reports.recv().await.unwrap();
    assert_eq!(first.batch_id, None);
    let second = reports.recv().await.unwrap();
    assert!(second.batch_id.is_some());
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].id, batched);
    assert!(matches!(
        second.failed[0].error,
        QueueError::OperationExpired { .. }
    ));
    assert_eq!(recorder.keys(), vec!["slow"]);
    assert_eq!(queue.stats().expired, 1);
    handle.shutdown().await;
}

// ── Retry ────────────────────────────────────────────────────────

fn retrying(max_retries: u32) -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        },
        ..serial()
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let (queue, recorder) = queue_with(retrying(3));
    recorder.fail("flaky", 2, ExecuteError::Retryable("timeout".into()));
    let mut reports = queue.subscribe_reports();
    queue.enqueue(UpdateRequest::delete("flaky")).unwrap();

    let started = tokio::time::Instant::now();
    queue.drain().await;

    // Backoff of 100ms then 200ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(reports.try_recv().unwrap().is_success());
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported_without_halting_the_rest() {
    let (queue, recorder) = queue_with(retrying(2));
    recorder.fail("broken", u32::MAX, ExecuteError::Retryable("down".into()));
    let mut reports = queue.subscribe_reports();
    let broken = queue.enqueue(UpdateRequest::delete("broken")).unwrap();
    queue.enqueue(UpdateRequest::delete("fine")).unwrap();
    queue.drain().await;

    let failed = reports.try_recv().unwrap();
    assert_eq!(
        failed.failed[0].error,
        QueueError::ExhaustedRetries {
            id: broken,
            attempts: 3,
            last_error: "down".into(),
        }
    );
    assert!(reports.try_recv().unwrap().is_success());
    assert_eq!(recorder.keys(), vec!["fine"]);
    let stats = queue.stats();
    assert_eq!((stats.succeeded, stats.failed), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn per_request_retry_budget_overrides_config() {
    let (queue, recorder) = queue_with(retrying(5));
    recorder.fail("k", u32::MAX, ExecuteError::Retryable("no".into()));
    queue
        .enqueue(UpdateRequest::delete("k").max_retries(0))
        .unwrap();
    queue.drain().await;
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_are_not_retried() {
    let (queue, recorder) = queue_with(retrying(3));
    recorder.fail("bad", 1, ExecuteError::Fatal("schema".into()));
    let mut reports = queue.subscribe_reports();
    let id = queue.enqueue(UpdateRequest::delete("bad")).unwrap();
    queue.drain().await;

    let report = reports.try_recv().unwrap();
    assert_eq!(
        report.failed[0].error,
        QueueError::Rejected {
            id,
            reason: "schema".into()
        }
    );
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);
}

// ── Cancellation and control ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancelled_request_never_runs() {
    let (queue, recorder) = queue_with(serial());
    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cancelled);
    queue.pause();
    let a = queue
        .enqueue(
            UpdateRequest::create("a", "widget", json!({}))
                .on_cancel(move |r| sink.lock().push(r.key.clone())),
        )
        .unwrap();
    queue
        .enqueue(UpdateRequest::create("b", "widget", json!({})))
        .unwrap();

    queue.cancel(a).unwrap();
    assert_eq!(queue.cancel(a), Err(QueueError::NotFound(a)));
    queue.resume();
    queue.drain().await;

    assert_eq!(recorder.keys(), vec!["b"]);
    assert_eq!(*cancelled.lock(), vec!["a".to_string()]);
    assert_eq!(queue.stats().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn batched_request_can_be_cancelled() {
    let config = QueueConfig {
        batch_size: 10,
        batch_timeout_ms: 100,
        ..QueueConfig::default()
    };
    let (queue, recorder) = queue_with(config);
    let handle = queue.spawn_dispatch_loop();
    let a = queue.enqueue(UpdateRequest::update("a", json!(1))).unwrap();
    queue.enqueue(UpdateRequest::update("b", json!(1))).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.cancel(a).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.keys(), vec!["b"]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn in_flight_request_cannot_be_cancelled() {
    let (queue, recorder) = queue_with(serial());
    recorder.delay("slow", Duration::from_millis(100));
    let handle = queue.spawn_dispatch_loop();
    let id = queue
        .enqueue(UpdateRequest::create("slow", "widget", json!({})))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(queue.cancel(id), Err(QueueError::InFlight(id)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.keys(), vec!["slow"]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_by_type_removes_matching_kinds() {
    let (queue, recorder) = queue_with(serial());
    queue.pause();
    queue
        .enqueue(UpdateRequest::create("x", "widget", json!({})))
        .unwrap();
    queue.enqueue(UpdateRequest::delete("y")).unwrap();
    queue.enqueue(UpdateRequest::delete("z")).unwrap();

    assert_eq!(queue.cancel_by_type(OperationKind::Delete), 2);
    assert_eq!(queue.cancel_by_type(OperationKind::Delete), 0);
    queue.resume();
    queue.drain().await;
    assert_eq!(recorder.keys(), vec!["x"]);
}

#[tokio::test(start_paused = true)]
async fn paused_queue_admits_nothing() {
    let (queue, recorder) = queue_with(serial());
    let handle = queue.spawn_dispatch_loop();
    queue.pause();
    assert!(queue.is_paused());
    queue.enqueue(UpdateRequest::delete("a")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.keys().is_empty());

    queue.resume();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.keys(), vec!["a"]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_new_requests_but_still_coalesces() {
    let config = QueueConfig {
        max_queue_size: 2,
        ..serial()
    };
    let (queue, _) = queue_with(config);
    queue.pause();
    let a = queue.enqueue(UpdateRequest::update("a", json!({"n": 1}))).unwrap();
    queue.enqueue(UpdateRequest::delete("b")).unwrap();
    assert_eq!(
        queue.enqueue(UpdateRequest::delete("c")),
        Err(QueueError::QueueFull { capacity: 2 })
    );
    assert_eq!(
        queue.enqueue(UpdateRequest::update("a", json!({"n": 2}))),
        Ok(a)
    );
}
