use pretty_assertions::assert_eq;
use serde_json::json;
use statehub_sync::{
    auto_resolution, ConflictRecord, ConflictStrategy, MemoryQueueStore, MemorySyncBackend,
    QueueOptions, QueueStore, Resolution, SqliteQueueStore, SyncConfig, SyncManager,
    SyncOperation,
};
use statehub_types::{ConflictId, ManualClock, OperationId, OperationKind, VersionRecord};
use std::collections::BTreeSet;
use std::sync::Arc;

fn op(key: &str) -> SyncOperation {
    let payload = json!({"key": key});
    SyncOperation {
        id: OperationId::new(),
        kind: OperationKind::Update,
        key: key.to_string(),
        version: VersionRecord::for_payload(1, 10, "local", &payload),
        payload: Some(payload),
        previous: None,
        base_version: 0,
        retries: 0,
        max_retries: 3,
        dependencies: Vec::new(),
        tags: BTreeSet::new(),
        next_attempt_at: 0,
        last_error: None,
    }
}

fn conflict(local_ts: u64, remote_ts: u64) -> ConflictRecord {
    let operation = op("doc");
    ConflictRecord {
        id: ConflictId::new(),
        key: "doc".to_string(),
        local: Some(json!({"a": 1, "b": 1})),
        local_version: VersionRecord::for_payload(1, local_ts, "local", &json!(null)),
        remote: Some(json!({"b": 2, "c": 2})),
        remote_version: VersionRecord::for_payload(1, remote_ts, "remote", &json!(null)),
        strategy: ConflictStrategy::LastWriteWins,
        detected_at: 0,
        outcome: None,
        resolved_by: None,
        operation,
    }
}

// ── Resolution rules ─────────────────────────────────────────────

#[test]
fn last_write_wins_tie_goes_to_remote() {
    let record = conflict(20, 20);
    assert_eq!(
        auto_resolution(ConflictStrategy::LastWriteWins, &record),
        Some(Resolution::UseRemote)
    );
    assert_eq!(
        auto_resolution(ConflictStrategy::LastWriteWins, &conflict(21, 20)),
        Some(Resolution::UseLocal)
    );
    assert_eq!(auto_resolution(ConflictStrategy::Manual, &record), None);
    assert_eq!(auto_resolution(ConflictStrategy::Custom, &record), None);
}

#[test]
fn merge_prefers_local_fields() {
    let record = conflict(0, 0);
    assert_eq!(
        record.resolved_value(&Resolution::Merge),
        Some(json!({"a": 1, "b": 1, "c": 2}))
    );
}

#[test]
fn merge_with_missing_side_takes_the_other() {
    let mut record = conflict(0, 0);
    record.remote = None;
    assert_eq!(record.resolved_value(&Resolution::Merge), record.local);

    let mut record = conflict(0, 0);
    record.local = None;
    assert_eq!(record.resolved_value(&Resolution::Merge), record.remote);
    assert_eq!(record.resolved_value(&Resolution::UseLocal), None);
}

#[test]
fn strategy_names_are_snake_case() {
    let strategy: ConflictStrategy = serde_json::from_str(r#""last_write_wins""#).unwrap();
    assert_eq!(strategy, ConflictStrategy::LastWriteWins);
    assert_eq!(
        serde_json::to_string(&ConflictStrategy::ServerWins).unwrap(),
        r#""server_wins""#
    );
}

// ── Stores ───────────────────────────────────────────────────────

fn exercise_store(store: &dyn QueueStore) {
    let first = vec![op("a"), op("b")];
    store.save_queue(&first).unwrap();
    assert_eq!(store.load_queue().unwrap(), first);

    let second = vec![op("c")];
    store.save_queue(&second).unwrap();
    assert_eq!(store.load_queue().unwrap(), second);

    let record = conflict(1, 2);
    store.save_conflicts(std::slice::from_ref(&record)).unwrap();
    assert_eq!(store.load_conflicts().unwrap(), vec![record]);
    store.save_conflicts(&[]).unwrap();
    assert!(store.load_conflicts().unwrap().is_empty());

    let v1 = VersionRecord::for_payload(1, 5, "remote", &json!(1));
    let v2 = v1.next(6, "remote", &json!(2));
    store.save_version("k", Some(&v1)).unwrap();
    store.save_version("k", Some(&v2)).unwrap();
    assert_eq!(store.load_versions().unwrap().get("k"), Some(&v2));
    store.save_version("k", None).unwrap();
    assert!(store.load_versions().unwrap().is_empty());
}

#[test]
fn memory_store_replaces_saved_sets() {
    exercise_store(&MemoryQueueStore::new());
}

#[test]
fn sqlite_store_replaces_saved_sets() {
    exercise_store(&SqliteQueueStore::open_in_memory().unwrap());
}

#[tokio::test]
async fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let backend = Arc::new(MemorySyncBackend::new());
    let clock = Arc::new(ManualClock::new(10));
    let config = SyncConfig {
        default_strategy: ConflictStrategy::Manual,
        ..SyncConfig::default()
    };

    let (first, second) = {
        let store = Arc::new(SqliteQueueStore::open(&path).unwrap());
        let manager = SyncManager::open(config.clone(), backend.clone(), store)
            .unwrap()
            .with_clock(clock.clone());

        manager
            .queue_operation(
                OperationKind::Create,
                "applied",
                Some(json!(1)),
                QueueOptions::default(),
            )
            .unwrap();
        manager.process_queue().await.unwrap();

        backend.put(
            "contested",
            json!("B"),
            VersionRecord::for_payload(1, 20, "remote", &json!("B")),
        );
        manager
            .queue_operation(
                OperationKind::Update,
                "contested",
                Some(json!("A")),
                QueueOptions::default(),
            )
            .unwrap();
        manager.process_queue().await.unwrap();

        let first = manager
            .queue_operation(OperationKind::Update, "x", Some(json!(1)), QueueOptions::default())
            .unwrap();
        let second = manager
            .queue_operation(
                OperationKind::Update,
                "y",
                Some(json!(2)),
                QueueOptions::default().depends_on(first),
            )
            .unwrap();
        (first, second)
    };

    let store = Arc::new(SqliteQueueStore::open(&path).unwrap());
    let manager = SyncManager::open(config, backend, store).unwrap();

    let order: Vec<_> = manager.queued().iter().map(|op| op.id).collect();
    assert_eq!(order, vec![first, second]);
    assert_eq!(manager.known_version("applied").unwrap().version, 1);

    let pending = manager.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "contested");
    assert_eq!(pending[0].local, Some(json!("A")));
}
