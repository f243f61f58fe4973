use pretty_assertions::assert_eq;
use serde_json::json;
use statehub_cache::{
    smart_score, CacheConfig, CacheEntry, CacheError, CacheManager, EntryMetadata, EvictionPolicy,
    MemoryBackend, PersistenceBackend, SessionStamp, SetOptions, SqliteBackend,
};
use statehub_types::{ManualClock, OperationKind, Priority};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn cache_with(config: CacheConfig, clock: &Arc<ManualClock>) -> CacheManager {
    CacheManager::new(config).with_clock(clock.clone())
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(1_000_000))
}

fn bounded(policy: EvictionPolicy, max_entries: usize) -> CacheConfig {
    CacheConfig {
        policy,
        max_entries,
        default_ttl_ms: None,
        ..CacheConfig::default()
    }
}

fn stamp(writer: &str) -> SessionStamp {
    SessionStamp {
        session_id: format!("{writer}-session"),
        writer_id: writer.to_string(),
    }
}

// ── Reads, writes and TTL ────────────────────────────────────────

#[test]
fn set_then_get_returns_payload() {
    let clock = clock();
    let cache = cache_with(CacheConfig::default(), &clock);
    cache.set("user", json!({"name": "ada"}), SetOptions::default()).unwrap();

    assert_eq!(cache.get("user"), Some(json!({"name": "ada"})));
    assert_eq!(cache.get("missing"), None);

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_size, r#"{"name":"ada"}"#.len());
}

#[test]
fn entry_expires_at_ttl() {
    let clock = clock();
    let cache = cache_with(CacheConfig::default(), &clock);
    cache
        .set("token", json!("abc"), SetOptions::default().ttl(Duration::from_secs(1)))
        .unwrap();

    clock.advance(Duration::from_millis(999));
    assert_eq!(cache.get("token"), Some(json!("abc")));

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get("token"), None);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().expirations, 1);
}

#[test]
fn default_ttl_applies_when_none_given() {
    let clock = clock();
    let config = CacheConfig {
        default_ttl_ms: Some(500),
        ..CacheConfig::default()
    };
    let cache = cache_with(config, &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    assert_eq!(cache.metadata("a").unwrap().expires_at, Some(1_000_500));

    clock.advance(Duration::from_millis(500));
    assert!(!cache.contains("a"));
}

#[test]
fn no_default_ttl_means_no_expiry() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Smart, 10), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert_eq!(cache.get("a"), Some(json!(1)));
}

#[test]
fn version_bumps_on_each_set() {
    let clock = clock();
    let cache = cache_with(CacheConfig::default(), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    cache.set("a", json!(2), SetOptions::default()).unwrap();
    cache.set("a", json!(3), SetOptions::default()).unwrap();

    let meta = cache.metadata("a").unwrap();
    assert_eq!(meta.version, 3);
    assert_eq!(cache.total_size(), 1);
}

#[test]
fn get_tracks_access() {
    let clock = clock();
    let cache = cache_with(CacheConfig::default(), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    clock.advance(Duration::from_secs(5));
    cache.get("a");
    cache.get("a");

    let meta = cache.metadata("a").unwrap();
    assert_eq!(meta.access_count, 2);
    assert_eq!(meta.last_accessed, 1_005_000);
    assert_eq!(meta.created_at, 1_000_000);
}

#[test]
fn delete_and_clear() {
    let clock = clock();
    let cache = cache_with(CacheConfig::default(), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    cache.set("b", json!(2), SetOptions::default()).unwrap();

    assert!(cache.delete("a").unwrap());
    assert!(!cache.delete("a").unwrap());
    assert_eq!(cache.keys(), vec!["b".to_string()]);

    cache.clear().unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.total_size(), 0);
}

#[test]
fn cleanup_purges_only_expired() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Smart, 10), &clock);
    let short = SetOptions::default().ttl(Duration::from_secs(1));
    cache.set("a", json!(1), short.clone()).unwrap();
    cache.set("b", json!(2), short).unwrap();
    cache.set("c", json!(3), SetOptions::default()).unwrap();

    assert_eq!(cache.cleanup_expired(), 0);
    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.cleanup_expired(), 2);
    assert_eq!(cache.keys(), vec!["c".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn background_cleanup_runs_on_interval() {
    let clock = clock();
    let config = CacheConfig {
        cleanup_interval_ms: 1_000,
        ..CacheConfig::default()
    };
    let cache = Arc::new(cache_with(config, &clock));
    cache
        .set("a", json!(1), SetOptions::default().ttl(Duration::from_millis(10)))
        .unwrap();
    let handle = cache.spawn_cleanup();

    clock.advance(Duration::from_millis(20));
    assert_eq!(cache.len(), 1);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(cache.len(), 0);

    handle.shutdown().await;
}

// ── Eviction ─────────────────────────────────────────────────────

#[test]
fn oversized_entry_is_rejected() {
    let clock = clock();
    let config = CacheConfig {
        max_size_bytes: 5,
        ..CacheConfig::default()
    };
    let cache = cache_with(config, &clock);
    let err = cache
        .set("big", json!("123456789"), SetOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::CapacityExceeded { needed: 11, limit: 5 }
    ));
    assert!(cache.is_empty());
}

#[test]
fn size_limit_holds_after_eviction() {
    let clock = clock();
    let config = CacheConfig {
        max_size_bytes: 20,
        ..bounded(EvictionPolicy::Lru, 100)
    };
    let cache = cache_with(config, &clock);
    // Each payload serializes to 10 bytes.
    cache.set("a", json!("12345678"), SetOptions::default()).unwrap();
    cache.set("b", json!("12345678"), SetOptions::default()).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.get("a");
    clock.advance(Duration::from_millis(1));
    cache.set("c", json!("12345678"), SetOptions::default()).unwrap();

    assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
    assert!(cache.total_size() <= 20);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn replacing_a_key_counts_its_freed_size() {
    let clock = clock();
    let config = CacheConfig {
        max_size_bytes: 20,
        ..bounded(EvictionPolicy::Lru, 100)
    };
    let cache = cache_with(config, &clock);
    cache.set("a", json!("12345678"), SetOptions::default()).unwrap();
    cache.set("b", json!("12345678"), SetOptions::default()).unwrap();
    cache.set("b", json!("87654321"), SetOptions::default()).unwrap();

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evictions, 0);
}

#[test]
fn expired_entries_go_before_live_ones() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Lfu, 2), &clock);
    cache
        .set("stale", json!(1), SetOptions::default().ttl(Duration::from_secs(1)))
        .unwrap();
    cache.set("cold", json!(2), SetOptions::default()).unwrap();
    clock.advance(Duration::from_secs(2));
    cache.set("new", json!(3), SetOptions::default()).unwrap();

    assert_eq!(cache.keys(), vec!["cold".to_string(), "new".to_string()]);
    let stats = cache.stats();
    assert_eq!((stats.expirations, stats.evictions), (1, 0));
}

#[test]
fn lfu_evicts_least_used() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Lfu, 2), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();
    cache.set("b", json!(2), SetOptions::default()).unwrap();
    cache.get("a");
    cache.get("a");
    cache.get("b");
    cache.set("c", json!(3), SetOptions::default()).unwrap();

    assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
}

#[test]
fn ttl_policy_evicts_soonest_expiry() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Ttl, 2), &clock);
    cache
        .set("late", json!(1), SetOptions::default().ttl(Duration::from_secs(10)))
        .unwrap();
    cache
        .set("soon", json!(2), SetOptions::default().ttl(Duration::from_secs(5)))
        .unwrap();
    cache.set("forever", json!(3), SetOptions::default()).unwrap();

    assert_eq!(cache.keys(), vec!["forever".to_string(), "late".to_string()]);
}

#[test]
fn smart_policy_keeps_high_priority() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Smart, 2), &clock);
    cache
        .set("vip", json!(1), SetOptions::default().priority(Priority::High))
        .unwrap();
    cache
        .set("bulk", json!(2), SetOptions::default().priority(Priority::Low))
        .unwrap();
    cache.set("next", json!(3), SetOptions::default()).unwrap();

    assert_eq!(cache.keys(), vec!["next".to_string(), "vip".to_string()]);
}

#[test]
fn manual_policy_rejects_when_full() {
    let clock = clock();
    let cache = cache_with(bounded(EvictionPolicy::Manual, 1), &clock);
    cache.set("a", json!(1), SetOptions::default()).unwrap();

    let err = cache.set("b", json!(2), SetOptions::default()).unwrap_err();
    assert!(matches!(err, CacheError::CapacityExceeded { .. }));
    assert_eq!(cache.get("a"), Some(json!(1)));

    // Replacing the resident key needs no extra room.
    cache.set("a", json!(10), SetOptions::default()).unwrap();
    assert_eq!(cache.get("a"), Some(json!(10)));
}

#[test]
fn smart_score_rewards_priority_and_use() {
    let entry = |priority, access_count| CacheEntry {
        key: "k".into(),
        data: json!(null),
        metadata: EntryMetadata {
            created_at: 0,
            last_accessed: 0,
            access_count,
            expires_at: None,
            size: 4,
            version: 1,
            tags: BTreeSet::new(),
            priority,
            source: None,
        },
    };
    let now = 60_000;
    assert!(smart_score(&entry(Priority::High, 0), now) > smart_score(&entry(Priority::Low, 0), now));
    assert!(smart_score(&entry(Priority::Normal, 9), now) > smart_score(&entry(Priority::Normal, 0), now));
    assert!(smart_score(&entry(Priority::Normal, 0), 0) > smart_score(&entry(Priority::Normal, 0), now));
}

// ── Tags ─────────────────────────────────────────────────────────

#[test]
fn invalidate_by_tags_removes_tagged_entries() {
    let clock = clock();
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(CacheConfig::default(), &clock).with_backend(backend.clone());
    cache
        .set("a", json!(1), SetOptions::default().tag("user"))
        .unwrap();
    cache
        .set("b", json!(2), SetOptions::default().tag("user").tag("profile").persist())
        .unwrap();
    cache
        .set("c", json!(3), SetOptions::default().tag("profile"))
        .unwrap();
    cache.set("d", json!(4), SetOptions::default()).unwrap();

    assert_eq!(cache.invalidate_by_tags(&["user"]).unwrap(), 2);
    assert_eq!(cache.keys(), vec!["c".to_string(), "d".to_string()]);
    assert!(backend.is_empty());

    assert_eq!(cache.invalidate_by_tags(&["missing"]).unwrap(), 0);
}

// ── Persistence ──────────────────────────────────────────────────

#[test]
fn persistence_follows_allow_and_deny_lists() {
    let clock = clock();
    let backend = Arc::new(MemoryBackend::new());
    let config = CacheConfig {
        persistent_keys: vec!["user.*".into()],
        volatile_keys: vec!["user.secret".into()],
        ..CacheConfig::default()
    };
    let cache = cache_with(config, &clock).with_backend(backend.clone());

    cache.set("user.name", json!("ada"), SetOptions::default()).unwrap();
    cache
        .set("user.secret", json!("hunter2"), SetOptions::default().persist())
        .unwrap();
    cache.set("theme", json!("dark"), SetOptions::default().persist()).unwrap();
    cache.set("scratch", json!(0), SetOptions::default()).unwrap();

    assert_eq!(
        backend.keys().unwrap(),
        vec!["theme".to_string(), "user.name".to_string()]
    );
    assert_eq!(cache.stats().persisted, 2);
}

#[test]
fn nothing_persists_without_backend() {
    let cache = CacheManager::default();
    assert!(!cache.should_persist("theme", true));
}

#[test]
fn memory_miss_falls_back_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = clock();
    let config = bounded(EvictionPolicy::Smart, 100);

    {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        let cache = cache_with(config.clone(), &clock).with_backend(backend);
        cache
            .set("prefs", json!({"theme": "dark"}), SetOptions::default().persist().tag("ui"))
            .unwrap();
    }

    let backend = Arc::new(SqliteBackend::open(&path).unwrap());
    let cache = cache_with(config, &clock).with_backend(backend);
    assert!(cache.is_empty());
    assert_eq!(cache.get("prefs"), Some(json!({"theme": "dark"})));
    assert_eq!(cache.get("prefs"), Some(json!({"theme": "dark"})));

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.backend_hits), (2, 1));
    let meta = cache.metadata("prefs").unwrap();
    assert!(meta.tags.contains("ui"));
    assert_eq!(meta.access_count, 2);
}

#[test]
fn expired_persisted_entry_is_dropped() {
    let clock = clock();
    let backend = Arc::new(MemoryBackend::new());
    let writer = cache_with(CacheConfig::default(), &clock).with_backend(backend.clone());
    writer
        .set("otp", json!("1234"), SetOptions::default().persist().ttl(Duration::from_secs(1)))
        .unwrap();

    clock.advance(Duration::from_secs(5));
    let reader = cache_with(CacheConfig::default(), &clock).with_backend(backend.clone());
    assert_eq!(reader.get("otp"), None);
    assert!(backend.is_empty());
}

#[test]
fn foreign_writer_is_detected() {
    let clock = clock();
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let config_for = |writer: &str| CacheConfig {
        session: Some(stamp(writer)),
        ..CacheConfig::default()
    };

    let ours = cache_with(config_for("desktop"), &clock).with_backend(backend.clone());
    ours.set("doc", json!(1), SetOptions::default().persist()).unwrap();

    let theirs = cache_with(config_for("laptop"), &clock).with_backend(backend.clone());
    assert_eq!(theirs.get("doc"), Some(json!(1)));
    assert_eq!(theirs.stats().foreign_writes, 1);

    let persisted = backend.load("doc").unwrap().unwrap();
    assert_eq!(persisted.session, Some(stamp("desktop")));

    let same = cache_with(config_for("desktop"), &clock).with_backend(backend);
    same.get("doc");
    assert_eq!(same.stats().foreign_writes, 0);
}

#[test]
fn delete_reaches_backend() {
    let clock = clock();
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(CacheConfig::default(), &clock).with_backend(backend.clone());
    cache.set("a", json!(1), SetOptions::default().persist()).unwrap();
    assert_eq!(backend.len(), 1);

    assert!(cache.delete("a").unwrap());
    assert!(backend.is_empty());
    assert_eq!(cache.get("a"), None);
}

#[test]
fn unpersisted_overwrite_is_not_shadowed_after_eviction() {
    let clock = clock();
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(bounded(EvictionPolicy::Lru, 1), &clock).with_backend(backend.clone());

    cache.set("doc", json!("v1"), SetOptions::default().persist()).unwrap();
    cache.set("doc", json!("v2"), SetOptions::default()).unwrap();
    assert!(backend.is_empty());

    clock.advance(Duration::from_millis(1));
    cache.set("other", json!(0), SetOptions::default()).unwrap();
    assert!(!cache.contains("doc"));
    assert_eq!(cache.get("doc"), None);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: CacheConfig = serde_json::from_value(json!({
        "max_entries": 5,
        "policy": "lru",
        "persistent_keys": ["session.*"]
    }))
    .unwrap();
    assert_eq!(config.max_entries, 5);
    assert_eq!(config.policy, EvictionPolicy::Lru);
    assert_eq!(config.default_ttl_ms, Some(3_600_000));
    assert_eq!(config.max_sync_queue, 1_000);
}

// ── Sync queue ───────────────────────────────────────────────────

#[test]
fn sync_queue_is_bounded_and_fifo() {
    let clock = clock();
    let config = CacheConfig {
        max_sync_queue: 2,
        ..CacheConfig::default()
    };
    let cache = cache_with(config, &clock);
    cache
        .queue_sync(OperationKind::Update, "a", Some(json!(1)))
        .unwrap();
    cache.queue_sync(OperationKind::Delete, "b", None).unwrap();
    let err = cache.queue_sync(OperationKind::Create, "c", None).unwrap_err();
    assert!(matches!(err, CacheError::SyncQueueFull { capacity: 2 }));

    let drained = cache.drain_sync_queue(1);
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].key, "a");
    assert_eq!(drained[0].kind, OperationKind::Update);
    assert_eq!(drained[0].queued_at, 1_000_000);
    assert_eq!(cache.sync_queue_len(), 1);
    assert_eq!(cache.stats().sync_queued, 1);

    assert_eq!(cache.drain_sync_queue(10).len(), 1);
    assert!(cache.drain_sync_queue(10).is_empty());
}
