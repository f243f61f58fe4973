use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use statehub_types::{
    checksum, overlay, Clock, ComponentId, Event, ManualClock, OperationId, OperationKind,
    Priority, RetryPolicy, TaskHandle, VersionRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Ids ──────────────────────────────────────────────────────────

#[test]
fn component_id_roundtrips_through_serde_as_plain_string() {
    let id = ComponentId::new("user.profile");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"user.profile\"");
    let back: ComponentId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn operation_ids_are_unique_and_parse() {
    let a = OperationId::new();
    let b = OperationId::new();
    assert_ne!(a, b);
    let parsed: OperationId = a.to_string().parse().unwrap();
    assert_eq!(parsed, a);
}

#[test]
fn operation_id_rejects_garbage() {
    assert!("not-a-uuid".parse::<OperationId>().is_err());
}

// ── Priority ─────────────────────────────────────────────────────

#[test]
fn priority_total_order() {
    let mut ps = vec![
        Priority::Low,
        Priority::Immediate,
        Priority::Normal,
        Priority::Critical,
        Priority::High,
    ];
    ps.sort();
    assert_eq!(
        ps,
        vec![
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Critical,
            Priority::Immediate
        ]
    );
    assert!(Priority::Immediate.weight() > Priority::Critical.weight());
}

#[test]
fn only_update_and_patch_coalesce() {
    assert!(OperationKind::Update.is_coalescable());
    assert!(OperationKind::Patch.is_coalescable());
    assert!(!OperationKind::Create.is_coalescable());
    assert!(!OperationKind::Delete.is_coalescable());
}

// ── Events ───────────────────────────────────────────────────────

#[test]
fn event_builder_sets_metadata() {
    let event = Event::new("cart.item.added", json!({"sku": 1}))
        .with_type("added")
        .with_source("cart")
        .with_target("badge")
        .with_priority(Priority::High);
    assert_eq!(event.topic, "cart.item.added");
    assert_eq!(event.event_type, "added");
    assert_eq!(event.target.as_deref(), Some("badge"));
    assert_eq!(event.priority, Priority::High);
    assert!(!event.is_aggregate());
}

#[test]
fn aggregate_event_carries_list_in_order() {
    let events: Vec<Event> = (0..3)
        .map(|i| Event::new("metrics.tick", json!(i)))
        .collect();
    let agg = Event::aggregate("metrics.*", &events);
    assert!(agg.is_aggregate());
    assert!(agg.batch_id.is_some());
    assert_eq!(agg.payload["count"], json!(3));
    let payloads: Vec<_> = agg.payload["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["payload"].clone())
        .collect();
    assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
}

// ── Versions ─────────────────────────────────────────────────────

#[test]
fn checksum_ignores_key_order() {
    let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
    let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
    assert_eq!(checksum(&a), checksum(&b));
    assert_ne!(checksum(&a), checksum(&json!({"a": 1})));
}

#[test]
fn version_record_ordering_and_next() {
    let v1 = VersionRecord::for_payload(1, 10, "device-a", &json!("A"));
    let v2 = v1.next(20, "server", &json!("B"));
    assert_eq!(v2.version, 2);
    assert!(v2.is_newer_than(&v1));
    assert!(!v1.is_newer_than(&v2));
    assert!(v2 > v1);
    assert!(v2.matches(&json!("B")));
    assert!(!v2.matches(&json!("A")));
}

// ── Overlay ──────────────────────────────────────────────────────

#[test]
fn overlay_replaces_top_level_fields_only() {
    let base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
    let patch = json!({"b": 2, "nested": {"x": 9}});
    assert_eq!(
        overlay(&base, &patch),
        json!({"a": 1, "b": 2, "nested": {"x": 9}})
    );
}

#[test]
fn overlay_of_non_objects_takes_overlay() {
    assert_eq!(overlay(&json!(1), &json!({"a": 1})), json!({"a": 1}));
    assert_eq!(overlay(&json!({"a": 1}), &json!("x")), json!("x"));
}

// ── Retry ────────────────────────────────────────────────────────

#[test]
fn retry_delay_doubles_up_to_cap() {
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay_ms: 100,
        max_delay_ms: 350,
    };
    let delays: Vec<u64> = (0..4).map(|r| policy.delay(r).as_millis() as u64).collect();
    assert_eq!(delays, vec![100, 200, 350, 350]);
    assert_eq!(policy.delay(200), Duration::from_millis(350));

    assert!(policy.allows(2));
    assert!(!policy.allows(3));
}

// ── Clock ────────────────────────────────────────────────────────

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(1_000);
    assert_eq!(clock.now_millis(), 1_000);
    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.now_millis(), 1_250);
    clock.set(5);
    assert_eq!(clock.now_millis(), 5);
}

// ── TaskHandle ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn periodic_task_ticks_until_shutdown() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let handle = TaskHandle::periodic("test-loop", Duration::from_millis(100), move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(handle.name(), "test-loop");

    tokio::time::sleep(Duration::from_millis(350)).await;
    let seen = ticks.load(Ordering::SeqCst);
    assert_eq!(seen, 3);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn dropping_handle_cancels() {
    let handle = TaskHandle::spawn("waiter", |token| async move {
        token.cancelled().await;
    });
    assert!(!handle.is_cancelled());
    handle.cancel();
    assert!(handle.is_cancelled());
    handle.shutdown().await;
}

// ── Properties ───────────────────────────────────────────────────

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
        Just(Priority::Immediate),
    ]
}

fn flat_object() -> impl Strategy<Value = serde_json::Map<String, serde_json::Value>> {
    prop::collection::btree_map("[a-e]{1,2}", any::<i32>(), 0..8).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect()
    })
}

proptest! {
    #[test]
    fn priority_order_follows_weight(a in priority_strategy(), b in priority_strategy()) {
        prop_assert_eq!(a.cmp(&b), a.weight().cmp(&b.weight()));
    }

    #[test]
    fn overlay_keeps_every_key_and_prefers_overlay(
        base in flat_object(),
        patch in flat_object(),
    ) {
        let merged = overlay(
            &serde_json::Value::Object(base.clone()),
            &serde_json::Value::Object(patch.clone()),
        );
        let merged = merged.as_object().unwrap();
        for (k, v) in &patch {
            prop_assert_eq!(merged.get(k), Some(v));
        }
        for (k, v) in &base {
            if !patch.contains_key(k) {
                prop_assert_eq!(merged.get(k), Some(v));
            }
        }
        prop_assert!(merged.keys().all(|k| base.contains_key(k) || patch.contains_key(k)));
    }

    #[test]
    fn overlay_with_empty_or_self_is_identity(base in flat_object()) {
        let base = serde_json::Value::Object(base);
        prop_assert_eq!(&overlay(&base, &json!({})), &base);
        prop_assert_eq!(&overlay(&base, &base), &base);
    }

    #[test]
    fn checksum_is_independent_of_insertion_order(base in flat_object()) {
        let forward: serde_json::Map<_, _> = base.clone().into_iter().collect();
        let backward: serde_json::Map<_, _> = base.into_iter().rev().collect();
        prop_assert_eq!(
            checksum(&serde_json::Value::Object(forward)),
            checksum(&serde_json::Value::Object(backward))
        );
    }

    #[test]
    fn retry_delay_never_shrinks_or_passes_cap(
        base in 1u64..10_000,
        cap in 1u64..100_000,
        retry in 0u32..80,
    ) {
        let policy = RetryPolicy { max_retries: 3, base_delay_ms: base, max_delay_ms: cap };
        let now = policy.delay(retry);
        prop_assert!(now <= Duration::from_millis(cap));
        prop_assert!(policy.delay(retry + 1) >= now);
    }
}
