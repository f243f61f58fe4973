//! The change detector.

use crate::comparator::{Comparator, DateTimeComparator, NumericComparator, UnorderedSetComparator};
use crate::hash::structural_hash;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use statehub_types::TaskHandle;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Path reported when the two roots themselves differ.
pub const ROOT_PATH: &str = "$";

/// Configuration for [`ChangeDetector`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Upper bound on cached comparison results (per cache).
    pub max_cache_entries: usize,
    /// Cached results older than this are dropped by [`ChangeDetector::prune_expired`].
    pub cache_max_age_ms: u64,
    /// Register the built-in datetime, numeric and unordered-set comparators.
    pub builtin_comparators: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 1_000,
            cache_max_age_ms: 60_000,
            builtin_comparators: true,
        }
    }
}

/// Outcome of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    pub equal: bool,
    /// Dotted / indexed paths that differ, sorted. Empty when `equal`.
    pub changed_paths: Vec<String>,
}

impl ChangeSet {
    /// The result for two equal values.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            equal: true,
            changed_paths: Vec::new(),
        }
    }

    fn from_paths(paths: BTreeSet<String>) -> Self {
        Self {
            equal: paths.is_empty(),
            changed_paths: paths.into_iter().collect(),
        }
    }

    /// Returns true if `path` or one of its ancestors/descendants changed.
    #[must_use]
    pub fn touches(&self, path: &str) -> bool {
        self.changed_paths.iter().any(|p| {
            p == path
                || p == ROOT_PATH
                || is_ancestor(p, path)
                || is_ancestor(path, p)
        })
    }
}

fn is_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && matches!(path.as_bytes()[ancestor.len()], b'.' | b'[')
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorStats {
    pub comparisons: u64,
    pub reference_hits: u64,
    pub cache_hits: u64,
    pub identity_hits: u64,
}

struct CachedResult {
    result: ChangeSet,
    stored_at: Instant,
}

struct IdentityEntry {
    left: Weak<Value>,
    right: Weak<Value>,
    result: ChangeSet,
    stored_at: Instant,
}

impl IdentityEntry {
    fn refers_to(&self, a: &Arc<Value>, b: &Arc<Value>) -> bool {
        matches!(self.left.upgrade(), Some(l) if Arc::ptr_eq(&l, a))
            && matches!(self.right.upgrade(), Some(r) if Arc::ptr_eq(&r, b))
    }
}

/// Structural equality and diffing over JSON state, with result caching.
///
/// Two caches sit in front of the recursive comparison:
///
/// - a structural cache keyed by the pair of [`structural_hash`]es. A hit
///   returns the result of an earlier full comparison of operands with the same
///   hashes. A 64-bit collision between two different pairs would return that
///   earlier result; the risk is accepted for the speed-up and bounded by the
///   cache age.
/// - an identity cache for `Arc`-shared states, keyed by allocation address and
///   validated through `Weak` handles, so a freed and reused address never
///   produces a stale hit.
///
/// JSON values are trees, so no cycle guard is needed during traversal.
pub struct ChangeDetector {
    config: DetectorConfig,
    comparators: RwLock<Vec<Arc<dyn Comparator>>>,
    results: Mutex<HashMap<(u64, u64), CachedResult>>,
    identities: Mutex<HashMap<(usize, usize), IdentityEntry>>,
    comparisons: AtomicU64,
    reference_hits: AtomicU64,
    cache_hits: AtomicU64,
    identity_hits: AtomicU64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl ChangeDetector {
    /// Creates a detector.
    pub fn new(config: DetectorConfig) -> Self {
        let detector = Self {
            comparators: RwLock::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            comparisons: AtomicU64::new(0),
            reference_hits: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            identity_hits: AtomicU64::new(0),
            config,
        };
        if detector.config.builtin_comparators {
            detector.register_comparator(Arc::new(DateTimeComparator));
            detector.register_comparator(Arc::new(UnorderedSetComparator));
            detector.register_comparator(Arc::new(NumericComparator));
        }
        detector
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Registers a comparator. Comparators are consulted by descending priority;
    /// among equal priorities the earlier registration wins.
    ///
    /// Clears the result caches, since earlier results may no longer hold.
    pub fn register_comparator(&self, comparator: Arc<dyn Comparator>) {
        let mut comparators = self.comparators.write();
        debug!(
            comparator = comparator.name(),
            priority = comparator.priority(),
            "Registered comparator"
        );
        comparators.push(comparator);
        comparators.sort_by_key(|c| std::cmp::Reverse(c.priority()));
        drop(comparators);
        self.clear_cache();
    }

    /// Returns true if `a` and `b` are structurally equal.
    pub fn deep_equals(&self, a: &Value, b: &Value) -> bool {
        self.compare(a, b).equal
    }

    /// Compares two values and reports every differing path.
    pub fn compare(&self, a: &Value, b: &Value) -> ChangeSet {
        if std::ptr::eq(a, b) {
            self.reference_hits.fetch_add(1, Ordering::Relaxed);
            return ChangeSet::unchanged();
        }

        let key = (structural_hash(a), structural_hash(b));
        if let Some(hit) = self.results.lock().get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(?key, "comparison cache hit");
            return hit.result.clone();
        }

        let result = self.diff_values(a, b);

        let mut results = self.results.lock();
        if results.len() >= self.config.max_cache_entries {
            evict_oldest(&mut results, |e| e.stored_at);
        }
        results.insert(
            key,
            CachedResult {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        result
    }

    /// Compares two shared states, remembering the result for this exact pair
    /// of allocations.
    pub fn compare_shared(&self, a: &Arc<Value>, b: &Arc<Value>) -> ChangeSet {
        if Arc::ptr_eq(a, b) {
            self.reference_hits.fetch_add(1, Ordering::Relaxed);
            return ChangeSet::unchanged();
        }

        let key = (Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize);
        {
            let identities = self.identities.lock();
            if let Some(entry) = identities.get(&key) {
                if entry.refers_to(a, b) {
                    self.identity_hits.fetch_add(1, Ordering::Relaxed);
                    return entry.result.clone();
                }
            }
        }

        let result = self.compare(a, b);

        let mut identities = self.identities.lock();
        if identities.len() >= self.config.max_cache_entries {
            identities.retain(|_, e| e.left.strong_count() > 0 && e.right.strong_count() > 0);
            if identities.len() >= self.config.max_cache_entries {
                evict_oldest(&mut identities, |e| e.stored_at);
            }
        }
        identities.insert(
            key,
            IdentityEntry {
                left: Arc::downgrade(a),
                right: Arc::downgrade(b),
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        result
    }

    /// Compares only the listed field paths, without descending into them.
    ///
    /// Each path is projected out of both values (`"profile.name"`,
    /// `"items[0]"`, the notation [`ChangeDetector::compare`] reports); a path is reported when the projections differ, including
    /// when it exists on only one side.
    pub fn compare_paths(&self, a: &Value, b: &Value, paths: &[&str]) -> ChangeSet {
        let comparators = self.comparators.read();
        let changed: BTreeSet<String> = paths
            .iter()
            .filter(|path| {
                match (project(a, path), project(b, path)) {
                    (None, None) => false,
                    (Some(x), Some(y)) => !shallow_equal(&comparators, x, y),
                    _ => true,
                }
            })
            .map(|p| (*p).to_string())
            .collect();
        ChangeSet::from_paths(changed)
    }

    /// Drops cached results older than `max_age`. Returns how many were dropped.
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let fresh = |stored_at: Instant| now.duration_since(stored_at) < max_age;

        let mut results = self.results.lock();
        let before = results.len();
        results.retain(|_, e| fresh(e.stored_at));
        let mut dropped = before - results.len();
        drop(results);

        let mut identities = self.identities.lock();
        let before = identities.len();
        identities.retain(|_, e| {
            fresh(e.stored_at) && e.left.strong_count() > 0 && e.right.strong_count() > 0
        });
        dropped += before - identities.len();

        if dropped > 0 {
            debug!(dropped, "Pruned change detector caches");
        }
        dropped
    }

    /// Prunes using the configured maximum age.
    pub fn prune_expired(&self) -> usize {
        self.prune(Duration::from_millis(self.config.cache_max_age_ms))
    }

    /// Starts a loop that prunes the caches every `period`.
    pub fn spawn_pruning(self: &Arc<Self>, period: Duration) -> TaskHandle {
        let detector = Arc::clone(self);
        TaskHandle::periodic("change-detector-prune", period, move || {
            let detector = Arc::clone(&detector);
            async move {
                detector.prune_expired();
            }
        })
    }

    /// Empties both caches.
    pub fn clear_cache(&self) {
        self.results.lock().clear();
        self.identities.lock().clear();
    }

    /// Number of cached structural results.
    pub fn cache_len(&self) -> usize {
        self.results.lock().len()
    }

    /// Returns the diagnostic counters.
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            comparisons: self.comparisons.load(Ordering::Relaxed),
            reference_hits: self.reference_hits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            identity_hits: self.identity_hits.load(Ordering::Relaxed),
        }
    }

    fn diff_values(&self, a: &Value, b: &Value) -> ChangeSet {
        self.comparisons.fetch_add(1, Ordering::Relaxed);
        let comparators = self.comparators.read();
        let mut changed = BTreeSet::new();
        let mut path = String::new();
        diff(&comparators, a, b, &mut path, &mut changed);
        ChangeSet::from_paths(changed)
    }
}

fn diff(
    comparators: &[Arc<dyn Comparator>],
    a: &Value,
    b: &Value,
    path: &mut String,
    changed: &mut BTreeSet<String>,
) {
    if let Some(c) = comparators.iter().find(|c| c.applies(a, b)) {
        if !c.equals(a, b) {
            changed.insert(display_path(path));
        }
        return;
    }

    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            for key in keys {
                let len = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
                match (left.get(key), right.get(key)) {
                    (Some(x), Some(y)) => diff(comparators, x, y, path, changed),
                    _ => {
                        changed.insert(path.clone());
                    }
                }
                path.truncate(len);
            }
        }
        (Value::Array(left), Value::Array(right)) => {
            for i in 0..left.len().max(right.len()) {
                let len = path.len();
                path.push('[');
                path.push_str(&i.to_string());
                path.push(']');
                match (left.get(i), right.get(i)) {
                    (Some(x), Some(y)) => diff(comparators, x, y, path, changed),
                    _ => {
                        changed.insert(path.clone());
                    }
                }
                path.truncate(len);
            }
        }
        _ => {
            if a != b {
                changed.insert(display_path(path));
            }
        }
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        ROOT_PATH.to_string()
    } else {
        path.to_string()
    }
}

fn shallow_equal(comparators: &[Arc<dyn Comparator>], a: &Value, b: &Value) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    match comparators.iter().find(|c| c.applies(a, b)) {
        Some(c) => c.equals(a, b),
        None => a == b,
    }
}

/// Resolves a path in the notation `diff` reports (`"a.b"`, `"items[0]"`,
/// `"[1].name"`) inside `value`. A dotted segment is always an object key.
pub(crate) fn project<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() || path == ROOT_PATH {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        let (key, mut indices) = match segment.find('[') {
            Some(open) => (&segment[..open], &segment[open..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        while let Some(rest) = indices.strip_prefix('[') {
            let close = rest.find(']')?;
            let index: usize = rest[..close].parse().ok()?;
            current = current.as_array()?.get(index)?;
            indices = &rest[close + 1..];
        }
        if !indices.is_empty() {
            return None;
        }
    }
    Some(current)
}

fn evict_oldest<K: Clone + Eq + std::hash::Hash, V>(
    map: &mut HashMap<K, V>,
    stored_at: impl Fn(&V) -> Instant,
) {
    let oldest = map
        .iter()
        .min_by_key(|(_, v)| stored_at(v))
        .map(|(k, _)| k.clone());
    if let Some(k) = oldest {
        map.remove(&k);
    }
}
