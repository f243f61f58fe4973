use crate::entry::CacheEntry;
use serde::{Deserialize, Serialize};

/// How victims are chosen when the cache is full.
///
/// Expired entries are always purged before any policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Soonest expiry first; entries without a TTL go last.
    Ttl,
    /// Least recently accessed first.
    Lru,
    /// Least frequently accessed first, then least recent.
    Lfu,
    /// Never evict; a full cache rejects new entries.
    Manual,
    /// Lowest [`smart_score`] first.
    #[default]
    Smart,
}

/// Retention score for the smart policy. Higher means keep.
///
/// Priority dominates, frequent access adds a logarithmic bonus, and time
/// since last access (per minute) and age (per hour) subtract from it.
pub fn smart_score(entry: &CacheEntry, now: u64) -> f64 {
    let meta = &entry.metadata;
    let priority = f64::from(meta.priority.weight()) * 10.0;
    let frequency = (1.0 + meta.access_count as f64).ln() * 5.0;
    let idle_minutes = now.saturating_sub(meta.last_accessed) as f64 / 60_000.0;
    let age_hours = now.saturating_sub(meta.created_at) as f64 / 3_600_000.0;
    priority + frequency - idle_minutes - age_hours
}

/// Picks the next victim among `candidates`, or `None` under the manual policy.
pub(crate) fn select_victim<'a>(
    policy: EvictionPolicy,
    candidates: impl Iterator<Item = &'a CacheEntry>,
    now: u64,
) -> Option<&'a CacheEntry> {
    match policy {
        EvictionPolicy::Manual => None,
        EvictionPolicy::Lru => candidates.min_by_key(|e| (e.metadata.last_accessed, e.metadata.created_at)),
        EvictionPolicy::Lfu => {
            candidates.min_by_key(|e| (e.metadata.access_count, e.metadata.last_accessed))
        }
        EvictionPolicy::Ttl => candidates.min_by_key(|e| {
            (
                e.metadata.expires_at.unwrap_or(u64::MAX),
                e.metadata.created_at,
            )
        }),
        EvictionPolicy::Smart => candidates.min_by(|a, b| {
            smart_score(a, now)
                .total_cmp(&smart_score(b, now))
                .then(a.metadata.last_accessed.cmp(&b.metadata.last_accessed))
        }),
    }
}
