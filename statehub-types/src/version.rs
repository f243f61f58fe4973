//! Version records attached to synced payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Version metadata for one payload revision.
///
/// Ordering compares `version` first and falls back to `timestamp`, so a record
/// is "newer" only when it carries a higher revision number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Monotonic revision number for the key.
    pub version: u64,
    /// Milliseconds since the Unix epoch when the revision was written.
    pub timestamp: u64,
    /// Writer that produced the revision (device, tab, or `"server"`).
    pub origin: String,
    /// Hex SHA-256 of the canonical JSON payload.
    pub checksum: String,
}

impl VersionRecord {
    /// Builds a record for `payload`, computing its checksum.
    #[must_use]
    pub fn for_payload(
        version: u64,
        timestamp: u64,
        origin: impl Into<String>,
        payload: &Value,
    ) -> Self {
        Self {
            version,
            timestamp,
            origin: origin.into(),
            checksum: checksum(payload),
        }
    }

    /// The record that follows this one for a new payload.
    #[must_use]
    pub fn next(&self, timestamp: u64, origin: impl Into<String>, payload: &Value) -> Self {
        Self::for_payload(self.version + 1, timestamp, origin, payload)
    }

    /// Returns true if `self` is a strictly later revision than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.version > other.version
    }

    /// Returns true if the checksum matches `payload`.
    #[must_use]
    pub fn matches(&self, payload: &Value) -> bool {
        self.checksum == checksum(payload)
    }
}

impl PartialOrd for VersionRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.checksum.cmp(&other.checksum))
    }
}

/// Hex SHA-256 over the serialized payload.
///
/// `serde_json` keeps object keys sorted, so equal values produce equal checksums.
#[must_use]
pub fn checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
