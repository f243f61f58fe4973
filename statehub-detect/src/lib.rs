//! Structural change detection for statehub.
//!
//! [`ChangeDetector`] answers two questions about JSON state: are these two
//! values structurally equal, and if not, which paths differ. Results are
//! cached twice (by structural hash and by `Arc` identity) because the
//! registry compares the same states repeatedly while dirty-checking.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use statehub_detect::ChangeDetector;
//!
//! let detector = ChangeDetector::default();
//! let before = json!({"user": {"name": "ada", "age": 36}});
//! let after = json!({"user": {"name": "ada", "age": 37}});
//!
//! let changes = detector.compare(&before, &after);
//! assert!(!changes.equal);
//! assert_eq!(changes.changed_paths, vec!["user.age".to_string()]);
//! ```

mod comparator;
mod detector;
mod hash;

pub use comparator::{Comparator, DateTimeComparator, NumericComparator, UnorderedSetComparator};
pub use detector::{ChangeDetector, ChangeSet, DetectorConfig, DetectorStats, ROOT_PATH};
pub use hash::structural_hash;
