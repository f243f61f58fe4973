//! Priorities and operation kinds shared by the queueing subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority.
///
/// Declaration order is the total order: `Immediate > Critical > High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Immediate,
}

impl Priority {
    /// Numeric weight used by scoring functions (1 for `Low` up to 5 for `Immediate`).
    #[must_use]
    pub const fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
            Self::Immediate => 5,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Immediate => "immediate",
        };
        f.write_str(s)
    }
}

/// What an update or sync operation does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Patch,
}

impl OperationKind {
    /// Whether two pending operations of this kind on the same key may be merged
    /// (and therefore batched) instead of executed separately.
    #[must_use]
    pub const fn is_coalescable(self) -> bool {
        matches!(self, Self::Update | Self::Patch)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Patch => "patch",
        };
        f.write_str(s)
    }
}
