use serde::{Deserialize, Serialize};
use statehub_types::ComponentId;

/// What a health check found wrong with one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthIssueKind {
    ExcessiveErrors { error_count: u64 },
    /// Updated at least once, but not within the stale window.
    Stale { idle_ms: u64 },
    MissingDependency { dependency: ComponentId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub component: ComponentId,
    #[serde(flatten)]
    pub kind: HealthIssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: u64,
    pub components: usize,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues reported for one component.
    pub fn issues_for<'a>(&'a self, id: &'a ComponentId) -> impl Iterator<Item = &'a HealthIssueKind> + 'a {
        self.issues
            .iter()
            .filter(move |i| &i.component == id)
            .map(|i| &i.kind)
    }
}
