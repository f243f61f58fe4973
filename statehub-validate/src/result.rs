use serde::Serialize;
use serde_json::Value;

/// What went wrong at a path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    RequiredMissing,
    TypeMismatch { expected: String, found: String },
    ConstraintViolation { constraint: String },
    CustomCheck,
    UnknownField,
    MissingDependency { dependency: String },
    RelationViolated { dependency: String },
}

/// One finding from a validation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    #[serde(flatten)]
    pub kind: IssueKind,
    pub message: String,
    /// Suggested replacement value for `path`, if one exists.
    pub repair: Option<Value>,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
            repair: None,
        }
    }

    #[must_use]
    pub fn with_repair(mut self, repair: Option<Value>) -> Self {
        self.repair = repair;
        self
    }
}

/// Outcome of validating one state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// 0..=100. Each error costs 20 points, each warning 5.
    pub score: u32,
    /// The repaired state, present only when at least one repair was applied.
    pub repaired: Option<Value>,
}

impl ValidationResult {
    pub fn from_issues(
        errors: Vec<ValidationIssue>,
        warnings: Vec<ValidationIssue>,
        repaired: Option<Value>,
    ) -> Self {
        Self {
            valid: errors.is_empty(),
            score: score(errors.len(), warnings.len()),
            errors,
            warnings,
            repaired,
        }
    }

    /// A passing result with no findings.
    pub fn ok() -> Self {
        Self::from_issues(Vec::new(), Vec::new(), None)
    }
}

/// `max(0, 100 - 20 * errors - 5 * warnings)`.
pub fn score(errors: usize, warnings: usize) -> u32 {
    let penalty = errors.saturating_mul(20).saturating_add(warnings.saturating_mul(5));
    100usize.saturating_sub(penalty) as u32
}
