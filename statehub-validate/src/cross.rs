use crate::path;
use crate::result::{IssueKind, ValidationIssue};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Predicate for [`Relation::Custom`]: `(own, dependency) -> holds`.
pub type RelationFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// How a component field must relate to a dependency's field.
#[derive(Clone)]
pub enum Relation {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    /// Own array holds the dependency value, own string contains it, or own
    /// object has it as a key.
    Contains,
    Custom(RelationFn),
}

impl Relation {
    pub fn holds(&self, own: &Value, dep: &Value) -> bool {
        match self {
            Self::Equals => own == dep,
            Self::NotEquals => own != dep,
            Self::GreaterThan => compare(own, dep) == Some(Ordering::Greater),
            Self::LessThan => compare(own, dep) == Some(Ordering::Less),
            Self::Contains => match (own, dep) {
                (Value::Array(items), d) => items.contains(d),
                (Value::String(s), Value::String(d)) => s.contains(d.as_str()),
                (Value::Object(map), Value::String(d)) => map.contains_key(d),
                _ => false,
            },
            Self::Custom(f) => f(own, dep),
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals => f.write_str("Equals"),
            Self::NotEquals => f.write_str("NotEquals"),
            Self::GreaterThan => f.write_str("GreaterThan"),
            Self::LessThan => f.write_str("LessThan"),
            Self::Contains => f.write_str("Contains"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A relationship between `field` of the validated component and
/// `dependency_field` of the component named `dependency`.
#[derive(Debug, Clone)]
pub struct CrossRule {
    pub field: String,
    pub dependency: String,
    pub dependency_field: String,
    pub relation: Relation,
    pub message: Option<String>,
}

impl CrossRule {
    pub fn new(
        field: impl Into<String>,
        dependency: impl Into<String>,
        dependency_field: impl Into<String>,
        relation: Relation,
    ) -> Self {
        Self {
            field: field.into(),
            dependency: dependency.into(),
            dependency_field: dependency_field.into(),
            relation,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Evaluates the rule. `None` means it holds.
    pub(crate) fn check(
        &self,
        state: &Value,
        dependencies: &HashMap<String, Value>,
    ) -> Option<ValidationIssue> {
        let Some(dep_state) = dependencies.get(&self.dependency) else {
            return Some(ValidationIssue::new(
                &self.field,
                IssueKind::MissingDependency {
                    dependency: self.dependency.clone(),
                },
                format!("dependency '{}' has no state", self.dependency),
            ));
        };
        let own = path::get(state, &self.field).unwrap_or(&Value::Null);
        let dep = path::get(dep_state, &self.dependency_field).unwrap_or(&Value::Null);
        if self.relation.holds(own, dep) {
            return None;
        }
        let message = self.message.clone().unwrap_or_else(|| {
            format!(
                "{} {:?} {}.{} failed ({own} vs {dep})",
                self.field, self.relation, self.dependency, self.dependency_field
            )
        });
        Some(ValidationIssue::new(
            &self.field,
            IssueKind::RelationViolated {
                dependency: self.dependency.clone(),
            },
            message,
        ))
    }
}
