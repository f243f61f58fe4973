//! Schema-driven validation and auto-repair of component state.
//!
//! A [`ValidationSchema`] is an ordered list of [`FieldRule`]s registered
//! per component category. [`Validator::validate_state`] never fails on bad
//! data: every finding lands in a [`ValidationResult`] with a score and, when
//! repairs were possible, a repaired copy of the state.

mod cross;
mod error;
mod path;
mod repair;
mod result;
mod schema;
mod validator;

pub use cross::{CrossRule, Relation, RelationFn};
pub use error::{ValidateError, ValidateResult};
pub use repair::{coerce, RepairStrategy};
pub use result::{score, IssueKind, ValidationIssue, ValidationResult};
pub use schema::{type_name, Constraint, CustomCheck, FieldRule, FieldType, Sanitizer, ValidationSchema};
pub use validator::{Validator, ValidatorConfig};
