//! Error types for the validator.
//!
//! Failed validation is not an error: it is reported inside a
//! `ValidationResult`. These errors cover misuse of the validator itself.

use thiserror::Error;

/// Result type for validator operations.
pub type ValidateResult<T> = Result<T, ValidateError>;

/// Errors that can occur when configuring or invoking the validator.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// No schema registered for the category.
    #[error("no schema registered for category: {0}")]
    UnknownSchema(String),

    /// A pattern constraint did not compile.
    #[error("invalid pattern for field '{path}': {source}")]
    InvalidPattern {
        path: String,
        #[source]
        source: regex_lite::Error,
    },
}
