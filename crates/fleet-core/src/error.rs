//! Errors raised while interpreting domain values.

use thiserror::Error;

/// Errors that can occur when converting wire strings into domain types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A string did not name any known variant of an enumerated field.
    #[error("invalid {field} '{value}', expected one of: {expected}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}
