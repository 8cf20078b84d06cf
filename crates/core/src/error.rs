//! Errors raised by the campaign model itself.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A campaign brief, work unit or matrix update that the model rejects.
///
/// Always deterministic: retrying the same input fails the same way, so the
/// pipeline treats these as fatal. Bus and store failures live in their own
/// crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Caller-supplied data is malformed (brief fields, stage names, tuples).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Internal bookkeeping broke a rule it must keep.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// True when the error stems from the caller's input rather than from a
    /// broken internal rule.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidId(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_told_apart_from_broken_invariants() {
        assert!(DomainError::validation("empty name").is_caller_error());
        assert!(DomainError::invalid_id("ProductId: ''").is_caller_error());
        assert!(!DomainError::invariant("revision counter overflow").is_caller_error());
    }

    #[test]
    fn messages_carry_the_detail() {
        assert_eq!(
            DomainError::validation("duplicate aspect ratio").to_string(),
            "validation failed: duplicate aspect ratio"
        );
    }
}
