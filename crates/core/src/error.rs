//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure category shared by every error type in the workspace.
///
/// Callers map this to a response code without re-deriving state: `NotFound` means the
/// referenced entity does not exist, `InvalidTransition` means the operation is not allowed
/// in the item's current state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    Validation,
    ConstraintViolation,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Validation => "validation_error",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::Storage => "storage_error",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input rejected before any ledger rule runs.
///
/// Ledger rules have their own error type in the inventory crate; store failures live in the
/// store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_input_is_a_validation_failure() {
        let err = DomainError::validation("item type cannot be empty");
        assert_eq!(err.to_string(), "validation failed: item type cannot be empty");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(DomainError::invalid_id("ItemId: abc").kind(), ErrorKind::Validation);
    }

    #[test]
    fn kinds_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::InvalidTransition).unwrap();
        assert_eq!(json, "\"INVALID_TRANSITION\"");
    }
}
