//! Acting user identity.
//!
//! Every mutating operation takes the actor explicitly; it is recorded on each movement
//! and audit row. There is no ambient/session-wide user.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Username of the user performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(username: impl Into<String>) -> Result<Self, DomainError> {
        let username = username.into();
        let trimmed = username.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("actor username cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Actor used for operations not triggered by a person (migrations, seeding).
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
