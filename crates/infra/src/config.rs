//! Configuration loading for the ledger stores.
//!
//! Values come from the process environment:
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `DATABASE_URL` | none | Postgres connection string (required by the Postgres store) |
//! | `INVENTRACK_MAX_CONNECTIONS` | `10` | pool size |
//! | `INVENTRACK_ACQUIRE_TIMEOUT_SECS` | `5` | wait for a pooled connection |
//! | `INVENTRACK_STATEMENT_TIMEOUT_MS` | `5000` | per-transaction `statement_timeout` |

use std::time::Duration;

use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "INVENTRACK_MAX_CONNECTIONS";
pub const ACQUIRE_TIMEOUT_SECS: &str = "INVENTRACK_ACQUIRE_TIMEOUT_SECS";
pub const STATEMENT_TIMEOUT_MS: &str = "INVENTRACK_STATEMENT_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_millis(5000),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = lookup(DATABASE_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let max_connections = parse_or(&lookup, MAX_CONNECTIONS, defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_CONNECTIONS,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let acquire_secs = parse_or(&lookup, ACQUIRE_TIMEOUT_SECS, defaults.acquire_timeout.as_secs())?;
        let statement_ms = parse_or(
            &lookup,
            STATEMENT_TIMEOUT_MS,
            defaults.statement_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_secs),
            statement_timeout: Duration::from_millis(statement_ms),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing(DATABASE_URL))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
