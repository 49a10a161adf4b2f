//! Infrastructure layer: ledger stores (in-memory, Postgres), configuration and the
//! service that publishes committed transitions.

pub mod config;
pub mod ledger_service;
pub mod ledger_store;

/// Embedded schema for the Postgres ledger store.
pub const MIGRATION: &str = include_str!("../migrations/0001_inventory_ledger.sql");

pub use config::{ConfigError, LedgerConfig};
pub use ledger_service::{ItemEnvelope, LedgerService};
pub use ledger_store::{InMemoryLedgerStore, PostgresLedgerStore};

#[cfg(test)]
mod integration_tests;
