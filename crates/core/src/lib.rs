//! Domain foundation building blocks shared by the ledger crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod actor;
pub mod aggregate;
pub mod error;
pub mod id;

pub use actor::Actor;
pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{DomainError, ErrorKind};
pub use id::{AreaId, AuditId, EquipmentId, ItemId, MovementId};
