//! Failure signals of the item ledger.

use thiserror::Error;

use inventrack_core::{AreaId, DomainError, EquipmentId, ErrorKind, ItemId};

/// Error returned by ledger operations.
///
/// Every variant renders a human-readable reason; `kind()` tells "not found" apart from
/// "not allowed in the current state".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("equipment {0} not found")]
    EquipmentNotFound(EquipmentId),

    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("area {0} not found")]
    AreaNotFound(AreaId),

    #[error("item {item_id} is not assigned to equipment {equipment_id}")]
    MembershipNotFound {
        equipment_id: EquipmentId,
        item_id: ItemId,
    },

    #[error("cannot loan item {item_id} to area {destination}: {reason}")]
    InvalidDestination {
        item_id: ItemId,
        destination: AreaId,
        reason: &'static str,
    },

    #[error("item {0} has no active loan")]
    NoActiveLoan(ItemId),

    #[error("item {item_id} is already on loan to area {destination}")]
    LoanAlreadyActive { item_id: ItemId, destination: AreaId },

    #[error("item {item_id} is not available: {reason}")]
    ItemNotAvailable { item_id: ItemId, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::EquipmentNotFound(_)
            | LedgerError::ItemNotFound(_)
            | LedgerError::AreaNotFound(_)
            | LedgerError::MembershipNotFound { .. } => ErrorKind::NotFound,
            LedgerError::InvalidDestination { .. }
            | LedgerError::NoActiveLoan(_)
            | LedgerError::LoanAlreadyActive { .. }
            | LedgerError::ItemNotAvailable { .. } => ErrorKind::InvalidTransition,
            LedgerError::Domain(e) => e.kind(),
        }
    }

    /// Stable signal name for callers that branch on the failure.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::EquipmentNotFound(_) => "EquipmentNotFound",
            LedgerError::ItemNotFound(_) => "ItemNotFound",
            LedgerError::AreaNotFound(_) => "AreaNotFound",
            LedgerError::MembershipNotFound { .. } => "MembershipNotFound",
            LedgerError::InvalidDestination { .. } => "InvalidDestination",
            LedgerError::NoActiveLoan(_) => "NoActiveLoan",
            LedgerError::LoanAlreadyActive { .. } => "LoanAlreadyActive",
            LedgerError::ItemNotAvailable { .. } => "ItemNotAvailable",
            LedgerError::Domain(_) => "Validation",
        }
    }
}
