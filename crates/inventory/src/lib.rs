//! Inventory domain module: item lifecycle and the movement ledger.
//!
//! This crate contains business rules for items, equipment membership, loans and the
//! area views derived from them, implemented purely as deterministic domain logic
//! (no IO, no storage).

pub mod area;
pub mod audit;
pub mod code;
pub mod equipment;
pub mod error;
pub mod item;
pub mod ledger;
pub mod movement;
pub mod view;

pub use area::Area;
pub use audit::{AuditAction, AuditEntry, NewAuditEntry};
pub use code::suggest_next_code;
pub use equipment::{
    CurrentMembership, Equipment, EquipmentUpdate, Membership, NewEquipment, NewMember,
    ensure_member_candidate,
};
pub use error::LedgerError;
pub use item::{Item, ItemClass, ItemStatus, NewItem, status_after_assign, status_after_unassign};
pub use ledger::{
    EquipmentRef, ItemAssigned, ItemCommand, ItemEvent, ItemState, ItemUnassigned, LedgerCommand,
    LoanClosed, LoanOpened, MembershipChange,
};
pub use movement::{
    ActiveLoan, LoanPhase, LoanTerms, Movement, MovementKind, NewMovement, active_loan, detail_object,
};
pub use view::{AreaViewStatus, area_view_status};
