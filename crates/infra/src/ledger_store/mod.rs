//! Item ledger persistence boundary.
//!
//! `LedgerStore` is the write side (atomic item transitions, equipment registry, item
//! registration), `LedgerQuery` the read side, `AreaDirectory` the source of areas. The
//! in-memory store backs tests and local runs; the Postgres store is the durable one.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use inventrack_core::Aggregate;
use inventrack_inventory::{Area, Equipment, ItemEvent, ItemState, LedgerCommand};

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use query::{
    AreaEquipmentFilter, AreaEquipmentRow, AreaItemFilter, AreaItemRow, AreaLoanRow, AreaRef,
    AvailableItemFilter, EquipmentDetail,
    EquipmentMember, EquipmentSummary, ItemDetail, LedgerFilter, LedgerQuery, LedgerRow,
    LedgerSource, MembershipDetail, Page, PageRequest,
};
pub use r#trait::{AreaDirectory, CommittedTransition, CreatedEquipment, LedgerStore, StoreError};

/// Decide a transition against freshly loaded (and, where supported, locked) rows.
///
/// Returns the post-transition state and the events to persist. Nothing is written here.
pub(crate) fn decide(
    command: &LedgerCommand,
    state: Option<ItemState>,
    equipment: Option<&Equipment>,
    destination: Option<&Area>,
    occurred_at: DateTime<Utc>,
) -> Result<(ItemState, Vec<ItemEvent>), StoreError> {
    let (mut state, item_command) = command.resolve(state, equipment, destination, occurred_at)?;
    let events = state.handle(&item_command)?;
    for event in &events {
        state.apply(event);
    }
    Ok((state, events))
}

pub(crate) fn snapshot<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Storage(format!("snapshot serialization failed: {e}")))
}

/// Audit snapshot of an equipment unit with the password masked.
pub(crate) fn equipment_snapshot(equipment: &Equipment) -> Result<JsonValue, StoreError> {
    let mut value = snapshot(equipment)?;
    if let Some(password) = value.get_mut("password").filter(|p| !p.is_null()) {
        *password = JsonValue::from("***");
    }
    Ok(value)
}
