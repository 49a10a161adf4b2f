use std::sync::Arc;

use thiserror::Error;

use inventrack_core::{Actor, AreaId, DomainError, EquipmentId, ErrorKind};
use inventrack_inventory::{
    Area, Equipment, EquipmentUpdate, Item, ItemEvent, ItemStatus, LedgerCommand, LedgerError,
    Movement, NewEquipment, NewItem,
};

/// Ledger store operation error.
///
/// `Ledger` carries the domain failure signals unchanged; the other variants are
/// infrastructure failures raised by the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Uniqueness, foreign-key or check constraint rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Transient store failure (connection, timeout, lock poisoning).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Ledger(LedgerError::Domain(value))
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Ledger(e) => e.kind(),
            StoreError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            StoreError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// The ledger failure signal, when this is one.
    pub fn ledger(&self) -> Option<&LedgerError> {
        match self {
            StoreError::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of one committed item transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTransition {
    /// Item row after the transition.
    pub item: Item,
    pub events: Vec<ItemEvent>,
    /// Ledger rows appended, in the same order as `events`.
    pub movements: Vec<Movement>,
    /// Envelopes the bus refused after commit. Filled in by `LedgerService`; stores return zero.
    pub unpublished: usize,
}

impl CommittedTransition {
    pub fn status(&self) -> ItemStatus {
        self.item.status
    }

    pub fn fully_published(&self) -> bool {
        self.unpublished == 0
    }
}

/// Result of creating an equipment unit with its initial members.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEquipment {
    pub equipment: Equipment,
    /// One assignment per requested member, in item id order.
    pub assignments: Vec<CommittedTransition>,
}

/// Source of organizational areas.
#[async_trait::async_trait]
pub trait AreaDirectory: Send + Sync {
    /// Register an area; `parent` must exist when given.
    async fn create_area(
        &self,
        name: &str,
        parent: Option<AreaId>,
        actor: &Actor,
    ) -> Result<Area, StoreError>;

    async fn area(&self, id: AreaId) -> Result<Option<Area>, StoreError>;

    /// All areas, roots first, then by name.
    async fn areas(&self) -> Result<Vec<Area>, StoreError>;
}

/// Write side of the item ledger.
///
/// Every method is one atomic unit of work: either all of its rows (item status, membership,
/// movements, audit entries) are written or none are.
///
/// Implementations must:
/// - serialize transitions of the same item (row lock or global write lock)
/// - decide transitions only through `LedgerCommand::resolve` and `ItemState::handle`
/// - never update or delete movement and audit rows
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Register a new item in storage. Writes an audit entry, no movement.
    async fn create_item(&self, item: NewItem, actor: &Actor) -> Result<Item, StoreError>;

    /// Run one item transition (assign, unassign, loan, return).
    async fn execute(
        &self,
        command: LedgerCommand,
        actor: &Actor,
    ) -> Result<CommittedTransition, StoreError>;

    /// Create an equipment unit and assign its members, all or nothing.
    async fn create_equipment(
        &self,
        equipment: NewEquipment,
        actor: &Actor,
    ) -> Result<CreatedEquipment, StoreError>;

    async fn update_equipment(
        &self,
        id: EquipmentId,
        update: EquipmentUpdate,
        actor: &Actor,
    ) -> Result<Equipment, StoreError>;
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn create_item(&self, item: NewItem, actor: &Actor) -> Result<Item, StoreError> {
        (**self).create_item(item, actor).await
    }

    async fn execute(
        &self,
        command: LedgerCommand,
        actor: &Actor,
    ) -> Result<CommittedTransition, StoreError> {
        (**self).execute(command, actor).await
    }

    async fn create_equipment(
        &self,
        equipment: NewEquipment,
        actor: &Actor,
    ) -> Result<CreatedEquipment, StoreError> {
        (**self).create_equipment(equipment, actor).await
    }

    async fn update_equipment(
        &self,
        id: EquipmentId,
        update: EquipmentUpdate,
        actor: &Actor,
    ) -> Result<Equipment, StoreError> {
        (**self).update_equipment(id, update, actor).await
    }
}
