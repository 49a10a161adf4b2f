//! Application-level orchestration of item ledger operations.
//!
//! ```text
//! Operation
//!   ↓
//! 1. Store transaction: lock item, decide, write membership + movements + status
//!   ↓
//! 2. Commit
//!   ↓
//! 3. Publish one envelope per committed movement
//! ```
//!
//! Publication happens strictly after commit. A failed publish is logged and counted in
//! [`CommittedTransition::unpublished`]; it never undoes or fails the operation, the ledger row
//! is the source of truth.

use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use inventrack_core::{Actor, AreaId, EquipmentId, ItemId};
use inventrack_events::{Event, EventBus, EventEnvelope};
use inventrack_inventory::{
    Equipment, EquipmentUpdate, Item, ItemEvent, ItemStatus, LedgerCommand, NewEquipment, NewItem,
};

use crate::ledger_store::{CommittedTransition, CreatedEquipment, LedgerStore, StoreError};

/// Envelope type published for every committed item transition.
pub type ItemEnvelope = EventEnvelope<ItemEvent>;

/// Runs ledger operations against a store and publishes what they commit.
///
/// - `S`: ledger store (in-memory for tests, Postgres in production)
/// - `B`: event bus receiving [`ItemEnvelope`]s
#[derive(Debug)]
pub struct LedgerService<S, B> {
    store: S,
    bus: B,
}

impl<S, B> LedgerService<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> LedgerService<S, B>
where
    S: LedgerStore,
    B: EventBus<ItemEnvelope>,
{
    /// Put an item into an equipment unit (moving it out of any other one).
    ///
    /// Returns the status the item ends up with.
    #[instrument(skip(self, slot, actor), fields(actor = %actor), err)]
    pub async fn assign(
        &self,
        equipment_id: EquipmentId,
        item_id: ItemId,
        slot: Option<String>,
        actor: &Actor,
    ) -> Result<ItemStatus, StoreError> {
        let committed = self
            .execute(
                LedgerCommand::Assign {
                    equipment_id,
                    item_id,
                    slot,
                },
                actor,
            )
            .await?;
        Ok(committed.status())
    }

    #[instrument(skip(self, actor), fields(actor = %actor), err)]
    pub async fn unassign(&self, equipment_id: EquipmentId, item_id: ItemId, actor: &Actor) -> Result<(), StoreError> {
        self.execute(LedgerCommand::Unassign { equipment_id, item_id }, actor)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, detail, actor), fields(actor = %actor), err)]
    pub async fn loan(
        &self,
        item_id: ItemId,
        destination_area_id: AreaId,
        detail: Option<JsonValue>,
        actor: &Actor,
    ) -> Result<(), StoreError> {
        self.execute(
            LedgerCommand::Loan {
                item_id,
                destination_area_id,
                detail,
            },
            actor,
        )
        .await
        .map(|_| ())
    }

    /// Close the active loan and bring the item back to its owning area.
    #[instrument(skip(self, detail, actor), fields(actor = %actor), err)]
    pub async fn return_item(
        &self,
        item_id: ItemId,
        detail: Option<JsonValue>,
        actor: &Actor,
    ) -> Result<(), StoreError> {
        self.execute(LedgerCommand::Return { item_id, detail }, actor)
            .await
            .map(|_| ())
    }

    /// Run one transition and publish its events.
    pub async fn execute(&self, command: LedgerCommand, actor: &Actor) -> Result<CommittedTransition, StoreError> {
        let mut committed = self.store.execute(command, actor).await?;
        self.publish(&mut committed, actor);
        Ok(committed)
    }

    pub async fn create_item(&self, item: NewItem, actor: &Actor) -> Result<Item, StoreError> {
        self.store.create_item(item, actor).await
    }

    /// Create an equipment unit; its initial members are published as assignments.
    #[instrument(skip(self, equipment, actor), fields(code = %equipment.code), err)]
    pub async fn create_equipment(
        &self,
        equipment: NewEquipment,
        actor: &Actor,
    ) -> Result<CreatedEquipment, StoreError> {
        let mut created = self.store.create_equipment(equipment, actor).await?;
        for assignment in &mut created.assignments {
            self.publish(assignment, actor);
        }
        info!(
            equipment_id = %created.equipment.id,
            members = created.assignments.len(),
            "equipment registered"
        );
        Ok(created)
    }

    pub async fn update_equipment(
        &self,
        id: EquipmentId,
        update: EquipmentUpdate,
        actor: &Actor,
    ) -> Result<Equipment, StoreError> {
        self.store.update_equipment(id, update, actor).await
    }

    fn publish(&self, committed: &mut CommittedTransition, actor: &Actor) {
        let mut unpublished = 0;
        for (event, movement) in committed.events.iter().zip(&committed.movements) {
            let envelope = EventEnvelope::new(
                Uuid::now_v7(),
                event.item_id(),
                movement.id,
                event.event_type(),
                actor.clone(),
                event.clone(),
            );
            if let Err(err) = self.bus.publish(envelope) {
                warn!(
                    item_id = %event.item_id(),
                    movement_id = %movement.id,
                    event_type = event.event_type(),
                    error = %err,
                    "failed to publish committed ledger event"
                );
                unpublished += 1;
            }
        }
        committed.unpublished = unpublished;
    }
}
