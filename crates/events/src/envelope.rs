use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inventrack_core::{Actor, ItemId, MovementId};

/// Envelope for a committed ledger event, carrying stream metadata.
///
/// This is the unit published on the bus once the unit of work that produced it committed.
///
/// Notes:
/// - The stream is the affected item; `movement_id` is its position in the global ledger and
///   increases monotonically.
/// - `actor` is the user recorded on the movement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    item_id: ItemId,
    movement_id: MovementId,
    event_type: String,
    actor: Actor,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        item_id: ItemId,
        movement_id: MovementId,
        event_type: impl Into<String>,
        actor: Actor,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            item_id,
            movement_id,
            event_type: event_type.into(),
            actor,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn movement_id(&self) -> MovementId {
        self.movement_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
