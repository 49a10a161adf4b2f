//! Item lifecycle state machine.
//!
//! `ItemState` is the aggregate: current item row, its equipment membership and its active
//! loan. Stores load it (locking the item), resolve a [`LedgerCommand`] against it, let
//! `handle` decide the [`ItemEvent`], then persist the event's membership change, status and
//! movement row in one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use inventrack_core::{Actor, Aggregate, AggregateRoot, AreaId, EquipmentId, ItemId};
use inventrack_events::Event;

use crate::area::Area;
use crate::equipment::{CurrentMembership, Equipment};
use crate::error::LedgerError;
use crate::item::{Item, ItemStatus, status_after_assign, status_after_unassign};
use crate::movement::{LoanPhase, LoanTerms, MovementKind, NewMovement, detail_object};

/// Ledger operation as requested by a caller (identifiers only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerCommand {
    Assign {
        equipment_id: EquipmentId,
        item_id: ItemId,
        slot: Option<String>,
    },
    Unassign {
        equipment_id: EquipmentId,
        item_id: ItemId,
    },
    Loan {
        item_id: ItemId,
        destination_area_id: AreaId,
        detail: Option<JsonValue>,
    },
    Return {
        item_id: ItemId,
        detail: Option<JsonValue>,
    },
}

impl LedgerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCommand::Assign { .. } => "assign",
            LedgerCommand::Unassign { .. } => "unassign",
            LedgerCommand::Loan { .. } => "loan",
            LedgerCommand::Return { .. } => "return",
        }
    }

    pub fn item_id(&self) -> ItemId {
        match self {
            LedgerCommand::Assign { item_id, .. }
            | LedgerCommand::Unassign { item_id, .. }
            | LedgerCommand::Loan { item_id, .. }
            | LedgerCommand::Return { item_id, .. } => *item_id,
        }
    }

    /// Equipment the store must look up before resolving.
    pub fn equipment_id(&self) -> Option<EquipmentId> {
        match self {
            LedgerCommand::Assign { equipment_id, .. } | LedgerCommand::Unassign { equipment_id, .. } => {
                Some(*equipment_id)
            }
            _ => None,
        }
    }

    /// Area the store must look up before resolving.
    pub fn destination_area_id(&self) -> Option<AreaId> {
        match self {
            LedgerCommand::Loan {
                destination_area_id, ..
            } => Some(*destination_area_id),
            _ => None,
        }
    }

    /// Bind the command to the rows the store loaded for it.
    ///
    /// `state` is `None` when the item does not exist, `equipment` / `destination` are `None`
    /// when the referenced equipment / area does not exist. Nothing has been written yet, so
    /// every error returned here leaves no trace.
    pub fn resolve(
        &self,
        state: Option<ItemState>,
        equipment: Option<&Equipment>,
        destination: Option<&Area>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(ItemState, ItemCommand), LedgerError> {
        match self {
            LedgerCommand::Assign {
                equipment_id,
                item_id,
                slot,
            } => {
                let equipment = equipment.ok_or(LedgerError::EquipmentNotFound(*equipment_id))?;
                let state = state.ok_or(LedgerError::ItemNotFound(*item_id))?;
                let slot = slot
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                Ok((
                    state,
                    ItemCommand::Assign {
                        equipment: EquipmentRef::from(equipment),
                        slot,
                        occurred_at,
                    },
                ))
            }
            LedgerCommand::Unassign {
                equipment_id,
                item_id,
            } => {
                let not_found = LedgerError::MembershipNotFound {
                    equipment_id: *equipment_id,
                    item_id: *item_id,
                };
                let (Some(state), Some(equipment)) = (state, equipment) else {
                    return Err(not_found);
                };
                Ok((
                    state,
                    ItemCommand::Unassign {
                        equipment: EquipmentRef::from(equipment),
                        occurred_at,
                    },
                ))
            }
            LedgerCommand::Loan {
                item_id,
                destination_area_id,
                detail,
            } => {
                let state = state.ok_or(LedgerError::ItemNotFound(*item_id))?;
                if destination.is_none() {
                    return Err(LedgerError::InvalidDestination {
                        item_id: *item_id,
                        destination: *destination_area_id,
                        reason: "unknown area",
                    });
                }
                Ok((
                    state,
                    ItemCommand::Loan {
                        destination: *destination_area_id,
                        detail: detail_object(detail.clone())?,
                        occurred_at,
                    },
                ))
            }
            LedgerCommand::Return { item_id, detail } => {
                let state = state.ok_or(LedgerError::ItemNotFound(*item_id))?;
                Ok((
                    state,
                    ItemCommand::Return {
                        detail: detail_object(detail.clone())?,
                        occurred_at,
                    },
                ))
            }
        }
    }
}

/// What the state machine needs to know about an equipment unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRef {
    pub id: EquipmentId,
    pub area_id: AreaId,
}

impl From<&Equipment> for EquipmentRef {
    fn from(equipment: &Equipment) -> Self {
        Self {
            id: equipment.id,
            area_id: equipment.area_id,
        }
    }
}

/// Resolved command, handled by [`ItemState`].
#[derive(Debug, Clone, PartialEq)]
pub enum ItemCommand {
    Assign {
        equipment: EquipmentRef,
        slot: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Unassign {
        equipment: EquipmentRef,
        occurred_at: DateTime<Utc>,
    },
    Loan {
        destination: AreaId,
        detail: JsonValue,
        occurred_at: DateTime<Utc>,
    },
    Return {
        detail: JsonValue,
        occurred_at: DateTime<Utc>,
    },
}

/// Event: item joined (or moved to) an equipment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAssigned {
    pub item_id: ItemId,
    pub equipment_id: EquipmentId,
    pub area_id: AreaId,
    pub slot: Option<String>,
    /// Set when the item left another equipment unit to join this one.
    pub previous_equipment_id: Option<EquipmentId>,
    pub status: ItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: item withdrawn from an equipment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUnassigned {
    pub item_id: ItemId,
    pub equipment_id: EquipmentId,
    pub area_id: AreaId,
    pub slot: Option<String>,
    pub status: ItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: item lent to another area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanOpened {
    pub item_id: ItemId,
    pub origin_area: AreaId,
    pub destination_area: AreaId,
    pub detail: JsonValue,
    pub status: ItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: item given back to its owning area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanClosed {
    pub item_id: ItemId,
    /// The borrowing area handing the item back.
    pub origin_area: AreaId,
    /// The owning area.
    pub destination_area: AreaId,
    /// Equipment the item was detached from, if it was still a member somewhere.
    pub released_equipment_id: Option<EquipmentId>,
    pub detail: JsonValue,
    pub status: ItemStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemEvent {
    Assigned(ItemAssigned),
    Unassigned(ItemUnassigned),
    LoanOpened(LoanOpened),
    LoanClosed(LoanClosed),
}

impl Event for ItemEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ItemEvent::Assigned(_) => "inventory.item.assigned",
            ItemEvent::Unassigned(_) => "inventory.item.unassigned",
            ItemEvent::LoanOpened(_) => "inventory.item.loan_opened",
            ItemEvent::LoanClosed(_) => "inventory.item.loan_closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ItemEvent::Assigned(e) => e.occurred_at,
            ItemEvent::Unassigned(e) => e.occurred_at,
            ItemEvent::LoanOpened(e) => e.occurred_at,
            ItemEvent::LoanClosed(e) => e.occurred_at,
        }
    }
}

/// Change to apply on the membership relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Keep,
    /// Delete any membership in another equipment, then insert or update this one.
    Set {
        equipment_id: EquipmentId,
        slot: Option<String>,
    },
    Clear,
}

impl ItemEvent {
    pub fn item_id(&self) -> ItemId {
        match self {
            ItemEvent::Assigned(e) => e.item_id,
            ItemEvent::Unassigned(e) => e.item_id,
            ItemEvent::LoanOpened(e) => e.item_id,
            ItemEvent::LoanClosed(e) => e.item_id,
        }
    }

    /// Item status after the event.
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemEvent::Assigned(e) => e.status,
            ItemEvent::Unassigned(e) => e.status,
            ItemEvent::LoanOpened(e) => e.status,
            ItemEvent::LoanClosed(e) => e.status,
        }
    }

    pub fn membership_change(&self) -> MembershipChange {
        match self {
            ItemEvent::Assigned(e) => MembershipChange::Set {
                equipment_id: e.equipment_id,
                slot: e.slot.clone(),
            },
            ItemEvent::Unassigned(_) => MembershipChange::Clear,
            ItemEvent::LoanOpened(_) => MembershipChange::Keep,
            ItemEvent::LoanClosed(_) => MembershipChange::Clear,
        }
    }

    /// Ledger row recording this event.
    pub fn to_movement(&self, actor: &Actor) -> NewMovement {
        match self {
            ItemEvent::Assigned(e) => {
                let mut detail = Map::new();
                if let Some(slot) = &e.slot {
                    detail.insert("slot".to_string(), JsonValue::from(slot.clone()));
                }
                if let Some(previous) = e.previous_equipment_id {
                    detail.insert("previous_equipment_id".to_string(), JsonValue::from(previous.get()));
                }
                NewMovement {
                    item_id: e.item_id,
                    kind: MovementKind::Assignment,
                    loan_phase: None,
                    origin_area: e.area_id,
                    destination_area: e.area_id,
                    equipment_id: Some(e.equipment_id),
                    actor: actor.clone(),
                    reason: Some("assign".to_string()),
                    detail: JsonValue::Object(detail),
                    occurred_at: e.occurred_at,
                }
            }
            ItemEvent::Unassigned(e) => {
                let mut detail = Map::new();
                if let Some(slot) = &e.slot {
                    detail.insert("slot".to_string(), JsonValue::from(slot.clone()));
                }
                NewMovement {
                    item_id: e.item_id,
                    kind: MovementKind::Withdrawal,
                    loan_phase: None,
                    origin_area: e.area_id,
                    destination_area: e.area_id,
                    equipment_id: Some(e.equipment_id),
                    actor: actor.clone(),
                    reason: Some("unassign".to_string()),
                    detail: JsonValue::Object(detail),
                    occurred_at: e.occurred_at,
                }
            }
            ItemEvent::LoanOpened(e) => NewMovement {
                item_id: e.item_id,
                kind: MovementKind::Transfer,
                loan_phase: Some(LoanPhase::Opened),
                origin_area: e.origin_area,
                destination_area: e.destination_area,
                equipment_id: None,
                actor: actor.clone(),
                reason: Some("loan".to_string()),
                detail: e.detail.clone(),
                occurred_at: e.occurred_at,
            },
            ItemEvent::LoanClosed(e) => NewMovement {
                item_id: e.item_id,
                kind: MovementKind::Transfer,
                loan_phase: Some(LoanPhase::Closed),
                origin_area: e.origin_area,
                destination_area: e.destination_area,
                equipment_id: e.released_equipment_id,
                actor: actor.clone(),
                reason: Some("return".to_string()),
                detail: e.detail.clone(),
                occurred_at: e.occurred_at,
            },
        }
    }
}

/// Aggregate root: an item with its membership and active loan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    item: Item,
    membership: Option<CurrentMembership>,
    loan: Option<LoanTerms>,
}

impl ItemState {
    pub fn new(item: Item, membership: Option<CurrentMembership>, loan: Option<LoanTerms>) -> Self {
        Self {
            item,
            membership,
            loan,
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn membership(&self) -> Option<&CurrentMembership> {
        self.membership.as_ref()
    }

    pub fn loan(&self) -> Option<&LoanTerms> {
        self.loan.as_ref()
    }


    fn handle_assign(
        &self,
        equipment: EquipmentRef,
        slot: &Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> ItemEvent {
        let previous_equipment_id = self
            .membership
            .as_ref()
            .map(|m| m.equipment_id)
            .filter(|id| *id != equipment.id);

        ItemEvent::Assigned(ItemAssigned {
            item_id: self.item.id,
            equipment_id: equipment.id,
            area_id: equipment.area_id,
            slot: slot.clone(),
            previous_equipment_id,
            status: status_after_assign(equipment.area_id, self.loan.as_ref()),
            occurred_at,
        })
    }

    fn handle_unassign(
        &self,
        equipment: EquipmentRef,
        occurred_at: DateTime<Utc>,
    ) -> Result<ItemEvent, LedgerError> {
        let membership = self
            .membership
            .as_ref()
            .filter(|m| m.equipment_id == equipment.id)
            .ok_or(LedgerError::MembershipNotFound {
                equipment_id: equipment.id,
                item_id: self.item.id,
            })?;

        Ok(ItemEvent::Unassigned(ItemUnassigned {
            item_id: self.item.id,
            equipment_id: equipment.id,
            area_id: equipment.area_id,
            slot: membership.slot.clone(),
            status: status_after_unassign(self.loan.as_ref()),
            occurred_at,
        }))
    }

    fn handle_loan(
        &self,
        destination: AreaId,
        detail: &JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Result<ItemEvent, LedgerError> {
        if destination == self.item.owning_area {
            return Err(LedgerError::InvalidDestination {
                item_id: self.item.id,
                destination,
                reason: "destination is the owning area",
            });
        }
        if let Some(loan) = &self.loan {
            return Err(LedgerError::LoanAlreadyActive {
                item_id: self.item.id,
                destination: loan.destination_area,
            });
        }

        let terms = LoanTerms {
            origin_area: self.item.owning_area,
            destination_area: destination,
        };
        Ok(ItemEvent::LoanOpened(LoanOpened {
            item_id: self.item.id,
            origin_area: terms.origin_area,
            destination_area: terms.destination_area,
            detail: detail.clone(),
            status: ItemStatus::OnLoan,
            occurred_at,
        }))
    }

    fn handle_return(&self, detail: &JsonValue, occurred_at: DateTime<Utc>) -> Result<ItemEvent, LedgerError> {
        let loan = self.loan.ok_or(LedgerError::NoActiveLoan(self.item.id))?;

        Ok(ItemEvent::LoanClosed(LoanClosed {
            item_id: self.item.id,
            origin_area: loan.destination_area,
            destination_area: loan.origin_area,
            released_equipment_id: self.membership.as_ref().map(|m| m.equipment_id),
            detail: detail.clone(),
            status: ItemStatus::InStorage,
            occurred_at,
        }))
    }
}

impl AggregateRoot for ItemState {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.item.id
    }
}

impl Aggregate for ItemState {
    type Command = ItemCommand;
    type Event = ItemEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ItemEvent::Assigned(e) => {
                self.membership = Some(CurrentMembership {
                    equipment_id: e.equipment_id,
                    equipment_area: e.area_id,
                    slot: e.slot.clone(),
                });
            }
            ItemEvent::Unassigned(_) => {
                self.membership = None;
            }
            ItemEvent::LoanOpened(e) => {
                self.loan = Some(LoanTerms {
                    origin_area: e.origin_area,
                    destination_area: e.destination_area,
                });
            }
            ItemEvent::LoanClosed(_) => {
                self.loan = None;
                self.membership = None;
            }
        }
        self.item.status = event.status();
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let event = match command {
            ItemCommand::Assign {
                equipment,
                slot,
                occurred_at,
            } => self.handle_assign(*equipment, slot, *occurred_at),
            ItemCommand::Unassign {
                equipment,
                occurred_at,
            } => self.handle_unassign(*equipment, *occurred_at)?,
            ItemCommand::Loan {
                destination,
                detail,
                occurred_at,
            } => self.handle_loan(*destination, detail, *occurred_at)?,
            ItemCommand::Return { detail, occurred_at } => self.handle_return(detail, *occurred_at)?,
        };
        Ok(vec![event])
    }
}
