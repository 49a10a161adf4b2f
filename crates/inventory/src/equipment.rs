//! Equipment units and the equipment ↔ item membership relation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inventrack_core::{AreaId, DomainError, EquipmentId, ItemId};

use crate::error::LedgerError;
use crate::item::{Item, ItemStatus};

/// A named bundle of items located in one area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub code: String,
    pub name: String,
    pub area_id: AreaId,
    pub end_user: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Item to attach while creating an equipment unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMember {
    pub item_id: ItemId,
    pub slot: Option<String>,
}

/// Creation request for an equipment unit and its initial members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEquipment {
    pub code: String,
    pub name: String,
    pub area_id: AreaId,
    pub end_user: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub members: Vec<NewMember>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl NewEquipment {
    /// Trim fields, drop blank optionals and reject duplicate members.
    pub fn normalized(self) -> Result<Self, DomainError> {
        let code = self.code.trim().to_string();
        let name = self.name.trim().to_string();
        if code.is_empty() || name.is_empty() {
            return Err(DomainError::validation("equipment code and name are required"));
        }

        let mut seen = std::collections::HashSet::new();
        for member in &self.members {
            if !seen.insert(member.item_id) {
                return Err(DomainError::validation(format!(
                    "item {} listed twice",
                    member.item_id
                )));
            }
        }

        Ok(Self {
            code,
            name,
            area_id: self.area_id,
            end_user: blank_to_none(self.end_user),
            login: blank_to_none(self.login),
            password: blank_to_none(self.password),
            members: self.members,
        })
    }

    /// Split into the equipment row and its members, sorted by item id.
    ///
    /// Writers lock member items in this order.
    pub fn into_equipment(self, id: EquipmentId, at: DateTime<Utc>) -> (Equipment, Vec<NewMember>) {
        let mut members = self.members;
        members.sort_by_key(|m| m.item_id);
        let equipment = Equipment {
            id,
            code: self.code,
            name: self.name,
            area_id: self.area_id,
            end_user: self.end_user,
            login: self.login,
            password: self.password,
            created_at: at,
            updated_at: at,
        };
        (equipment, members)
    }
}

/// Partial metadata update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentUpdate {
    pub name: Option<String>,
    pub end_user: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl EquipmentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.end_user.is_none() && self.login.is_none() && self.password.is_none()
    }

    /// Apply onto `equipment`, bumping `updated_at`.
    pub fn apply_to(&self, equipment: &mut Equipment, at: DateTime<Utc>) -> Result<(), DomainError> {
        if let Some(name) = &self.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(DomainError::validation("equipment name cannot be empty"));
            }
            equipment.name = name.to_string();
        }
        if let Some(end_user) = &self.end_user {
            equipment.end_user = blank_to_none(Some(end_user.clone()));
        }
        if let Some(login) = &self.login {
            equipment.login = blank_to_none(Some(login.clone()));
        }
        if let Some(password) = &self.password {
            equipment.password = blank_to_none(Some(password.clone()));
        }
        equipment.updated_at = at;
        Ok(())
    }
}

/// Row of the membership relation (composite key equipment + item).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub equipment_id: EquipmentId,
    pub item_id: ItemId,
    pub slot: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

/// Membership of an item as seen by the state machine: which equipment, in which area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentMembership {
    pub equipment_id: EquipmentId,
    pub equipment_area: AreaId,
    pub slot: Option<String>,
}

/// Check that `item` may join `equipment` at creation time.
///
/// Only items stored in the equipment's own area qualify.
pub fn ensure_member_candidate(equipment: &Equipment, item: &Item) -> Result<(), LedgerError> {
    if item.owning_area != equipment.area_id {
        return Err(LedgerError::ItemNotAvailable {
            item_id: item.id,
            reason: format!(
                "owned by area {} but equipment {} is in area {}",
                item.owning_area, equipment.code, equipment.area_id
            ),
        });
    }
    if item.status != ItemStatus::InStorage {
        return Err(LedgerError::ItemNotAvailable {
            item_id: item.id,
            reason: format!("status is {}", item.status),
        });
    }
    Ok(())
}
