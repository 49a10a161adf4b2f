use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inventrack_core::{AreaId, DomainError, ItemId};

use crate::movement::LoanTerms;

/// Item class: internal component or external peripheral.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemClass {
    Component,
    Peripheral,
}

impl ItemClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemClass::Component => "COMPONENT",
            ItemClass::Peripheral => "PERIPHERAL",
        }
    }

    /// Components sort before peripherals in equipment listings.
    pub fn sort_rank(self) -> u8 {
        match self {
            ItemClass::Component => 0,
            ItemClass::Peripheral => 1,
        }
    }
}

impl core::str::FromStr for ItemClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPONENT" => Ok(ItemClass::Component),
            "PERIPHERAL" => Ok(ItemClass::Peripheral),
            other => Err(DomainError::validation(format!("unknown item class '{other}'"))),
        }
    }
}

impl core::fmt::Display for ItemClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item status, stored on the item row for filtering.
///
/// Every transition sets it: assign and unassign consult the active loan, a loan forces
/// `ON_LOAN`, a return forces `IN_STORAGE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    InStorage,
    InUse,
    /// Member of equipment in the area currently borrowing the item.
    InUseOnLoan,
    OnLoan,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::InStorage => "IN_STORAGE",
            ItemStatus::InUse => "IN_USE",
            ItemStatus::InUseOnLoan => "IN_USE_ON_LOAN",
            ItemStatus::OnLoan => "ON_LOAN",
        }
    }
}

impl core::str::FromStr for ItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_STORAGE" => Ok(ItemStatus::InStorage),
            "IN_USE" => Ok(ItemStatus::InUse),
            "IN_USE_ON_LOAN" => Ok(ItemStatus::InUseOnLoan),
            "ON_LOAN" => Ok(ItemStatus::OnLoan),
            other => Err(DomainError::validation(format!("unknown item status '{other}'"))),
        }
    }
}

impl core::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status after joining equipment located in `equipment_area`.
///
/// Only equipment in the area currently borrowing the item shows as `IN_USE_ON_LOAN`.
pub fn status_after_assign(equipment_area: AreaId, loan: Option<&LoanTerms>) -> ItemStatus {
    match loan {
        Some(loan) if loan.destination_area == equipment_area => ItemStatus::InUseOnLoan,
        _ => ItemStatus::InUse,
    }
}

/// Status after leaving equipment: back on loan while one is active, else in storage.
pub fn status_after_unassign(loan: Option<&LoanTerms>) -> ItemStatus {
    match loan {
        Some(_) => ItemStatus::OnLoan,
        None => ItemStatus::InStorage,
    }
}

/// A physical inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub code: String,
    pub class: ItemClass,
    pub item_type: String,
    /// Area the item belongs to permanently, independent of loans.
    pub owning_area: AreaId,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

/// Registration request for a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub code: String,
    pub class: ItemClass,
    pub item_type: String,
    pub owning_area: AreaId,
}

impl NewItem {
    /// Trim fields and reject blanks.
    pub fn normalized(self) -> Result<Self, DomainError> {
        let code = self.code.trim().to_string();
        let item_type = self.item_type.trim().to_string();
        if code.is_empty() {
            return Err(DomainError::validation("item code cannot be empty"));
        }
        if item_type.is_empty() {
            return Err(DomainError::validation("item type cannot be empty"));
        }
        Ok(Self {
            code,
            item_type,
            ..self
        })
    }

    /// Materialize the item row. New items always start in storage.
    pub fn into_item(self, id: ItemId, created_at: DateTime<Utc>) -> Item {
        Item {
            id,
            code: self.code,
            class: self.class,
            item_type: self.item_type,
            owning_area: self.owning_area,
            status: ItemStatus::InStorage,
            created_at,
        }
    }
}
