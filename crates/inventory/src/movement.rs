//! Append-only movement ledger rows and the active-loan derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inventrack_core::{Actor, AreaId, DomainError, EquipmentId, ItemId, MovementId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Assignment,
    Withdrawal,
    Transfer,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Assignment => "ASSIGNMENT",
            MovementKind::Withdrawal => "WITHDRAWAL",
            MovementKind::Transfer => "TRANSFER",
        }
    }
}

impl core::str::FromStr for MovementKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASSIGNMENT" => Ok(MovementKind::Assignment),
            "WITHDRAWAL" => Ok(MovementKind::Withdrawal),
            "TRANSFER" => Ok(MovementKind::Transfer),
            other => Err(DomainError::validation(format!("unknown movement kind '{other}'"))),
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loan phase carried by TRANSFER movements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanPhase {
    Opened,
    Closed,
}

impl LoanPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LoanPhase::Opened => "OPENED",
            LoanPhase::Closed => "CLOSED",
        }
    }
}

impl core::str::FromStr for LoanPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPENED" => Ok(LoanPhase::Opened),
            "CLOSED" => Ok(LoanPhase::Closed),
            other => Err(DomainError::validation(format!("unknown loan phase '{other}'"))),
        }
    }
}

/// A movement ready to be appended (id assigned by the store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMovement {
    pub item_id: ItemId,
    pub kind: MovementKind,
    /// Set on TRANSFER rows only.
    pub loan_phase: Option<LoanPhase>,
    pub origin_area: AreaId,
    pub destination_area: AreaId,
    pub equipment_id: Option<EquipmentId>,
    pub actor: Actor,
    /// Short label of the operation that wrote the row.
    pub reason: Option<String>,
    /// Always a JSON object.
    pub detail: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl NewMovement {
    pub fn into_movement(self, id: MovementId) -> Movement {
        Movement {
            id,
            item_id: self.item_id,
            kind: self.kind,
            loan_phase: self.loan_phase,
            origin_area: self.origin_area,
            destination_area: self.destination_area,
            equipment_id: self.equipment_id,
            actor: self.actor,
            reason: self.reason,
            detail: self.detail,
            occurred_at: self.occurred_at,
        }
    }
}

/// An immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub item_id: ItemId,
    pub kind: MovementKind,
    pub loan_phase: Option<LoanPhase>,
    pub origin_area: AreaId,
    pub destination_area: AreaId,
    pub equipment_id: Option<EquipmentId>,
    pub actor: Actor,
    pub reason: Option<String>,
    pub detail: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl Movement {
    pub fn is_transfer(&self) -> bool {
        self.kind == MovementKind::Transfer
    }
}

/// Origin and destination of a loan, as used by the state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoanTerms {
    /// The owning area lending the item.
    pub origin_area: AreaId,
    /// The borrowing area.
    pub destination_area: AreaId,
}

/// An open loan, as recorded by the TRANSFER movement that opened it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLoan {
    pub movement_id: MovementId,
    pub item_id: ItemId,
    pub origin_area: AreaId,
    pub destination_area: AreaId,
    pub since: DateTime<Utc>,
}

impl ActiveLoan {
    /// Interpret the latest TRANSFER movement of an item.
    ///
    /// Returns `None` when the movement is not a transfer or closed the loan.
    pub fn from_latest_transfer(movement: &Movement) -> Option<Self> {
        if !movement.is_transfer() || movement.loan_phase != Some(LoanPhase::Opened) {
            return None;
        }
        Some(Self {
            movement_id: movement.id,
            item_id: movement.item_id,
            origin_area: movement.origin_area,
            destination_area: movement.destination_area,
            since: movement.occurred_at,
        })
    }

    pub fn terms(&self) -> LoanTerms {
        LoanTerms {
            origin_area: self.origin_area,
            destination_area: self.destination_area,
        }
    }
}

/// Active loan of `item_id` derived from its movement history.
///
/// Only the most recent TRANSFER (highest movement id) counts; the rows may come in any order.
pub fn active_loan<'a>(
    item_id: ItemId,
    movements: impl IntoIterator<Item = &'a Movement>,
) -> Option<ActiveLoan> {
    movements
        .into_iter()
        .filter(|m| m.item_id == item_id && m.is_transfer())
        .max_by_key(|m| m.id)
        .and_then(ActiveLoan::from_latest_transfer)
}

/// Normalize a caller-supplied detail payload into a JSON object.
pub fn detail_object(detail: Option<JsonValue>) -> Result<JsonValue, DomainError> {
    match detail {
        None | Some(JsonValue::Null) => Ok(JsonValue::Object(Default::default())),
        Some(value @ JsonValue::Object(_)) => Ok(value),
        Some(_) => Err(DomainError::validation("detail must be a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer(id: i64, phase: LoanPhase, origin: i64, destination: i64) -> Movement {
        Movement {
            id: MovementId::new(id),
            item_id: ItemId::new(1),
            kind: MovementKind::Transfer,
            loan_phase: Some(phase),
            origin_area: AreaId::new(origin),
            destination_area: AreaId::new(destination),
            equipment_id: None,
            actor: Actor::system(),
            reason: None,
            detail: json!({}),
            occurred_at: Utc::now(),
        }
    }

    fn assignment(id: i64) -> Movement {
        Movement {
            kind: MovementKind::Assignment,
            loan_phase: None,
            ..transfer(id, LoanPhase::Opened, 1, 1)
        }
    }

    #[test]
    fn no_transfers_means_no_loan() {
        let history = [assignment(1)];
        assert_eq!(active_loan(ItemId::new(1), &history), None);
    }

    #[test]
    fn latest_opened_transfer_is_the_active_loan() {
        let history = [transfer(4, LoanPhase::Opened, 1, 2), assignment(5)];
        let loan = active_loan(ItemId::new(1), &history).unwrap();
        assert_eq!(loan.movement_id, MovementId::new(4));
        assert_eq!(loan.destination_area, AreaId::new(2));
    }

    #[test]
    fn closing_transfer_retires_the_loan_regardless_of_input_order() {
        let history = [transfer(9, LoanPhase::Closed, 2, 1), transfer(3, LoanPhase::Opened, 1, 2)];
        assert_eq!(active_loan(ItemId::new(1), &history), None);
    }

    #[test]
    fn other_items_are_ignored() {
        let mut foreign = transfer(10, LoanPhase::Opened, 1, 3);
        foreign.item_id = ItemId::new(2);
        let history = [transfer(2, LoanPhase::Opened, 1, 2), foreign];
        let loan = active_loan(ItemId::new(1), &history).unwrap();
        assert_eq!(loan.destination_area, AreaId::new(2));
    }

    #[test]
    fn detail_must_be_an_object() {
        assert_eq!(detail_object(None).unwrap(), json!({}));
        assert_eq!(detail_object(Some(json!({"note": "x"}))).unwrap(), json!({"note": "x"}));
        assert!(detail_object(Some(json!([1, 2]))).is_err());
    }
}
