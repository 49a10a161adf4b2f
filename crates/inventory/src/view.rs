//! Two-sided area view: how an item looks from the owning and the borrowing area.

use serde::{Deserialize, Serialize};

use inventrack_core::{AreaId, DomainError};

use crate::movement::LoanTerms;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AreaViewStatus {
    InStorage,
    InUse,
    /// Owner side of an active loan.
    LoanedOut,
    /// Borrower side of an active loan.
    OnLoanReceived,
}

impl AreaViewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AreaViewStatus::InStorage => "IN_STORAGE",
            AreaViewStatus::InUse => "IN_USE",
            AreaViewStatus::LoanedOut => "LOANED_OUT",
            AreaViewStatus::OnLoanReceived => "ON_LOAN_RECEIVED",
        }
    }

    /// Only the owner side may hand a loan back.
    pub fn can_return(self) -> bool {
        self == AreaViewStatus::LoanedOut
    }
}

impl core::str::FromStr for AreaViewStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_STORAGE" => Ok(AreaViewStatus::InStorage),
            "IN_USE" => Ok(AreaViewStatus::InUse),
            "LOANED_OUT" => Ok(AreaViewStatus::LoanedOut),
            "ON_LOAN_RECEIVED" => Ok(AreaViewStatus::OnLoanReceived),
            other => Err(DomainError::validation(format!("unknown area view status '{other}'"))),
        }
    }
}

impl core::fmt::Display for AreaViewStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an item as listed for `viewer`, or `None` when the item is not visible there.
pub fn area_view_status(
    viewer: AreaId,
    owning_area: AreaId,
    has_membership: bool,
    loan: Option<&LoanTerms>,
) -> Option<AreaViewStatus> {
    match loan {
        Some(_) if viewer == owning_area => Some(AreaViewStatus::LoanedOut),
        Some(loan) if viewer == loan.destination_area => Some(AreaViewStatus::OnLoanReceived),
        _ if viewer != owning_area => None,
        _ if has_membership => Some(AreaViewStatus::InUse),
        _ => Some(AreaViewStatus::InStorage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: AreaId = AreaId::new(1);
    const BORROWER: AreaId = AreaId::new(2);
    const BYSTANDER: AreaId = AreaId::new(3);

    fn loan() -> LoanTerms {
        LoanTerms {
            origin_area: OWNER,
            destination_area: BORROWER,
        }
    }

    #[test]
    fn loaned_item_shows_on_both_sides() {
        let loan = loan();
        assert_eq!(
            area_view_status(OWNER, OWNER, false, Some(&loan)),
            Some(AreaViewStatus::LoanedOut)
        );
        assert_eq!(
            area_view_status(BORROWER, OWNER, true, Some(&loan)),
            Some(AreaViewStatus::OnLoanReceived)
        );
        assert_eq!(area_view_status(BYSTANDER, OWNER, false, Some(&loan)), None);
    }

    #[test]
    fn owner_sees_membership_without_loan() {
        assert_eq!(area_view_status(OWNER, OWNER, true, None), Some(AreaViewStatus::InUse));
        assert_eq!(area_view_status(OWNER, OWNER, false, None), Some(AreaViewStatus::InStorage));
        assert_eq!(area_view_status(BORROWER, OWNER, false, None), None);
    }

    #[test]
    fn only_owner_side_can_return() {
        assert!(AreaViewStatus::LoanedOut.can_return());
        assert!(!AreaViewStatus::OnLoanReceived.can_return());
        assert!(!AreaViewStatus::InUse.can_return());
    }
}
