//! Read side of the ledger: area views, movement/audit listing and lookups.
//!
//! Queries never lock. A reader may observe an item one transition behind a concurrent writer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inventrack_core::{AreaId, EquipmentId, ItemId, MovementId};
use inventrack_inventory::{
    ActiveLoan, AreaViewStatus, Equipment, Item, ItemClass, ItemStatus, LoanPhase, MovementKind,
};

use super::r#trait::StoreError;

pub const AREA_VIEW_MAX_SIZE: u32 = 100;
pub const LEDGER_MAX_SIZE: u32 = 200;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_EQUIPMENT_PREFIX: &str = "PC-";
pub const ITEM_CODE_PAD: usize = 2;
pub const EQUIPMENT_CODE_PAD: usize = 3;

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: Option<u32>, size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1),
            size: size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Page at least 1, size within `1..=max`.
    pub fn clamped(self, max: u32) -> Self {
        Self {
            page: self.page.max(1),
            size: self.size.clamp(1, max),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Rows matching the filter across all pages.
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    /// Cut one page out of the complete, already ordered result.
    pub fn from_rows(rows: Vec<T>, request: PageRequest) -> Self {
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.size as usize)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            size: request.size,
        }
    }

    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.size) < self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaRef {
    pub id: AreaId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentSummary {
    pub id: EquipmentId,
    pub code: String,
    pub name: String,
}

/// Optional filters of the area item view. Dates compare by calendar day, inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaItemFilter {
    pub class: Option<ItemClass>,
    pub item_type: Option<String>,
    /// Ledger status of the item, not its per-area view status.
    pub status: Option<ItemStatus>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
}

impl AreaItemFilter {
    pub fn matches(&self, item: &Item) -> bool {
        let day = item.created_at.date_naive();
        self.class.is_none_or(|c| c == item.class)
            && self.status.is_none_or(|s| s == item.status)
            && self
                .item_type
                .as_deref()
                .is_none_or(|t| t.trim().eq_ignore_ascii_case(&item.item_type))
            && self.created_from.is_none_or(|from| day >= from)
            && self.created_to.is_none_or(|to| day <= to)
    }
}

/// Optional filters of the per-area equipment listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaEquipmentFilter {
    /// Case-insensitive substring of the code, name or end user.
    pub text: Option<String>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
}

impl AreaEquipmentFilter {
    pub fn text_needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, equipment: &Equipment) -> bool {
        let day = equipment.created_at.date_naive();
        self.created_from.is_none_or(|from| day >= from)
            && self.created_to.is_none_or(|to| day <= to)
            && self.text_needle().is_none_or(|n| {
                equipment.code.to_lowercase().contains(&n)
                    || equipment.name.to_lowercase().contains(&n)
                    || equipment
                        .end_user
                        .as_deref()
                        .is_some_and(|u| u.to_lowercase().contains(&n))
            })
    }
}

/// One equipment unit located in an area. Credentials are never listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaEquipmentRow {
    pub id: EquipmentId,
    pub code: String,
    pub name: String,
    pub end_user: Option<String>,
    pub member_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the two-sided area view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaItemRow {
    pub item_id: ItemId,
    pub code: String,
    pub class: ItemClass,
    pub item_type: String,
    /// Stored item status.
    pub status: ItemStatus,
    /// Status as seen from the viewing area.
    pub view_status: AreaViewStatus,
    pub created_at: DateTime<Utc>,
    pub equipment: Option<EquipmentSummary>,
    /// Borrower for the owner side, owner for the borrower side.
    pub counterpart: Option<AreaRef>,
    pub can_return: bool,
}

impl AreaItemRow {
    pub fn is_loan_received(&self) -> bool {
        self.view_status == AreaViewStatus::OnLoanReceived
    }
}

/// Which trail the ledger listing reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerSource {
    #[default]
    Movements,
    Audit,
    Mixed,
}

impl LedgerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerSource::Movements => "MOVEMENTS",
            LedgerSource::Audit => "AUDIT",
            LedgerSource::Mixed => "MIXED",
        }
    }

    pub fn includes_movements(self) -> bool {
        self != LedgerSource::Audit
    }

    pub fn includes_audit(self) -> bool {
        self != LedgerSource::Movements
    }
}

/// Filters of the movement/audit listing.
///
/// `kind`, `item_id`, `equipment_id` and `area_id` narrow movement rows only; audit rows are
/// filtered by date range and text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub source: LedgerSource,
    pub kind: Option<MovementKind>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Case-insensitive substring search.
    pub text: Option<String>,
    pub item_id: Option<ItemId>,
    pub equipment_id: Option<EquipmentId>,
    /// Matches either origin or destination.
    pub area_id: Option<AreaId>,
}

impl LedgerFilter {
    pub fn text_needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn in_date_range(&self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        self.from.is_none_or(|from| day >= from) && self.to.is_none_or(|to| day <= to)
    }
}

/// Movement or audit entry in the common listing shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    /// Movement id or audit id, depending on `is_audit`.
    pub id: i64,
    pub is_audit: bool,
    pub item_id: Option<ItemId>,
    pub item_code: Option<String>,
    pub item_class: Option<ItemClass>,
    pub item_type: Option<String>,
    /// Movement kind, or the audit action.
    pub kind: String,
    pub loan_phase: Option<LoanPhase>,
    pub occurred_at: DateTime<Utc>,
    pub origin: Option<AreaRef>,
    pub destination: Option<AreaRef>,
    pub equipment: Option<EquipmentSummary>,
    pub actor: String,
    pub reason: Option<String>,
    pub detail: JsonValue,
}

/// Current membership of an item, with the equipment it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDetail {
    pub equipment: EquipmentSummary,
    pub area_id: AreaId,
    pub slot: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub item: Item,
    pub membership: Option<MembershipDetail>,
    pub loan: Option<ActiveLoan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentMember {
    pub item_id: ItemId,
    pub code: String,
    pub class: ItemClass,
    pub item_type: String,
    pub status: ItemStatus,
    pub slot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentDetail {
    pub equipment: Equipment,
    /// Components first, then by type and code.
    pub members: Vec<EquipmentMember>,
}

/// A loan involving an area, as owner or borrower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaLoanRow {
    /// The TRANSFER movement that opened the loan.
    pub movement_id: MovementId,
    pub item_id: ItemId,
    pub item_code: String,
    pub item_type: String,
    pub origin: AreaRef,
    pub destination: AreaRef,
    pub since: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

impl AreaLoanRow {
    pub fn is_active(&self) -> bool {
        self.returned_at.is_none()
    }
}

/// Filters of the available-items listing (items in storage that may join equipment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableItemFilter {
    pub class: ItemClass,
    pub item_type: Option<String>,
    /// Case-insensitive substring of the item code or type.
    pub text: Option<String>,
}

impl AvailableItemFilter {
    pub fn matches(&self, item: &Item) -> bool {
        let needle = self
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        item.class == self.class
            && item.status == ItemStatus::InStorage
            && self
                .item_type
                .as_deref()
                .is_none_or(|t| t.trim().eq_ignore_ascii_case(&item.item_type))
            && needle.is_none_or(|n| {
                item.code.to_lowercase().contains(&n) || item.item_type.to_lowercase().contains(&n)
            })
    }
}

/// Read-only queries over the ledger.
#[async_trait::async_trait]
pub trait LedgerQuery: Send + Sync {
    /// Open loan of an item, from its latest TRANSFER movement.
    async fn active_loan(&self, item_id: ItemId) -> Result<Option<ActiveLoan>, StoreError>;

    /// Items owned by the area plus items other areas lent to it.
    ///
    /// Ordered by type, then code (both case-insensitive), then item id.
    async fn area_items(
        &self,
        area_id: AreaId,
        filter: AreaItemFilter,
        page: PageRequest,
    ) -> Result<Page<AreaItemRow>, StoreError>;

    /// Equipment located in the area, ordered by code (case-insensitive), then id.
    async fn area_equipment(
        &self,
        area_id: AreaId,
        filter: AreaEquipmentFilter,
        page: PageRequest,
    ) -> Result<Page<AreaEquipmentRow>, StoreError>;

    /// Movement and/or audit rows, newest first.
    async fn ledger_entries(
        &self,
        filter: LedgerFilter,
        page: PageRequest,
    ) -> Result<Page<LedgerRow>, StoreError>;

    async fn item_detail(&self, item_id: ItemId) -> Result<ItemDetail, StoreError>;

    async fn equipment_detail(&self, id: EquipmentId) -> Result<EquipmentDetail, StoreError>;

    /// Loans where the area is owner or borrower, newest first.
    async fn area_loans(
        &self,
        area_id: AreaId,
        active_only: bool,
        page: PageRequest,
    ) -> Result<Page<AreaLoanRow>, StoreError>;

    /// Items of the area in storage, ordered by type then code.
    async fn available_items(
        &self,
        area_id: AreaId,
        filter: AvailableItemFilter,
        page: PageRequest,
    ) -> Result<Page<Item>, StoreError>;

    /// Next free item code for a class + type in an area (prefix = upper-cased type).
    async fn suggest_item_code(
        &self,
        class: ItemClass,
        item_type: &str,
        area_id: AreaId,
    ) -> Result<String, StoreError>;

    /// Next free equipment code in an area (default prefix `PC-`).
    async fn suggest_equipment_code(
        &self,
        area_id: AreaId,
        prefix: Option<&str>,
    ) -> Result<String, StoreError>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn page_request_is_clamped() {
        let request = PageRequest::new(Some(0), Some(5000)).clamped(AREA_VIEW_MAX_SIZE);
        assert_eq!(request, PageRequest { page: 1, size: 100 });

        let request = PageRequest::new(Some(3), Some(0)).clamped(LEDGER_MAX_SIZE);
        assert_eq!(request.size, 1);
        assert_eq!(request.offset(), 2);
    }

    #[test]
    fn page_from_rows_keeps_total() {
        let page = Page::from_rows((1..=7).collect::<Vec<_>>(), PageRequest { page: 2, size: 3 });
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 7);
        assert!(page.has_more());

        let last = Page::from_rows((1..=7).collect::<Vec<_>>(), PageRequest { page: 3, size: 3 });
        assert_eq!(last.items, vec![7]);
        assert!(!last.has_more());
    }

    #[test]
    fn ledger_source_selects_trails() {
        assert!(LedgerSource::Movements.includes_movements());
        assert!(!LedgerSource::Movements.includes_audit());
        assert!(LedgerSource::Mixed.includes_movements() && LedgerSource::Mixed.includes_audit());
        assert!(!LedgerSource::Audit.includes_movements());
    }

    #[test]
    fn equipment_filter_matches_text_and_days() {
        let created_at = "2026-03-10T15:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let equipment = Equipment {
            id: EquipmentId::new(1),
            code: "PC-07".into(),
            name: "Recepcion".into(),
            area_id: AreaId::new(1),
            end_user: Some("Lucia Paz".into()),
            login: Some("recepcion".into()),
            password: Some("secret".into()),
            created_at,
            updated_at: created_at,
        };
        let day = created_at.date_naive();

        assert!(AreaEquipmentFilter::default().matches(&equipment));
        assert!(AreaEquipmentFilter { text: Some(" lucia ".into()), ..Default::default() }.matches(&equipment));
        assert!(AreaEquipmentFilter { text: Some("pc-0".into()), ..Default::default() }.matches(&equipment));
        assert!(!AreaEquipmentFilter { text: Some("secret".into()), ..Default::default() }.matches(&equipment));
        assert!(
            AreaEquipmentFilter { created_from: Some(day), created_to: Some(day), ..Default::default() }
                .matches(&equipment)
        );
        assert!(!AreaEquipmentFilter { created_from: day.succ_opt(), ..Default::default() }.matches(&equipment));
    }

    proptest! {
        #[test]
        fn pages_partition_the_rows(len in 0usize..60, size in 0u32..15) {
            let rows: Vec<usize> = (0..len).collect();
            let size = PageRequest::new(Some(1), Some(size)).clamped(AREA_VIEW_MAX_SIZE).size;

            let mut seen = Vec::new();
            let mut page_no = 1;
            loop {
                let page = Page::from_rows(rows.clone(), PageRequest { page: page_no, size });
                prop_assert_eq!(page.total, len as u64);
                prop_assert!(page.items.len() <= size as usize);
                seen.extend(page.items.iter().copied());
                if !page.has_more() {
                    break;
                }
                page_no += 1;
            }
            prop_assert_eq!(seen, rows);
        }
    }
}
