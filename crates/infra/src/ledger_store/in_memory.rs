use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::json;

use inventrack_core::{Actor, AreaId, AuditId, EquipmentId, ItemId, MovementId};
use inventrack_core::DomainError;
use inventrack_inventory::{
    ActiveLoan, Area, AreaViewStatus, AuditEntry, CurrentMembership, Equipment, EquipmentUpdate, Item,
    ItemClass, ItemState, LedgerCommand, LedgerError, LoanPhase, Membership, MembershipChange, Movement,
    NewAuditEntry, NewEquipment, NewItem, NewMovement, active_loan, area_view_status,
    ensure_member_candidate, suggest_next_code,
};

use super::query::{
    AREA_VIEW_MAX_SIZE, AreaEquipmentFilter, AreaEquipmentRow, AreaItemFilter, AreaItemRow, AreaLoanRow,
    AreaRef, AvailableItemFilter, DEFAULT_EQUIPMENT_PREFIX, EQUIPMENT_CODE_PAD, EquipmentDetail,
    EquipmentMember, EquipmentSummary, ITEM_CODE_PAD, ItemDetail, LEDGER_MAX_SIZE, LedgerFilter,
    LedgerQuery, LedgerRow, MembershipDetail, Page, PageRequest,
};
use super::r#trait::{AreaDirectory, CommittedTransition, CreatedEquipment, LedgerStore, StoreError};
use super::{decide, equipment_snapshot, snapshot};

#[derive(Debug, Clone, Default)]
struct Tables {
    areas: BTreeMap<AreaId, Area>,
    items: BTreeMap<ItemId, Item>,
    equipment: BTreeMap<EquipmentId, Equipment>,
    /// Keyed by item: an item is a member of at most one equipment unit.
    memberships: BTreeMap<ItemId, Membership>,
    movements: Vec<Movement>,
    audit: Vec<AuditEntry>,
    last_area_id: i64,
    last_item_id: i64,
    last_equipment_id: i64,
    last_movement_id: i64,
    last_audit_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl Tables {
    fn item_state(&self, item_id: ItemId) -> Option<ItemState> {
        let item = self.items.get(&item_id)?.clone();
        let membership = self.memberships.get(&item_id).and_then(|m| {
            self.equipment.get(&m.equipment_id).map(|e| CurrentMembership {
                equipment_id: e.id,
                equipment_area: e.area_id,
                slot: m.slot.clone(),
            })
        });
        let loan = active_loan(item_id, &self.movements).map(|l| l.terms());
        Some(ItemState::new(item, membership, loan))
    }

    /// Open loans keyed by item, from each item's latest TRANSFER.
    fn active_loans(&self) -> BTreeMap<ItemId, ActiveLoan> {
        let mut latest: BTreeMap<ItemId, &Movement> = BTreeMap::new();
        for movement in self.movements.iter().filter(|m| m.is_transfer()) {
            let entry = latest.entry(movement.item_id).or_insert(movement);
            if movement.id > entry.id {
                *entry = movement;
            }
        }
        latest
            .into_iter()
            .filter_map(|(item_id, m)| ActiveLoan::from_latest_transfer(m).map(|loan| (item_id, loan)))
            .collect()
    }

    fn transition(
        &mut self,
        command: &LedgerCommand,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Result<CommittedTransition, StoreError> {
        let state = self.item_state(command.item_id());
        let equipment = command.equipment_id().and_then(|id| self.equipment.get(&id)).cloned();
        let destination = command.destination_area_id().and_then(|id| self.areas.get(&id)).cloned();

        let (state, events) = decide(command, state, equipment.as_ref(), destination.as_ref(), at)?;

        let mut movements = Vec::with_capacity(events.len());
        for event in &events {
            self.change_membership(event.item_id(), event.membership_change(), at);
            movements.push(self.append_movement(event.to_movement(actor)));
        }

        let item = state.item().clone();
        self.items.insert(item.id, item.clone());
        Ok(CommittedTransition {
            item,
            events,
            movements,
            unpublished: 0,
        })
    }

    fn change_membership(&mut self, item_id: ItemId, change: MembershipChange, at: DateTime<Utc>) {
        match change {
            MembershipChange::Keep => {}
            MembershipChange::Set { equipment_id, slot } => {
                let assigned_at = self
                    .memberships
                    .get(&item_id)
                    .filter(|m| m.equipment_id == equipment_id)
                    .map(|m| m.assigned_at)
                    .unwrap_or(at);
                self.memberships.insert(
                    item_id,
                    Membership {
                        equipment_id,
                        item_id,
                        slot,
                        assigned_at,
                    },
                );
            }
            MembershipChange::Clear => {
                self.memberships.remove(&item_id);
            }
        }
    }

    fn append_movement(&mut self, movement: NewMovement) -> Movement {
        let id = MovementId::new(next_id(&mut self.last_movement_id));
        let movement = movement.into_movement(id);
        self.movements.push(movement.clone());
        movement
    }

    fn append_audit(&mut self, entry: NewAuditEntry) -> AuditEntry {
        let id = AuditId::new(next_id(&mut self.last_audit_id));
        let entry = entry.into_entry(id);
        self.audit.push(entry.clone());
        entry
    }

    fn require_area(&self, id: AreaId) -> Result<&Area, StoreError> {
        self.areas.get(&id).ok_or(StoreError::Ledger(LedgerError::AreaNotFound(id)))
    }

    fn area_ref(&self, id: AreaId) -> Option<AreaRef> {
        self.areas.get(&id).map(|a| AreaRef {
            id: a.id,
            name: a.name.clone(),
        })
    }

    fn equipment_summary(&self, id: EquipmentId) -> Option<EquipmentSummary> {
        self.equipment.get(&id).map(|e| EquipmentSummary {
            id: e.id,
            code: e.code.clone(),
            name: e.name.clone(),
        })
    }

    fn movement_row(&self, movement: &Movement) -> LedgerRow {
        let item = self.items.get(&movement.item_id);
        LedgerRow {
            id: movement.id.get(),
            is_audit: false,
            item_id: Some(movement.item_id),
            item_code: item.map(|i| i.code.clone()),
            item_class: item.map(|i| i.class),
            item_type: item.map(|i| i.item_type.clone()),
            kind: movement.kind.as_str().to_string(),
            loan_phase: movement.loan_phase,
            occurred_at: movement.occurred_at,
            origin: self.area_ref(movement.origin_area),
            destination: self.area_ref(movement.destination_area),
            equipment: movement.equipment_id.and_then(|id| self.equipment_summary(id)),
            actor: movement.actor.as_str().to_string(),
            reason: movement.reason.clone(),
            detail: movement.detail.clone(),
        }
    }
}

fn audit_row(entry: &AuditEntry) -> LedgerRow {
    LedgerRow {
        id: entry.id.get(),
        is_audit: true,
        item_id: None,
        item_code: None,
        item_class: None,
        item_type: None,
        kind: entry.action.as_str().to_string(),
        loan_phase: None,
        occurred_at: entry.occurred_at,
        origin: None,
        destination: None,
        equipment: None,
        actor: entry.actor.as_str().to_string(),
        reason: None,
        detail: json!({
            "entity": entry.entity,
            "entity_id": entry.entity_id,
            "before": entry.before,
            "after": entry.after,
            "extra": entry.extra,
        }),
    }
}

fn contains_text(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle))
}

fn movement_matches_text(row: &LedgerRow, needle: &str) -> bool {
    contains_text(row.item_code.as_deref(), needle)
        || contains_text(row.item_type.as_deref(), needle)
        || contains_text(row.equipment.as_ref().map(|e| e.code.as_str()), needle)
        || contains_text(row.equipment.as_ref().map(|e| e.name.as_str()), needle)
        || contains_text(Some(&row.actor), needle)
        || contains_text(row.reason.as_deref(), needle)
        || contains_text(Some(&row.detail.to_string()), needle)
}

fn audit_matches_text(row: &LedgerRow, needle: &str) -> bool {
    contains_text(Some(&row.actor), needle)
        || contains_text(Some(&row.kind), needle)
        || contains_text(Some(&row.detail.to_string()), needle)
}

fn by_type_then_code(a_type: &str, a_code: &str, b_type: &str, b_code: &str) -> std::cmp::Ordering {
    a_type
        .to_lowercase()
        .cmp(&b_type.to_lowercase())
        .then_with(|| a_code.to_lowercase().cmp(&b_code.to_lowercase()))
}

/// In-memory item ledger.
///
/// Intended for tests/dev. Not optimized for performance: every unit of work runs against a
/// draft copy of all tables under the write lock and replaces the live tables only when it
/// succeeds, so a failed operation leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unit_of_work<T>(&self, work: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut live = self
            .tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        let mut draft = live.clone();
        let out = work(&mut draft)?;
        *live = draft;
        Ok(out)
    }

    fn read<T>(&self, query: impl FnOnce(&Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        query(&tables)
    }

    /// Full movement history in append order.
    pub fn movements(&self) -> Result<Vec<Movement>, StoreError> {
        self.read(|t| Ok(t.movements.clone()))
    }

    pub fn memberships(&self) -> Result<Vec<Membership>, StoreError> {
        self.read(|t| Ok(t.memberships.values().cloned().collect()))
    }
}

#[async_trait::async_trait]
impl AreaDirectory for InMemoryLedgerStore {
    async fn create_area(&self, name: &str, parent: Option<AreaId>, actor: &Actor) -> Result<Area, StoreError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(DomainError::validation("area name cannot be empty").into());
        }
        let at = Utc::now();

        self.unit_of_work(|t| {
            if let Some(parent) = parent {
                t.require_area(parent)?;
            }
            let taken = t
                .areas
                .values()
                .any(|a| a.parent_id == parent && a.name.eq_ignore_ascii_case(&name));
            if taken {
                return Err(StoreError::ConstraintViolation(format!("area '{name}' already exists")));
            }

            let id = AreaId::new(next_id(&mut t.last_area_id));
            let area = Area {
                id,
                name: name.clone(),
                parent_id: parent,
            };
            t.areas.insert(id, area.clone());
            t.append_audit(NewAuditEntry::insert("area", id, snapshot(&area)?, actor, at));
            Ok(area)
        })
    }

    async fn area(&self, id: AreaId) -> Result<Option<Area>, StoreError> {
        self.read(|t| Ok(t.areas.get(&id).cloned()))
    }

    async fn areas(&self) -> Result<Vec<Area>, StoreError> {
        self.read(|t| {
            let mut areas: Vec<Area> = t.areas.values().cloned().collect();
            areas.sort_by(|a, b| {
                let parent = |area: &Area| area.parent_id.map(AreaId::get).unwrap_or(0);
                parent(a)
                    .cmp(&parent(b))
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                    .then(a.id.cmp(&b.id))
            });
            Ok(areas)
        })
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_item(&self, item: NewItem, actor: &Actor) -> Result<Item, StoreError> {
        let item = item.normalized()?;
        let at = Utc::now();

        self.unit_of_work(|t| {
            t.require_area(item.owning_area)?;
            if t.items.values().any(|i| i.code == item.code) {
                return Err(StoreError::ConstraintViolation(format!(
                    "item code '{}' already exists",
                    item.code
                )));
            }

            let id = ItemId::new(next_id(&mut t.last_item_id));
            let item = item.into_item(id, at);
            t.items.insert(id, item.clone());
            t.append_audit(NewAuditEntry::insert("item", id, snapshot(&item)?, actor, at));
            Ok(item)
        })
    }

    async fn execute(&self, command: LedgerCommand, actor: &Actor) -> Result<CommittedTransition, StoreError> {
        let at = Utc::now();
        self.unit_of_work(|t| t.transition(&command, actor, at))
    }

    async fn create_equipment(&self, equipment: NewEquipment, actor: &Actor) -> Result<CreatedEquipment, StoreError> {
        let request = equipment.normalized()?;
        let at = Utc::now();

        self.unit_of_work(|t| {
            t.require_area(request.area_id)?;
            if t.equipment.values().any(|e| e.code == request.code) {
                return Err(StoreError::ConstraintViolation(format!(
                    "equipment code '{}' already exists",
                    request.code
                )));
            }

            let id = EquipmentId::new(next_id(&mut t.last_equipment_id));
            let (equipment, members) = request.into_equipment(id, at);
            t.equipment.insert(id, equipment.clone());

            let mut assignments = Vec::with_capacity(members.len());
            for member in members {
                let item = t
                    .items
                    .get(&member.item_id)
                    .ok_or(LedgerError::ItemNotFound(member.item_id))?;
                ensure_member_candidate(&equipment, item)?;

                let command = LedgerCommand::Assign {
                    equipment_id: id,
                    item_id: member.item_id,
                    slot: member.slot,
                };
                assignments.push(t.transition(&command, actor, at)?);
            }

            let entry = NewAuditEntry::insert("equipment", id, equipment_snapshot(&equipment)?, actor, at)
                .with_extra(json!({ "members": assignments.len() }));
            t.append_audit(entry);

            Ok(CreatedEquipment {
                equipment,
                assignments,
            })
        })
    }

    async fn update_equipment(
        &self,
        id: EquipmentId,
        update: EquipmentUpdate,
        actor: &Actor,
    ) -> Result<Equipment, StoreError> {
        let at = Utc::now();

        self.unit_of_work(|t| {
            let equipment = t
                .equipment
                .get_mut(&id)
                .ok_or(LedgerError::EquipmentNotFound(id))?;
            let before = equipment_snapshot(equipment)?;
            update.apply_to(equipment, at)?;
            let updated = equipment.clone();

            let after = equipment_snapshot(&updated)?;
            t.append_audit(NewAuditEntry::update("equipment", id, before, after, actor, at));
            Ok(updated)
        })
    }
}

#[async_trait::async_trait]
impl LedgerQuery for InMemoryLedgerStore {
    async fn active_loan(&self, item_id: ItemId) -> Result<Option<ActiveLoan>, StoreError> {
        self.read(|t| Ok(active_loan(item_id, &t.movements)))
    }

    async fn area_items(
        &self,
        area_id: AreaId,
        filter: AreaItemFilter,
        page: PageRequest,
    ) -> Result<Page<AreaItemRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        self.read(|t| {
            let loans = t.active_loans();
            let mut rows = Vec::new();

            for item in t.items.values().filter(|i| filter.matches(i)) {
                let terms = loans.get(&item.id).map(ActiveLoan::terms);
                let membership = t.memberships.get(&item.id);
                let Some(view_status) =
                    area_view_status(area_id, item.owning_area, membership.is_some(), terms.as_ref())
                else {
                    continue;
                };

                let counterpart = match view_status {
                    AreaViewStatus::LoanedOut => terms.map(|l| l.destination_area),
                    AreaViewStatus::OnLoanReceived => Some(item.owning_area),
                    _ => None,
                };

                rows.push(AreaItemRow {
                    item_id: item.id,
                    code: item.code.clone(),
                    class: item.class,
                    item_type: item.item_type.clone(),
                    status: item.status,
                    view_status,
                    created_at: item.created_at,
                    equipment: membership.and_then(|m| t.equipment_summary(m.equipment_id)),
                    counterpart: counterpart.and_then(|id| t.area_ref(id)),
                    can_return: view_status.can_return(),
                });
            }

            rows.sort_by(|a, b| {
                by_type_then_code(&a.item_type, &a.code, &b.item_type, &b.code).then(a.item_id.cmp(&b.item_id))
            });
            Ok(Page::from_rows(rows, page))
        })
    }

    async fn area_equipment(
        &self,
        area_id: AreaId,
        filter: AreaEquipmentFilter,
        page: PageRequest,
    ) -> Result<Page<AreaEquipmentRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        self.read(|t| {
            let mut rows: Vec<AreaEquipmentRow> = t
                .equipment
                .values()
                .filter(|e| e.area_id == area_id && filter.matches(e))
                .map(|e| AreaEquipmentRow {
                    id: e.id,
                    code: e.code.clone(),
                    name: e.name.clone(),
                    end_user: e.end_user.clone(),
                    member_count: t.memberships.values().filter(|m| m.equipment_id == e.id).count() as u64,
                    created_at: e.created_at,
                    updated_at: e.updated_at,
                })
                .collect();
            rows.sort_by(|a, b| a.code.to_lowercase().cmp(&b.code.to_lowercase()).then(a.id.cmp(&b.id)));
            Ok(Page::from_rows(rows, page))
        })
    }

    async fn ledger_entries(&self, filter: LedgerFilter, page: PageRequest) -> Result<Page<LedgerRow>, StoreError> {
        let page = page.clamped(LEDGER_MAX_SIZE);
        let needle = filter.text_needle();

        self.read(|t| {
            let mut rows = Vec::new();

            if filter.source.includes_movements() {
                for movement in &t.movements {
                    let selected = filter.kind.is_none_or(|k| k == movement.kind)
                        && filter.in_date_range(movement.occurred_at)
                        && filter.item_id.is_none_or(|id| id == movement.item_id)
                        && filter.equipment_id.is_none_or(|id| Some(id) == movement.equipment_id)
                        && filter
                            .area_id
                            .is_none_or(|id| id == movement.origin_area || id == movement.destination_area);
                    if !selected {
                        continue;
                    }
                    let row = t.movement_row(movement);
                    if needle.as_deref().is_none_or(|n| movement_matches_text(&row, n)) {
                        rows.push(row);
                    }
                }
            }

            if filter.source.includes_audit() {
                for entry in t.audit.iter().filter(|a| filter.in_date_range(a.occurred_at)) {
                    let row = audit_row(entry);
                    if needle.as_deref().is_none_or(|n| audit_matches_text(&row, n)) {
                        rows.push(row);
                    }
                }
            }

            rows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then(b.id.cmp(&a.id)));
            Ok(Page::from_rows(rows, page))
        })
    }

    async fn item_detail(&self, item_id: ItemId) -> Result<ItemDetail, StoreError> {
        self.read(|t| {
            let item = t.items.get(&item_id).ok_or(LedgerError::ItemNotFound(item_id))?.clone();
            let membership = t.memberships.get(&item_id).and_then(|m| {
                let equipment = t.equipment.get(&m.equipment_id)?;
                Some(MembershipDetail {
                    equipment: EquipmentSummary {
                        id: equipment.id,
                        code: equipment.code.clone(),
                        name: equipment.name.clone(),
                    },
                    area_id: equipment.area_id,
                    slot: m.slot.clone(),
                    assigned_at: m.assigned_at,
                })
            });
            let loan = active_loan(item_id, &t.movements);
            Ok(ItemDetail { item, membership, loan })
        })
    }

    async fn equipment_detail(&self, id: EquipmentId) -> Result<EquipmentDetail, StoreError> {
        self.read(|t| {
            let equipment = t.equipment.get(&id).ok_or(LedgerError::EquipmentNotFound(id))?.clone();
            let mut members: Vec<EquipmentMember> = t
                .memberships
                .values()
                .filter(|m| m.equipment_id == id)
                .filter_map(|m| {
                    let item = t.items.get(&m.item_id)?;
                    Some(EquipmentMember {
                        item_id: item.id,
                        code: item.code.clone(),
                        class: item.class,
                        item_type: item.item_type.clone(),
                        status: item.status,
                        slot: m.slot.clone(),
                    })
                })
                .collect();
            members.sort_by(|a, b| {
                a.class
                    .sort_rank()
                    .cmp(&b.class.sort_rank())
                    .then_with(|| by_type_then_code(&a.item_type, &a.code, &b.item_type, &b.code))
            });
            Ok(EquipmentDetail { equipment, members })
        })
    }

    async fn area_loans(
        &self,
        area_id: AreaId,
        active_only: bool,
        page: PageRequest,
    ) -> Result<Page<AreaLoanRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        self.read(|t| {
            let mut rows = Vec::new();
            let opened = t.movements.iter().filter(|m| {
                m.is_transfer()
                    && m.loan_phase == Some(LoanPhase::Opened)
                    && (m.origin_area == area_id || m.destination_area == area_id)
            });

            for loan in opened {
                let returned_at = t
                    .movements
                    .iter()
                    .filter(|m| {
                        m.item_id == loan.item_id
                            && m.id > loan.id
                            && m.is_transfer()
                            && m.loan_phase == Some(LoanPhase::Closed)
                    })
                    .min_by_key(|m| m.id)
                    .map(|m| m.occurred_at);
                if active_only && returned_at.is_some() {
                    continue;
                }

                let (Some(item), Some(origin), Some(destination)) = (
                    t.items.get(&loan.item_id),
                    t.area_ref(loan.origin_area),
                    t.area_ref(loan.destination_area),
                ) else {
                    continue;
                };
                rows.push(AreaLoanRow {
                    movement_id: loan.id,
                    item_id: item.id,
                    item_code: item.code.clone(),
                    item_type: item.item_type.clone(),
                    origin,
                    destination,
                    since: loan.occurred_at,
                    returned_at,
                });
            }

            rows.sort_by(|a, b| b.since.cmp(&a.since).then(b.movement_id.cmp(&a.movement_id)));
            Ok(Page::from_rows(rows, page))
        })
    }

    async fn available_items(
        &self,
        area_id: AreaId,
        filter: AvailableItemFilter,
        page: PageRequest,
    ) -> Result<Page<Item>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        self.read(|t| {
            let mut items: Vec<Item> = t
                .items
                .values()
                .filter(|i| i.owning_area == area_id && filter.matches(i))
                .cloned()
                .collect();
            items.sort_by(|a, b| by_type_then_code(&a.item_type, &a.code, &b.item_type, &b.code).then(a.id.cmp(&b.id)));
            Ok(Page::from_rows(items, page))
        })
    }

    async fn suggest_item_code(&self, class: ItemClass, item_type: &str, area_id: AreaId) -> Result<String, StoreError> {
        let item_type = item_type.trim();
        if item_type.is_empty() {
            return Err(DomainError::validation("item type cannot be empty").into());
        }

        self.read(|t| {
            let codes = t
                .items
                .values()
                .filter(|i| i.owning_area == area_id && i.class == class && i.item_type.eq_ignore_ascii_case(item_type))
                .map(|i| i.code.as_str());
            Ok(suggest_next_code(item_type, codes, ITEM_CODE_PAD))
        })
    }

    async fn suggest_equipment_code(&self, area_id: AreaId, prefix: Option<&str>) -> Result<String, StoreError> {
        let prefix = prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_EQUIPMENT_PREFIX);

        self.read(|t| {
            let codes = t
                .equipment
                .values()
                .filter(|e| e.area_id == area_id)
                .map(|e| e.code.as_str());
            Ok(suggest_next_code(prefix, codes, EQUIPMENT_CODE_PAD))
        })
    }
}
