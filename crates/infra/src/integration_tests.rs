//! Integration tests for the full ledger pipeline.
//!
//! Tests: Operation → LedgerStore (in-memory) → EventBus → area views / ledger listing
//!
//! Verifies:
//! - Transitions write exactly one movement each and keep the status cache in sync
//! - Rejected transitions leave no trace
//! - Both sides of a loan see the item
//! - Committed transitions are published after commit

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use inventrack_core::{Actor, AreaId, EquipmentId, ItemId};
    use inventrack_events::{EventBus, InMemoryEventBus, Subscription};
    use inventrack_inventory::{
        AreaViewStatus, EquipmentUpdate, Item, ItemClass, ItemEvent, ItemStatus, LedgerCommand, LedgerError,
        LoanPhase, MovementKind, NewEquipment, NewItem, NewMember,
    };

    use crate::ledger_service::{ItemEnvelope, LedgerService};
    use crate::ledger_store::{
        AreaDirectory, AreaEquipmentFilter, AreaItemFilter, AvailableItemFilter, InMemoryLedgerStore,
        LedgerFilter, LedgerQuery, LedgerSource, PageRequest, StoreError,
    };

    type Service = LedgerService<Arc<InMemoryLedgerStore>, Arc<InMemoryEventBus<ItemEnvelope>>>;

    struct Fixture {
        service: Service,
        store: Arc<InMemoryLedgerStore>,
        events: Subscription<ItemEnvelope>,
        soporte: AreaId,
        ventas: AreaId,
        actor: Actor,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let bus: Arc<InMemoryEventBus<ItemEnvelope>> = Arc::new(InMemoryEventBus::new());
        // Subscribe before anything is published.
        let events = bus.subscribe();
        let actor = Actor::new("jperez").unwrap();

        let soporte = store.create_area("Soporte", None, &actor).await.unwrap().id;
        let ventas = store.create_area("Ventas", None, &actor).await.unwrap().id;

        Fixture {
            service: LedgerService::new(store.clone(), bus),
            store,
            events,
            soporte,
            ventas,
            actor,
        }
    }

    impl Fixture {
        async fn item(&self, code: &str, area: AreaId) -> Item {
            self.service
                .create_item(
                    NewItem {
                        code: code.to_string(),
                        class: ItemClass::Component,
                        item_type: "Disk".to_string(),
                        owning_area: area,
                    },
                    &self.actor,
                )
                .await
                .unwrap()
        }

        async fn equipment(&self, code: &str, area: AreaId) -> EquipmentId {
            self.service
                .create_equipment(
                    NewEquipment {
                        code: code.to_string(),
                        name: format!("Workstation {code}"),
                        area_id: area,
                        end_user: None,
                        login: None,
                        password: None,
                        members: vec![],
                    },
                    &self.actor,
                )
                .await
                .unwrap()
                .equipment
                .id
        }

        async fn status(&self, item_id: ItemId) -> ItemStatus {
            self.store.item_detail(item_id).await.unwrap().item.status
        }

        async fn view(&self, area: AreaId) -> Vec<(String, AreaViewStatus)> {
            self.store
                .area_items(area, AreaItemFilter::default(), PageRequest::default())
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|row| (row.code, row.view_status))
                .collect()
        }

        fn movement_count(&self) -> usize {
            self.store.movements().unwrap().len()
        }
    }

    #[tokio::test]
    async fn loan_lifecycle_end_to_end() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        assert_eq!(x1.status, ItemStatus::InStorage);
        let pc = fx.equipment("PC-001", fx.soporte).await;

        let status = fx.service.assign(pc, x1.id, Some("SATA0".to_string()), &fx.actor).await.unwrap();
        assert_eq!(status, ItemStatus::InUse);

        fx.service
            .loan(x1.id, fx.ventas, Some(json!({ "ticket": 7 })), &fx.actor)
            .await
            .unwrap();
        assert_eq!(fx.status(x1.id).await, ItemStatus::OnLoan);
        assert_eq!(fx.view(fx.soporte).await, vec![("X1".to_string(), AreaViewStatus::LoanedOut)]);
        assert_eq!(fx.view(fx.ventas).await, vec![("X1".to_string(), AreaViewStatus::OnLoanReceived)]);

        fx.service.unassign(pc, x1.id, &fx.actor).await.unwrap();
        assert_eq!(fx.status(x1.id).await, ItemStatus::OnLoan);
        assert!(fx.store.active_loan(x1.id).await.unwrap().is_some());

        fx.service.return_item(x1.id, None, &fx.actor).await.unwrap();
        assert_eq!(fx.status(x1.id).await, ItemStatus::InStorage);
        assert_eq!(fx.store.active_loan(x1.id).await.unwrap(), None);
        assert_eq!(fx.view(fx.soporte).await, vec![("X1".to_string(), AreaViewStatus::InStorage)]);
        assert!(fx.view(fx.ventas).await.is_empty());

        let history: Vec<_> = fx
            .store
            .movements()
            .unwrap()
            .into_iter()
            .filter(|m| m.item_id == x1.id)
            .map(|m| (m.kind, m.loan_phase, m.origin_area, m.destination_area))
            .collect();
        assert_eq!(
            history,
            vec![
                (MovementKind::Assignment, None, fx.soporte, fx.soporte),
                (MovementKind::Transfer, Some(LoanPhase::Opened), fx.soporte, fx.ventas),
                (MovementKind::Withdrawal, None, fx.soporte, fx.soporte),
                (MovementKind::Transfer, Some(LoanPhase::Closed), fx.ventas, fx.soporte),
            ]
        );
    }

    #[tokio::test]
    async fn owner_side_row_offers_return_and_names_the_borrower() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();

        let owner = fx
            .store
            .area_items(fx.soporte, AreaItemFilter::default(), PageRequest::default())
            .await
            .unwrap();
        let row = &owner.items[0];
        assert!(row.can_return);
        assert_eq!(row.counterpart.as_ref().map(|a| a.name.as_str()), Some("Ventas"));

        let borrower = fx
            .store
            .area_items(fx.ventas, AreaItemFilter::default(), PageRequest::default())
            .await
            .unwrap();
        let row = &borrower.items[0];
        assert!(!row.can_return);
        assert_eq!(row.counterpart.as_ref().map(|a| a.name.as_str()), Some("Soporte"));
    }

    #[tokio::test]
    async fn member_of_borrower_equipment_is_in_use_on_loan() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let borrower_pc = fx.equipment("PC-001", fx.ventas).await;

        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        let status = fx.service.assign(borrower_pc, x1.id, None, &fx.actor).await.unwrap();
        assert_eq!(status, ItemStatus::InUseOnLoan);

        // Returning releases the borrower's equipment as well.
        fx.service.return_item(x1.id, None, &fx.actor).await.unwrap();
        assert!(fx.store.memberships().unwrap().is_empty());
        let closing = fx.store.movements().unwrap().pop().unwrap();
        assert_eq!(closing.loan_phase, Some(LoanPhase::Closed));
        assert_eq!(closing.equipment_id, Some(borrower_pc));
    }

    #[tokio::test]
    async fn reassigning_to_same_equipment_keeps_one_membership() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let pc = fx.equipment("PC-001", fx.soporte).await;

        fx.service.assign(pc, x1.id, Some("SATA0".to_string()), &fx.actor).await.unwrap();
        fx.service.assign(pc, x1.id, Some("SATA1".to_string()), &fx.actor).await.unwrap();

        let memberships = fx.store.memberships().unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].slot.as_deref(), Some("SATA1"));
        assert_eq!(fx.movement_count(), 2);
    }

    #[tokio::test]
    async fn assigning_elsewhere_moves_the_item() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let first = fx.equipment("PC-001", fx.soporte).await;
        let second = fx.equipment("PC-002", fx.soporte).await;

        fx.service.assign(first, x1.id, None, &fx.actor).await.unwrap();
        let committed = fx
            .service
            .execute(
                LedgerCommand::Assign {
                    equipment_id: second,
                    item_id: x1.id,
                    slot: None,
                },
                &fx.actor,
            )
            .await
            .unwrap();

        match &committed.events[0] {
            ItemEvent::Assigned(e) => assert_eq!(e.previous_equipment_id, Some(first)),
            other => panic!("unexpected event {other:?}"),
        }
        let memberships = fx.store.memberships().unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].equipment_id, second);
    }

    #[tokio::test]
    async fn rejected_transitions_write_nothing() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let pc = fx.equipment("PC-001", fx.soporte).await;

        let err = fx.service.unassign(pc, x1.id, &fx.actor).await.unwrap_err();
        assert!(matches!(err.ledger(), Some(LedgerError::MembershipNotFound { .. })));

        let err = fx.service.loan(x1.id, fx.soporte, None, &fx.actor).await.unwrap_err();
        assert!(matches!(err.ledger(), Some(LedgerError::InvalidDestination { .. })));

        let err = fx.service.loan(x1.id, AreaId::new(999), None, &fx.actor).await.unwrap_err();
        assert!(matches!(err.ledger(), Some(LedgerError::InvalidDestination { .. })));

        let err = fx.service.return_item(x1.id, None, &fx.actor).await.unwrap_err();
        assert_eq!(err.ledger(), Some(&LedgerError::NoActiveLoan(x1.id)));

        let err = fx
            .service
            .assign(EquipmentId::new(999), x1.id, None, &fx.actor)
            .await
            .unwrap_err();
        assert_eq!(err.ledger(), Some(&LedgerError::EquipmentNotFound(EquipmentId::new(999))));

        assert_eq!(fx.movement_count(), 0);
        assert_eq!(fx.status(x1.id).await, ItemStatus::InStorage);
        assert!(fx.events.drain().is_empty());
    }

    #[tokio::test]
    async fn second_loan_is_rejected_while_one_is_active() {
        let fx = setup().await;
        let almacen = fx.store.create_area("Almacen", None, &fx.actor).await.unwrap().id;
        let x1 = fx.item("X1", fx.soporte).await;

        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        let err = fx.service.loan(x1.id, almacen, None, &fx.actor).await.unwrap_err();

        assert_eq!(
            err.ledger(),
            Some(&LedgerError::LoanAlreadyActive {
                item_id: x1.id,
                destination: fx.ventas,
            })
        );
        assert_eq!(fx.movement_count(), 1);
    }

    #[tokio::test]
    async fn equipment_creation_assigns_members_or_rolls_back() {
        let fx = setup().await;
        let disk = fx.item("DISK01", fx.soporte).await;
        let foreign = fx.item("DISK02", fx.ventas).await;

        let err = fx
            .service
            .create_equipment(
                NewEquipment {
                    code: "PC-001".to_string(),
                    name: "Front desk".to_string(),
                    area_id: fx.soporte,
                    end_user: Some("Ana".to_string()),
                    login: None,
                    password: None,
                    members: vec![
                        NewMember {
                            item_id: disk.id,
                            slot: Some("SATA0".to_string()),
                        },
                        NewMember {
                            item_id: foreign.id,
                            slot: None,
                        },
                    ],
                },
                &fx.actor,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.ledger(), Some(LedgerError::ItemNotAvailable { .. })));
        assert_eq!(fx.movement_count(), 0);
        assert_eq!(fx.status(disk.id).await, ItemStatus::InStorage);

        let created = fx
            .service
            .create_equipment(
                NewEquipment {
                    code: "PC-001".to_string(),
                    name: "Front desk".to_string(),
                    area_id: fx.soporte,
                    end_user: Some("Ana".to_string()),
                    login: None,
                    password: None,
                    members: vec![NewMember {
                        item_id: disk.id,
                        slot: Some("SATA0".to_string()),
                    }],
                },
                &fx.actor,
            )
            .await
            .unwrap();
        assert_eq!(created.assignments.len(), 1);
        assert_eq!(fx.status(disk.id).await, ItemStatus::InUse);

        let detail = fx.store.equipment_detail(created.equipment.id).await.unwrap();
        assert_eq!(detail.members.len(), 1);
        assert_eq!(detail.members[0].slot.as_deref(), Some("SATA0"));

        let published = fx.events.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "inventory.item.assigned");
    }

    #[tokio::test]
    async fn committed_transitions_are_published_in_order() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let pc = fx.equipment("PC-001", fx.soporte).await;

        fx.service.assign(pc, x1.id, None, &fx.actor).await.unwrap();
        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        fx.service.return_item(x1.id, None, &fx.actor).await.unwrap();

        let published = fx.events.drain();
        let types: Vec<_> = published.iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(
            types,
            vec![
                "inventory.item.assigned",
                "inventory.item.loan_opened",
                "inventory.item.loan_closed",
            ]
        );

        let movement_ids: Vec<_> = fx.store.movements().unwrap().iter().map(|m| m.id).collect();
        let published_ids: Vec<_> = published.iter().map(|e| e.movement_id()).collect();
        assert_eq!(published_ids, movement_ids);
        assert!(published.iter().all(|e| e.item_id() == x1.id && e.actor() == &fx.actor));
    }

    #[tokio::test]
    async fn ledger_listing_mixes_movements_and_audit() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        fx.service
            .loan(x1.id, fx.ventas, Some(json!({ "ticket": "HD-4411" })), &fx.actor)
            .await
            .unwrap();

        let movements = fx
            .store
            .ledger_entries(LedgerFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(movements.total, 1);
        assert!(!movements.items[0].is_audit);
        assert_eq!(movements.items[0].reason.as_deref(), Some("loan"));

        let audit = fx
            .store
            .ledger_entries(
                LedgerFilter {
                    source: LedgerSource::Audit,
                    ..LedgerFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        // two areas + one item
        assert_eq!(audit.total, 3);
        assert!(audit.items.iter().all(|row| row.is_audit && row.kind == "INSERT"));

        let mixed = fx
            .store
            .ledger_entries(
                LedgerFilter {
                    source: LedgerSource::Mixed,
                    ..LedgerFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(mixed.total, 4);
        assert!(
            mixed
                .items
                .windows(2)
                .all(|w| w[0].occurred_at >= w[1].occurred_at)
        );

        let by_text = fx
            .store
            .ledger_entries(
                LedgerFilter {
                    text: Some("hd-4411".to_string()),
                    ..LedgerFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_text.total, 1);
    }

    #[tokio::test]
    async fn area_view_filters_and_pages() {
        let fx = setup().await;
        for code in ["DISK03", "DISK01", "DISK02"] {
            fx.item(code, fx.soporte).await;
        }
        fx.service
            .create_item(
                NewItem {
                    code: "KB01".to_string(),
                    class: ItemClass::Peripheral,
                    item_type: "Keyboard".to_string(),
                    owning_area: fx.soporte,
                },
                &fx.actor,
            )
            .await
            .unwrap();

        let page = fx
            .store
            .area_items(
                fx.soporte,
                AreaItemFilter {
                    class: Some(ItemClass::Component),
                    ..AreaItemFilter::default()
                },
                PageRequest::new(Some(1), Some(2)),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert!(page.has_more());
        let codes: Vec<_> = page.items.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["DISK01", "DISK02"]);

        let unknown = fx
            .store
            .area_items(AreaId::new(999), AreaItemFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(unknown.total, 0);
    }

    #[tokio::test]
    async fn code_suggestions_follow_existing_codes() {
        let fx = setup().await;
        fx.item("DISK01", fx.soporte).await;
        fx.item("DISK07", fx.soporte).await;
        fx.equipment("PC-009", fx.soporte).await;

        let next_item = fx
            .store
            .suggest_item_code(ItemClass::Component, "disk", fx.soporte)
            .await
            .unwrap();
        assert_eq!(next_item, "DISK08");
        assert_eq!(fx.store.suggest_equipment_code(fx.soporte, None).await.unwrap(), "PC-010");
        assert_eq!(fx.store.suggest_equipment_code(fx.ventas, None).await.unwrap(), "PC-001");
    }

    #[tokio::test]
    async fn store_errors_carry_their_kind() {
        let fx = setup().await;
        let err = fx.store.item_detail(ItemId::new(404)).await.unwrap_err();
        assert_eq!(err.kind(), inventrack_core::ErrorKind::NotFound);
        assert!(matches!(err, StoreError::Ledger(LedgerError::ItemNotFound(_))));
    }

    async fn run_x1_lifecycle(fx: &Fixture) -> ItemId {
        let x1 = fx.item("X1", fx.soporte).await;
        let pc = fx.equipment("PC-001", fx.soporte).await;
        fx.service.assign(pc, x1.id, None, &fx.actor).await.unwrap();
        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        fx.service.unassign(pc, x1.id, &fx.actor).await.unwrap();
        fx.service.return_item(x1.id, None, &fx.actor).await.unwrap();
        x1.id
    }

    async fn movement_kinds(fx: &Fixture, filter: LedgerFilter) -> Vec<String> {
        fx.store
            .ledger_entries(filter, PageRequest::default())
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|row| row.kind)
            .collect()
    }

    #[tokio::test]
    async fn item_history_lists_its_four_movements_newest_first() {
        let fx = setup().await;
        let x1 = run_x1_lifecycle(&fx).await;
        fx.item("X2", fx.soporte).await;

        let kinds = movement_kinds(
            &fx,
            LedgerFilter {
                item_id: Some(x1),
                ..LedgerFilter::default()
            },
        )
        .await;
        assert_eq!(kinds, vec!["TRANSFER", "WITHDRAWAL", "TRANSFER", "ASSIGNMENT"]);
    }

    #[tokio::test]
    async fn ledger_filters_by_kind_day_and_area() {
        let fx = setup().await;
        run_x1_lifecycle(&fx).await;
        let day = fx.store.movements().unwrap()[0].occurred_at.date_naive();

        let transfers = movement_kinds(
            &fx,
            LedgerFilter {
                kind: Some(MovementKind::Transfer),
                ..LedgerFilter::default()
            },
        )
        .await;
        assert_eq!(transfers, vec!["TRANSFER", "TRANSFER"]);

        let same_day = movement_kinds(
            &fx,
            LedgerFilter {
                from: Some(day),
                to: Some(day),
                ..LedgerFilter::default()
            },
        )
        .await;
        assert_eq!(same_day.len(), 4);

        let next_day = movement_kinds(
            &fx,
            LedgerFilter {
                from: day.succ_opt(),
                ..LedgerFilter::default()
            },
        )
        .await;
        assert!(next_day.is_empty());

        // Ventas only appears on the loan legs.
        let ventas = movement_kinds(
            &fx,
            LedgerFilter {
                area_id: Some(fx.ventas),
                ..LedgerFilter::default()
            },
        )
        .await;
        assert_eq!(ventas, vec!["TRANSFER", "TRANSFER"]);
    }

    #[tokio::test]
    async fn loan_of_member_of_borrower_equipment_is_on_loan() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let borrower_pc = fx.equipment("PC-001", fx.ventas).await;

        let status = fx.service.assign(borrower_pc, x1.id, None, &fx.actor).await.unwrap();
        assert_eq!(status, ItemStatus::InUse);

        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        assert_eq!(fx.status(x1.id).await, ItemStatus::OnLoan);
        let detail = fx.store.item_detail(x1.id).await.unwrap();
        assert_eq!(detail.membership.map(|m| m.equipment.id), Some(borrower_pc));
    }

    #[tokio::test]
    async fn assigning_a_lent_item_outside_the_borrower_is_plain_use() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let owner_pc = fx.equipment("PC-001", fx.soporte).await;

        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        let status = fx.service.assign(owner_pc, x1.id, None, &fx.actor).await.unwrap();

        assert_eq!(status, ItemStatus::InUse);
        assert!(fx.store.active_loan(x1.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn area_loans_separate_active_from_returned() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        let x2 = fx.item("X2", fx.soporte).await;
        fx.service.loan(x1.id, fx.ventas, None, &fx.actor).await.unwrap();
        fx.service.return_item(x1.id, None, &fx.actor).await.unwrap();

        let active = fx.store.area_loans(fx.ventas, true, PageRequest::default()).await.unwrap();
        assert_eq!(active.total, 0);

        let all = fx.store.area_loans(fx.ventas, false, PageRequest::default()).await.unwrap();
        assert_eq!(all.total, 1);
        assert_eq!(all.items[0].item_id, x1.id);
        assert!(!all.items[0].is_active());
        assert_eq!(all.items[0].origin.id, fx.soporte);

        fx.service.loan(x2.id, fx.ventas, None, &fx.actor).await.unwrap();
        let owner_side = fx.store.area_loans(fx.soporte, true, PageRequest::default()).await.unwrap();
        assert_eq!(owner_side.items.len(), 1);
        assert_eq!(owner_side.items[0].item_id, x2.id);
        assert!(owner_side.items[0].is_active());
    }

    #[tokio::test]
    async fn available_items_are_stored_items_of_the_class() {
        let fx = setup().await;
        let stored = fx.item("DISK01", fx.soporte).await;
        let in_use = fx.item("DISK02", fx.soporte).await;
        let lent = fx.item("DISK03", fx.soporte).await;
        fx.item("DISK04", fx.ventas).await;
        fx.service
            .create_item(
                NewItem {
                    code: "KB01".to_string(),
                    class: ItemClass::Peripheral,
                    item_type: "Keyboard".to_string(),
                    owning_area: fx.soporte,
                },
                &fx.actor,
            )
            .await
            .unwrap();
        let pc = fx.equipment("PC-001", fx.soporte).await;
        fx.service.assign(pc, in_use.id, None, &fx.actor).await.unwrap();
        fx.service.loan(lent.id, fx.ventas, None, &fx.actor).await.unwrap();

        let page = fx
            .store
            .available_items(
                fx.soporte,
                AvailableItemFilter {
                    class: ItemClass::Component,
                    item_type: None,
                    text: None,
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![stored.id]);
    }

    #[tokio::test]
    async fn area_view_filters_by_item_status() {
        let fx = setup().await;
        fx.item("DISK01", fx.soporte).await;
        let in_use = fx.item("DISK02", fx.soporte).await;
        let lent = fx.item("DISK03", fx.soporte).await;
        let pc = fx.equipment("PC-001", fx.soporte).await;
        fx.service.assign(pc, in_use.id, None, &fx.actor).await.unwrap();
        fx.service.loan(lent.id, fx.ventas, None, &fx.actor).await.unwrap();

        let codes = |page: crate::ledger_store::Page<crate::ledger_store::AreaItemRow>| {
            page.items.into_iter().map(|r| r.code).collect::<Vec<_>>()
        };
        let by_status = |status| AreaItemFilter {
            status: Some(status),
            ..AreaItemFilter::default()
        };

        let page = fx
            .store
            .area_items(fx.soporte, by_status(ItemStatus::InUse), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(codes(page), vec!["DISK02"]);

        let page = fx
            .store
            .area_items(fx.ventas, by_status(ItemStatus::OnLoan), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(codes(page), vec!["DISK03"]);

        let page = fx
            .store
            .area_items(fx.soporte, by_status(ItemStatus::InUseOnLoan), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn area_equipment_lists_units_with_member_counts() {
        let fx = setup().await;
        let disk = fx.item("DISK01", fx.soporte).await;
        fx.equipment("PC-010", fx.soporte).await;
        let small = fx.equipment("pc-002", fx.soporte).await;
        fx.equipment("PC-001", fx.ventas).await;
        fx.service.assign(small, disk.id, None, &fx.actor).await.unwrap();

        let page = fx
            .store
            .area_equipment(fx.soporte, AreaEquipmentFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        let rows: Vec<_> = page.items.iter().map(|r| (r.code.as_str(), r.member_count)).collect();
        assert_eq!(rows, vec![("pc-002", 1), ("PC-010", 0)]);

        let page = fx
            .store
            .area_equipment(
                fx.soporte,
                AreaEquipmentFilter {
                    text: Some("010".to_string()),
                    ..AreaEquipmentFilter::default()
                },
                PageRequest::new(Some(1), Some(10)),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].name, "Workstation PC-010");
    }

    #[tokio::test]
    async fn equipment_update_is_audited_with_masked_password() {
        let fx = setup().await;
        let created = fx
            .service
            .create_equipment(
                NewEquipment {
                    code: "PC-001".to_string(),
                    name: "Front desk".to_string(),
                    area_id: fx.soporte,
                    end_user: None,
                    login: Some("frontdesk".to_string()),
                    password: Some("old-pass".to_string()),
                    members: vec![],
                },
                &fx.actor,
            )
            .await
            .unwrap();

        let updated = fx
            .service
            .update_equipment(
                created.equipment.id,
                EquipmentUpdate {
                    end_user: Some("Ana".to_string()),
                    password: Some("new-pass".to_string()),
                    ..EquipmentUpdate::default()
                },
                &fx.actor,
            )
            .await
            .unwrap();
        assert_eq!(updated.end_user.as_deref(), Some("Ana"));

        let audit = fx
            .store
            .ledger_entries(
                LedgerFilter {
                    source: LedgerSource::Audit,
                    ..LedgerFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        let updates: Vec<_> = audit.items.iter().filter(|row| row.kind == "UPDATE").collect();
        assert_eq!(updates.len(), 1);

        let detail = &updates[0].detail;
        assert_eq!(detail["entity"], "equipment");
        assert_eq!(detail["before"]["end_user"], serde_json::Value::Null);
        assert_eq!(detail["after"]["end_user"], "Ana");
        assert_eq!(detail["before"]["password"], "***");
        assert_eq!(detail["after"]["password"], "***");
        let text = detail.to_string();
        assert!(!text.contains("old-pass") && !text.contains("new-pass"));
    }

    #[tokio::test]
    async fn refused_publication_is_reported_not_rolled_back() {
        let fx = setup().await;
        let x1 = fx.item("X1", fx.soporte).await;
        fx.service.bus().close();

        let committed = fx
            .service
            .execute(
                LedgerCommand::Loan {
                    item_id: x1.id,
                    destination_area_id: fx.ventas,
                    detail: None,
                },
                &fx.actor,
            )
            .await
            .unwrap();

        assert_eq!(committed.unpublished, 1);
        assert!(!committed.fully_published());
        assert_eq!(fx.status(x1.id).await, ItemStatus::OnLoan);
        assert_eq!(fx.movement_count(), 1);
    }

    #[tokio::test]
    async fn equipment_members_are_assigned_in_item_id_order() {
        let fx = setup().await;
        let first = fx.item("DISK01", fx.soporte).await;
        let second = fx.item("DISK02", fx.soporte).await;
        let third = fx.item("DISK03", fx.soporte).await;

        let created = fx
            .service
            .create_equipment(
                NewEquipment {
                    code: "PC-001".to_string(),
                    name: "Lab".to_string(),
                    area_id: fx.soporte,
                    end_user: None,
                    login: None,
                    password: None,
                    members: [&third, &first, &second]
                        .into_iter()
                        .map(|item| NewMember {
                            item_id: item.id,
                            slot: None,
                        })
                        .collect(),
                },
                &fx.actor,
            )
            .await
            .unwrap();

        let assigned: Vec<_> = created.assignments.iter().map(|a| a.item.id).collect();
        assert_eq!(assigned, vec![first.id, second.id, third.id]);
        assert!(created.assignments.iter().all(|a| a.fully_published()));
        let published: Vec<_> = fx.events.drain().iter().map(|e| e.item_id()).collect();
        assert_eq!(published, assigned);
    }
}
