//! Postgres-backed item ledger.
//!
//! Every write operation runs in one transaction. Item transitions read the item row
//! `FOR UPDATE` before deciding, so concurrent transitions of the same item serialize while
//! different items never contend. Any error returns before `commit`; dropping the transaction
//! rolls it back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `ConstraintViolation` |
//! | Database (foreign key violation) | `23503` | `ConstraintViolation` |
//! | Database (check constraint violation) | `23514` | `ConstraintViolation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};

use inventrack_core::{Actor, AreaId, AuditId, DomainError, EquipmentId, ItemId, MovementId};
use inventrack_inventory::{
    ActiveLoan, Area, AreaViewStatus, AuditEntry, CurrentMembership, Equipment, EquipmentUpdate, Item,
    ItemClass, ItemEvent, ItemState, ItemStatus, LedgerCommand, LedgerError, LoanPhase, MembershipChange,
    Movement, NewAuditEntry, NewEquipment, NewItem, NewMovement, ensure_member_candidate, suggest_next_code,
};

use crate::config::LedgerConfig;

use super::query::{
    AREA_VIEW_MAX_SIZE, AreaEquipmentFilter, AreaEquipmentRow, AreaItemFilter, AreaItemRow, AreaLoanRow,
    AreaRef, AvailableItemFilter, DEFAULT_EQUIPMENT_PREFIX, EQUIPMENT_CODE_PAD, EquipmentDetail,
    EquipmentMember, EquipmentSummary, ITEM_CODE_PAD, ItemDetail, LEDGER_MAX_SIZE, LedgerFilter,
    LedgerQuery, LedgerRow, MembershipDetail, Page, PageRequest,
};
use super::r#trait::{AreaDirectory, CommittedTransition, CreatedEquipment, LedgerStore, StoreError};
use super::{decide, equipment_snapshot, snapshot};

/// Postgres-backed item ledger store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    statement_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            statement_timeout,
        }
    }

    /// Open a pool as configured (`DATABASE_URL` is required here).
    pub async fn connect(config: &LedgerConfig) -> Result<Self, StoreError> {
        let url = config
            .require_database_url()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, config.statement_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start a transaction with the configured statement timeout.
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("statement_timeout", e))?;

        Ok(tx)
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

// Transaction steps

/// Load the aggregate for `item_id`, locking the item row.
async fn load_item_state(conn: &mut PgConnection, item_id: ItemId) -> Result<Option<ItemState>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, code, class, item_type, owning_area_id, status, created_at
        FROM items
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(item_id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_item", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let item = decode_item(&row)?;

    let membership = sqlx::query(
        r#"
        SELECT ei.equipment_id, e.area_id AS equipment_area_id, ei.slot
        FROM equipment_items ei
        JOIN equipment e ON e.id = ei.equipment_id
        WHERE ei.item_id = $1
        "#,
    )
    .bind(item_id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_membership", e))?
    .map(|row| -> Result<CurrentMembership, StoreError> {
        Ok(CurrentMembership {
            equipment_id: EquipmentId::new(col(&row, "equipment_id")?),
            equipment_area: AreaId::new(col(&row, "equipment_area_id")?),
            slot: col(&row, "slot")?,
        })
    })
    .transpose()?;

    let loan = fetch_active_loan(conn, item_id).await?.map(|l| l.terms());
    Ok(Some(ItemState::new(item, membership, loan)))
}

async fn fetch_active_loan(conn: &mut PgConnection, item_id: ItemId) -> Result<Option<ActiveLoan>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, item_id, kind, loan_phase, origin_area_id, destination_area_id,
               equipment_id, actor, reason, detail, occurred_at
        FROM movements
        WHERE item_id = $1 AND kind = 'TRANSFER'
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(item_id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("latest_transfer", e))?;

    match row {
        Some(row) => Ok(ActiveLoan::from_latest_transfer(&decode_movement(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_equipment(conn: &mut PgConnection, id: EquipmentId, lock: bool) -> Result<Option<Equipment>, StoreError> {
    let sql = if lock {
        "SELECT id, code, name, area_id, end_user, login, password, created_at, updated_at \
         FROM equipment WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT id, code, name, area_id, end_user, login, password, created_at, updated_at \
         FROM equipment WHERE id = $1"
    };

    sqlx::query(sql)
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_equipment", e))?
        .map(|row| decode_equipment(&row))
        .transpose()
}

async fn fetch_area(conn: &mut PgConnection, id: AreaId) -> Result<Option<Area>, StoreError> {
    sqlx::query("SELECT id, name, parent_id FROM areas WHERE id = $1")
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_area", e))?
        .map(|row| decode_area(&row))
        .transpose()
}

async fn change_membership(
    conn: &mut PgConnection,
    item_id: ItemId,
    change: MembershipChange,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    match change {
        MembershipChange::Keep => {}
        MembershipChange::Set { equipment_id, slot } => {
            sqlx::query("DELETE FROM equipment_items WHERE item_id = $1 AND equipment_id <> $2")
                .bind(item_id.get())
                .bind(equipment_id.get())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("detach_previous", e))?;

            sqlx::query(
                r#"
                INSERT INTO equipment_items (equipment_id, item_id, slot, assigned_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (equipment_id, item_id)
                DO UPDATE SET slot = EXCLUDED.slot
                "#,
            )
            .bind(equipment_id.get())
            .bind(item_id.get())
            .bind(slot.as_deref())
            .bind(at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("upsert_membership", e))?;
        }
        MembershipChange::Clear => {
            sqlx::query("DELETE FROM equipment_items WHERE item_id = $1")
                .bind(item_id.get())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("clear_membership", e))?;
        }
    }
    Ok(())
}

async fn insert_movement(conn: &mut PgConnection, movement: NewMovement) -> Result<Movement, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO movements (
            item_id,
            kind,
            loan_phase,
            origin_area_id,
            destination_area_id,
            equipment_id,
            actor,
            reason,
            detail,
            occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(movement.item_id.get())
    .bind(movement.kind.as_str())
    .bind(movement.loan_phase.map(LoanPhase::as_str))
    .bind(movement.origin_area.get())
    .bind(movement.destination_area.get())
    .bind(movement.equipment_id.map(EquipmentId::get))
    .bind(movement.actor.as_str())
    .bind(movement.reason.as_deref())
    .bind(&movement.detail)
    .bind(movement.occurred_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;

    let id = MovementId::new(col(&row, "id")?);
    Ok(movement.into_movement(id))
}

async fn insert_audit(conn: &mut PgConnection, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO audit_log (entity, entity_id, action, actor, before, after, extra, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(&entry.entity)
    .bind(entry.entity_id.as_deref())
    .bind(entry.action.as_str())
    .bind(entry.actor.as_str())
    .bind(&entry.before)
    .bind(&entry.after)
    .bind(&entry.extra)
    .bind(entry.occurred_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_audit", e))?;

    let id = AuditId::new(col(&row, "id")?);
    Ok(entry.into_entry(id))
}

/// Load, decide and persist one item transition inside an open transaction.
async fn transition(
    conn: &mut PgConnection,
    command: &LedgerCommand,
    actor: &Actor,
    at: DateTime<Utc>,
) -> Result<CommittedTransition, StoreError> {
    let state = load_item_state(conn, command.item_id()).await?;
    let equipment = match command.equipment_id() {
        Some(id) => fetch_equipment(conn, id, false).await?,
        None => None,
    };
    let destination = match command.destination_area_id() {
        Some(id) => fetch_area(conn, id).await?,
        None => None,
    };

    let (state, events) = decide(command, state, equipment.as_ref(), destination.as_ref(), at)?;
    let movements = persist_events(conn, &events, actor, at).await?;

    let item = state.item().clone();
    sqlx::query("UPDATE items SET status = $2 WHERE id = $1")
        .bind(item.id.get())
        .bind(item.status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_item_status", e))?;

    Ok(CommittedTransition {
        item,
        events,
        movements,
        unpublished: 0,
    })
}

async fn persist_events(
    conn: &mut PgConnection,
    events: &[ItemEvent],
    actor: &Actor,
    at: DateTime<Utc>,
) -> Result<Vec<Movement>, StoreError> {
    let mut movements = Vec::with_capacity(events.len());
    for event in events {
        change_membership(conn, event.item_id(), event.membership_change(), at).await?;
        movements.push(insert_movement(conn, event.to_movement(actor)).await?);
    }
    Ok(movements)
}

#[async_trait::async_trait]
impl AreaDirectory for PostgresLedgerStore {
    #[instrument(skip(self, actor), err)]
    async fn create_area(&self, name: &str, parent: Option<AreaId>, actor: &Actor) -> Result<Area, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("area name cannot be empty").into());
        }
        let at = Utc::now();
        let mut tx = self.begin().await?;

        if let Some(parent) = parent {
            if fetch_area(&mut tx, parent).await?.is_none() {
                return Err(LedgerError::AreaNotFound(parent).into());
            }
        }

        let row = sqlx::query("INSERT INTO areas (name, parent_id) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(parent.map(AreaId::get))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_area", e))?;

        let area = Area {
            id: AreaId::new(col(&row, "id")?),
            name: name.to_string(),
            parent_id: parent,
        };
        insert_audit(&mut tx, NewAuditEntry::insert("area", area.id, snapshot(&area)?, actor, at)).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(area)
    }

    async fn area(&self, id: AreaId) -> Result<Option<Area>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_area(&mut conn, id).await
    }

    async fn areas(&self) -> Result<Vec<Area>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, parent_id FROM areas ORDER BY COALESCE(parent_id, 0), lower(name), id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_areas", e))?;

        rows.iter().map(decode_area).collect()
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, item, actor), fields(code = %item.code, area_id = %item.owning_area), err)]
    async fn create_item(&self, item: NewItem, actor: &Actor) -> Result<Item, StoreError> {
        let item = item.normalized()?;
        let at = Utc::now();
        let mut tx = self.begin().await?;

        if fetch_area(&mut tx, item.owning_area).await?.is_none() {
            return Err(LedgerError::AreaNotFound(item.owning_area).into());
        }

        let row = sqlx::query(
            r#"
            INSERT INTO items (code, class, item_type, owning_area_id, status, created_at)
            VALUES ($1, $2, $3, $4, 'IN_STORAGE', $5)
            RETURNING id
            "#,
        )
        .bind(&item.code)
        .bind(item.class.as_str())
        .bind(&item.item_type)
        .bind(item.owning_area.get())
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;

        let item = item.into_item(ItemId::new(col(&row, "id")?), at);
        insert_audit(&mut tx, NewAuditEntry::insert("item", item.id, snapshot(&item)?, actor, at)).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(item_id = %item.id, "item registered");
        Ok(item)
    }

    #[instrument(
        skip(self, command, actor),
        fields(op = command.name(), item_id = %command.item_id(), actor = %actor, movements = tracing::field::Empty),
        err
    )]
    async fn execute(&self, command: LedgerCommand, actor: &Actor) -> Result<CommittedTransition, StoreError> {
        let at = Utc::now();
        let mut tx = self.begin().await?;

        let committed = transition(&mut tx, &command, actor, at).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("movements", committed.movements.len());
        info!(status = %committed.status(), "item transition committed");
        Ok(committed)
    }

    #[instrument(
        skip(self, equipment, actor),
        fields(code = %equipment.code, area_id = %equipment.area_id, members = equipment.members.len()),
        err
    )]
    async fn create_equipment(&self, equipment: NewEquipment, actor: &Actor) -> Result<CreatedEquipment, StoreError> {
        let request = equipment.normalized()?;
        let at = Utc::now();
        let mut tx = self.begin().await?;

        if fetch_area(&mut tx, request.area_id).await?.is_none() {
            return Err(LedgerError::AreaNotFound(request.area_id).into());
        }

        let row = sqlx::query(
            r#"
            INSERT INTO equipment (code, name, area_id, end_user, login, password, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(&request.code)
        .bind(&request.name)
        .bind(request.area_id.get())
        .bind(request.end_user.as_deref())
        .bind(request.login.as_deref())
        .bind(request.password.as_deref())
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_equipment", e))?;

        let id = EquipmentId::new(col(&row, "id")?);
        let (equipment, members) = request.into_equipment(id, at);

        let mut assignments = Vec::with_capacity(members.len());
        for member in members {
            let state = load_item_state(&mut tx, member.item_id)
                .await?
                .ok_or(LedgerError::ItemNotFound(member.item_id))?;
            ensure_member_candidate(&equipment, state.item())?;

            let command = LedgerCommand::Assign {
                equipment_id: id,
                item_id: member.item_id,
                slot: member.slot,
            };
            assignments.push(transition(&mut tx, &command, actor, at).await?);
        }

        let entry = NewAuditEntry::insert("equipment", id, equipment_snapshot(&equipment)?, actor, at)
            .with_extra(json!({ "members": assignments.len() }));
        insert_audit(&mut tx, entry).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(equipment_id = %id, "equipment created");
        Ok(CreatedEquipment {
            equipment,
            assignments,
        })
    }

    #[instrument(skip(self, update, actor), fields(equipment_id = %id), err)]
    async fn update_equipment(
        &self,
        id: EquipmentId,
        update: EquipmentUpdate,
        actor: &Actor,
    ) -> Result<Equipment, StoreError> {
        let at = Utc::now();
        let mut tx = self.begin().await?;

        let mut equipment = fetch_equipment(&mut tx, id, true)
            .await?
            .ok_or(LedgerError::EquipmentNotFound(id))?;
        let before = equipment_snapshot(&equipment)?;
        update.apply_to(&mut equipment, at)?;

        sqlx::query(
            r#"
            UPDATE equipment
            SET name = $2, end_user = $3, login = $4, password = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(&equipment.name)
        .bind(equipment.end_user.as_deref())
        .bind(equipment.login.as_deref())
        .bind(equipment.password.as_deref())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_equipment", e))?;

        let after = equipment_snapshot(&equipment)?;
        insert_audit(&mut tx, NewAuditEntry::update("equipment", id, before, after, actor, at)).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(equipment)
    }
}

#[async_trait::async_trait]
impl LedgerQuery for PostgresLedgerStore {
    async fn active_loan(&self, item_id: ItemId) -> Result<Option<ActiveLoan>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_active_loan(&mut conn, item_id).await
    }

    #[instrument(skip(self, filter), fields(area_id = %area_id), err)]
    async fn area_items(
        &self,
        area_id: AreaId,
        filter: AreaItemFilter,
        page: PageRequest,
    ) -> Result<Page<AreaItemRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        let rows = sqlx::query(
            r#"
            WITH latest_transfer AS (
                SELECT DISTINCT ON (m.item_id)
                    m.item_id, m.loan_phase, m.origin_area_id, m.destination_area_id
                FROM movements m
                WHERE m.kind = 'TRANSFER'
                ORDER BY m.item_id, m.id DESC
            ),
            active_loan AS (
                SELECT item_id, origin_area_id, destination_area_id
                FROM latest_transfer
                WHERE loan_phase = 'OPENED'
            ),
            visible AS (
                SELECT
                    i.*,
                    CASE
                        WHEN l.item_id IS NOT NULL THEN 'LOANED_OUT'
                        WHEN ei.item_id IS NOT NULL THEN 'IN_USE'
                        ELSE 'IN_STORAGE'
                    END AS view_status,
                    l.destination_area_id AS counterpart_id
                FROM items i
                LEFT JOIN active_loan l ON l.item_id = i.id
                LEFT JOIN equipment_items ei ON ei.item_id = i.id
                WHERE i.owning_area_id = $1
                UNION ALL
                SELECT
                    i.*,
                    'ON_LOAN_RECEIVED' AS view_status,
                    i.owning_area_id AS counterpart_id
                FROM items i
                JOIN active_loan l ON l.item_id = i.id
                WHERE l.destination_area_id = $1 AND i.owning_area_id <> $1
            )
            SELECT
                v.id,
                v.code,
                v.class,
                v.item_type,
                v.owning_area_id,
                v.status,
                v.created_at,
                v.view_status,
                e.id AS equipment_id,
                e.code AS equipment_code,
                e.name AS equipment_name,
                v.counterpart_id,
                ca.name AS counterpart_name,
                COUNT(*) OVER () AS total_rows
            FROM visible v
            LEFT JOIN equipment_items ei ON ei.item_id = v.id
            LEFT JOIN equipment e ON e.id = ei.equipment_id
            LEFT JOIN areas ca ON ca.id = v.counterpart_id
            WHERE ($2::text IS NULL OR v.class = $2)
                AND ($3::text IS NULL OR lower(v.item_type) = lower(btrim($3)))
                AND ($4::date IS NULL OR (v.created_at AT TIME ZONE 'UTC')::date >= $4)
                AND ($5::date IS NULL OR (v.created_at AT TIME ZONE 'UTC')::date <= $5)
                AND ($6::text IS NULL OR v.status = $6)
            ORDER BY lower(v.item_type), lower(v.code), v.id
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(area_id.get())
        .bind(filter.class.map(ItemClass::as_str))
        .bind(filter.item_type.as_deref())
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(filter.status.map(ItemStatus::as_str))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("area_items", e))?;

        let mut total = 0;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            total = col::<i64>(row, "total_rows")?;
            let item = decode_item(row)?;
            let view_status: AreaViewStatus = parse_col(row, "view_status")?;
            items.push(AreaItemRow {
                item_id: item.id,
                code: item.code,
                class: item.class,
                item_type: item.item_type,
                status: item.status,
                view_status,
                created_at: item.created_at,
                equipment: decode_equipment_summary(row, "equipment_id", "equipment_code", "equipment_name")?,
                counterpart: decode_area_ref(row, "counterpart_id", "counterpart_name")?,
                can_return: view_status.can_return(),
            });
        }

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    #[instrument(skip(self, filter), fields(area_id = %area_id), err)]
    async fn area_equipment(
        &self,
        area_id: AreaId,
        filter: AreaEquipmentFilter,
        page: PageRequest,
    ) -> Result<Page<AreaEquipmentRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);
        let pattern = filter.text_needle().map(|n| format!("%{n}%"));

        let rows = sqlx::query(
            r#"
            SELECT
                e.id,
                e.code,
                e.name,
                e.end_user,
                e.created_at,
                e.updated_at,
                (SELECT COUNT(*) FROM equipment_items ei WHERE ei.equipment_id = e.id) AS member_count,
                COUNT(*) OVER () AS total_rows
            FROM equipment e
            WHERE e.area_id = $1
                AND ($2::date IS NULL OR (e.created_at AT TIME ZONE 'UTC')::date >= $2)
                AND ($3::date IS NULL OR (e.created_at AT TIME ZONE 'UTC')::date <= $3)
                AND ($4::text IS NULL OR (
                        e.code ILIKE $4
                    OR  e.name ILIKE $4
                    OR  COALESCE(e.end_user, '') ILIKE $4
                ))
            ORDER BY lower(e.code), e.id
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(area_id.get())
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(pattern.as_deref())
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("area_equipment", e))?;

        let mut total = 0;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            total = col::<i64>(row, "total_rows")?;
            items.push(AreaEquipmentRow {
                id: EquipmentId::new(col(row, "id")?),
                code: col(row, "code")?,
                name: col(row, "name")?,
                end_user: col(row, "end_user")?,
                member_count: col::<i64>(row, "member_count")? as u64,
                created_at: col(row, "created_at")?,
                updated_at: col(row, "updated_at")?,
            });
        }

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    #[instrument(skip(self, filter), fields(source = filter.source.as_str()), err)]
    async fn ledger_entries(&self, filter: LedgerFilter, page: PageRequest) -> Result<Page<LedgerRow>, StoreError> {
        let page = page.clamped(LEDGER_MAX_SIZE);
        let pattern = filter.text_needle().map(|n| format!("%{n}%"));

        let rows = sqlx::query(
            r#"
            WITH entries AS (
                SELECT
                    m.id,
                    FALSE AS is_audit,
                    m.item_id,
                    i.code AS item_code,
                    i.class AS item_class,
                    i.item_type,
                    m.kind,
                    m.loan_phase,
                    m.occurred_at,
                    m.origin_area_id,
                    ao.name AS origin_name,
                    m.destination_area_id,
                    ad.name AS destination_name,
                    m.equipment_id,
                    e.code AS equipment_code,
                    e.name AS equipment_name,
                    m.actor,
                    m.reason,
                    m.detail
                FROM movements m
                LEFT JOIN items i ON i.id = m.item_id
                LEFT JOIN areas ao ON ao.id = m.origin_area_id
                LEFT JOIN areas ad ON ad.id = m.destination_area_id
                LEFT JOIN equipment e ON e.id = m.equipment_id
                WHERE $1::text <> 'AUDIT'
                    AND ($2::text IS NULL OR m.kind = $2)
                    AND ($3::date IS NULL OR (m.occurred_at AT TIME ZONE 'UTC')::date >= $3)
                    AND ($4::date IS NULL OR (m.occurred_at AT TIME ZONE 'UTC')::date <= $4)
                    AND ($5::bigint IS NULL OR m.item_id = $5)
                    AND ($6::bigint IS NULL OR m.equipment_id = $6)
                    AND ($7::bigint IS NULL OR m.origin_area_id = $7 OR m.destination_area_id = $7)
                    AND ($8::text IS NULL OR (
                            i.code ILIKE $8
                        OR  i.item_type ILIKE $8
                        OR  COALESCE(e.code, '') ILIKE $8
                        OR  COALESCE(e.name, '') ILIKE $8
                        OR  m.actor ILIKE $8
                        OR  COALESCE(m.reason, '') ILIKE $8
                        OR  m.detail::text ILIKE $8
                    ))
                UNION ALL
                SELECT
                    a.id,
                    TRUE,
                    NULL::bigint,
                    NULL::text,
                    NULL::text,
                    NULL::text,
                    a.action,
                    NULL::text,
                    a.occurred_at,
                    NULL::bigint,
                    NULL::text,
                    NULL::bigint,
                    NULL::text,
                    NULL::bigint,
                    NULL::text,
                    NULL::text,
                    a.actor,
                    NULL::text,
                    jsonb_build_object(
                        'entity', a.entity,
                        'entity_id', a.entity_id,
                        'before', a.before,
                        'after', a.after,
                        'extra', a.extra
                    )
                FROM audit_log a
                WHERE $1::text <> 'MOVEMENTS'
                    AND ($3::date IS NULL OR (a.occurred_at AT TIME ZONE 'UTC')::date >= $3)
                    AND ($4::date IS NULL OR (a.occurred_at AT TIME ZONE 'UTC')::date <= $4)
                    AND ($8::text IS NULL OR (
                            a.actor ILIKE $8
                        OR  a.action ILIKE $8
                        OR  a.entity ILIKE $8
                        OR  COALESCE(a.entity_id, '') ILIKE $8
                        OR  COALESCE(a.before::text, '') ILIKE $8
                        OR  COALESCE(a.after::text, '') ILIKE $8
                        OR  COALESCE(a.extra::text, '') ILIKE $8
                    ))
            )
            SELECT entries.*, COUNT(*) OVER () AS total_rows
            FROM entries
            ORDER BY occurred_at DESC, id DESC
            LIMIT $9 OFFSET $10
            "#,
        )
        .bind(filter.source.as_str())
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.item_id.map(ItemId::get))
        .bind(filter.equipment_id.map(EquipmentId::get))
        .bind(filter.area_id.map(AreaId::get))
        .bind(pattern.as_deref())
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_entries", e))?;

        let mut total = 0;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            total = col::<i64>(row, "total_rows")?;
            items.push(LedgerRow {
                id: col(row, "id")?,
                is_audit: col(row, "is_audit")?,
                item_id: col::<Option<i64>>(row, "item_id")?.map(ItemId::new),
                item_code: col(row, "item_code")?,
                item_class: parse_opt_col(row, "item_class")?,
                item_type: col(row, "item_type")?,
                kind: col(row, "kind")?,
                loan_phase: parse_opt_col(row, "loan_phase")?,
                occurred_at: col(row, "occurred_at")?,
                origin: decode_area_ref(row, "origin_area_id", "origin_name")?,
                destination: decode_area_ref(row, "destination_area_id", "destination_name")?,
                equipment: decode_equipment_summary(row, "equipment_id", "equipment_code", "equipment_name")?,
                actor: col(row, "actor")?,
                reason: col(row, "reason")?,
                detail: col(row, "detail")?,
            });
        }

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    async fn item_detail(&self, item_id: ItemId) -> Result<ItemDetail, StoreError> {
        let mut conn = self.acquire().await?;

        let item = sqlx::query(
            "SELECT id, code, class, item_type, owning_area_id, status, created_at FROM items WHERE id = $1",
        )
        .bind(item_id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("item_detail", e))?
        .map(|row| decode_item(&row))
        .transpose()?
        .ok_or(LedgerError::ItemNotFound(item_id))?;

        let membership = sqlx::query(
            r#"
            SELECT e.id, e.code, e.name, e.area_id, ei.slot, ei.assigned_at
            FROM equipment_items ei
            JOIN equipment e ON e.id = ei.equipment_id
            WHERE ei.item_id = $1
            "#,
        )
        .bind(item_id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("item_membership", e))?
        .map(|row| -> Result<MembershipDetail, StoreError> {
            Ok(MembershipDetail {
                equipment: EquipmentSummary {
                    id: EquipmentId::new(col(&row, "id")?),
                    code: col(&row, "code")?,
                    name: col(&row, "name")?,
                },
                area_id: AreaId::new(col(&row, "area_id")?),
                slot: col(&row, "slot")?,
                assigned_at: col(&row, "assigned_at")?,
            })
        })
        .transpose()?;

        let loan = fetch_active_loan(&mut conn, item_id).await?;
        Ok(ItemDetail { item, membership, loan })
    }

    async fn equipment_detail(&self, id: EquipmentId) -> Result<EquipmentDetail, StoreError> {
        let mut conn = self.acquire().await?;
        let equipment = fetch_equipment(&mut conn, id, false)
            .await?
            .ok_or(LedgerError::EquipmentNotFound(id))?;

        let rows = sqlx::query(
            r#"
            SELECT i.id, i.code, i.class, i.item_type, i.status, ei.slot
            FROM equipment_items ei
            JOIN items i ON i.id = ei.item_id
            WHERE ei.equipment_id = $1
            ORDER BY CASE i.class WHEN 'COMPONENT' THEN 0 ELSE 1 END, lower(i.item_type), lower(i.code)
            "#,
        )
        .bind(id.get())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("equipment_members", e))?;

        let members = rows
            .iter()
            .map(|row| {
                Ok(EquipmentMember {
                    item_id: ItemId::new(col(row, "id")?),
                    code: col(row, "code")?,
                    class: parse_col(row, "class")?,
                    item_type: col(row, "item_type")?,
                    status: parse_col(row, "status")?,
                    slot: col(row, "slot")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(EquipmentDetail { equipment, members })
    }

    async fn area_loans(
        &self,
        area_id: AreaId,
        active_only: bool,
        page: PageRequest,
    ) -> Result<Page<AreaLoanRow>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);

        let rows = sqlx::query(
            r#"
            SELECT
                o.id AS movement_id,
                o.item_id,
                i.code AS item_code,
                i.item_type,
                o.origin_area_id,
                ao.name AS origin_name,
                o.destination_area_id,
                ad.name AS destination_name,
                o.occurred_at AS since,
                c.occurred_at AS returned_at,
                COUNT(*) OVER () AS total_rows
            FROM movements o
            JOIN items i ON i.id = o.item_id
            JOIN areas ao ON ao.id = o.origin_area_id
            JOIN areas ad ON ad.id = o.destination_area_id
            LEFT JOIN LATERAL (
                SELECT m.occurred_at
                FROM movements m
                WHERE m.item_id = o.item_id
                    AND m.kind = 'TRANSFER'
                    AND m.loan_phase = 'CLOSED'
                    AND m.id > o.id
                ORDER BY m.id ASC
                LIMIT 1
            ) c ON TRUE
            WHERE o.kind = 'TRANSFER'
                AND o.loan_phase = 'OPENED'
                AND (o.origin_area_id = $1 OR o.destination_area_id = $1)
                AND (NOT $2::boolean OR c.occurred_at IS NULL)
            ORDER BY o.occurred_at DESC, o.id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(area_id.get())
        .bind(active_only)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("area_loans", e))?;

        let mut total = 0;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            total = col::<i64>(row, "total_rows")?;
            items.push(AreaLoanRow {
                movement_id: MovementId::new(col(row, "movement_id")?),
                item_id: ItemId::new(col(row, "item_id")?),
                item_code: col(row, "item_code")?,
                item_type: col(row, "item_type")?,
                origin: AreaRef {
                    id: AreaId::new(col(row, "origin_area_id")?),
                    name: col(row, "origin_name")?,
                },
                destination: AreaRef {
                    id: AreaId::new(col(row, "destination_area_id")?),
                    name: col(row, "destination_name")?,
                },
                since: col(row, "since")?,
                returned_at: col(row, "returned_at")?,
            });
        }

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    async fn available_items(
        &self,
        area_id: AreaId,
        filter: AvailableItemFilter,
        page: PageRequest,
    ) -> Result<Page<Item>, StoreError> {
        let page = page.clamped(AREA_VIEW_MAX_SIZE);
        let pattern = filter
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| format!("%{t}%"));

        let rows = sqlx::query(
            r#"
            SELECT
                id, code, class, item_type, owning_area_id, status, created_at,
                COUNT(*) OVER () AS total_rows
            FROM items
            WHERE owning_area_id = $1
                AND class = $2
                AND status = 'IN_STORAGE'
                AND ($3::text IS NULL OR lower(item_type) = lower(btrim($3)))
                AND ($4::text IS NULL OR code ILIKE $4 OR item_type ILIKE $4)
            ORDER BY lower(item_type), lower(code), id
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(area_id.get())
        .bind(filter.class.as_str())
        .bind(filter.item_type.as_deref())
        .bind(pattern.as_deref())
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("available_items", e))?;

        let mut total = 0;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            total = col::<i64>(row, "total_rows")?;
            items.push(decode_item(row)?);
        }

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    async fn suggest_item_code(&self, class: ItemClass, item_type: &str, area_id: AreaId) -> Result<String, StoreError> {
        let item_type = item_type.trim();
        if item_type.is_empty() {
            return Err(DomainError::validation("item type cannot be empty").into());
        }

        let codes: Vec<String> = sqlx::query_scalar(
            "SELECT code FROM items WHERE owning_area_id = $1 AND class = $2 AND lower(item_type) = lower($3)",
        )
        .bind(area_id.get())
        .bind(class.as_str())
        .bind(item_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("suggest_item_code", e))?;

        Ok(suggest_next_code(item_type, codes.iter().map(String::as_str), ITEM_CODE_PAD))
    }

    async fn suggest_equipment_code(&self, area_id: AreaId, prefix: Option<&str>) -> Result<String, StoreError> {
        let prefix = prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_EQUIPMENT_PREFIX);

        let codes: Vec<String> = sqlx::query_scalar("SELECT code FROM equipment WHERE area_id = $1")
            .bind(area_id.get())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("suggest_equipment_code", e))?;

        Ok(suggest_next_code(prefix, codes.iter().map(String::as_str), EQUIPMENT_CODE_PAD))
    }
}

// Row decoding

fn col<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to read column {column}: {e}")))
}

fn parse_col<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = col(row, column)?;
    raw.parse()
        .map_err(|e| StoreError::Storage(format!("invalid value in column {column}: {e}")))
}

fn parse_opt_col<T>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = col(row, column)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e| StoreError::Storage(format!("invalid value in column {column}: {e}")))
    })
    .transpose()
}

fn decode_item(row: &PgRow) -> Result<Item, StoreError> {
    Ok(Item {
        id: ItemId::new(col(row, "id")?),
        code: col(row, "code")?,
        class: parse_col(row, "class")?,
        item_type: col(row, "item_type")?,
        owning_area: AreaId::new(col(row, "owning_area_id")?),
        status: parse_col(row, "status")?,
        created_at: col(row, "created_at")?,
    })
}

fn decode_equipment(row: &PgRow) -> Result<Equipment, StoreError> {
    Ok(Equipment {
        id: EquipmentId::new(col(row, "id")?),
        code: col(row, "code")?,
        name: col(row, "name")?,
        area_id: AreaId::new(col(row, "area_id")?),
        end_user: col(row, "end_user")?,
        login: col(row, "login")?,
        password: col(row, "password")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn decode_area(row: &PgRow) -> Result<Area, StoreError> {
    Ok(Area {
        id: AreaId::new(col(row, "id")?),
        name: col(row, "name")?,
        parent_id: col::<Option<i64>>(row, "parent_id")?.map(AreaId::new),
    })
}

fn decode_movement(row: &PgRow) -> Result<Movement, StoreError> {
    Ok(Movement {
        id: MovementId::new(col(row, "id")?),
        item_id: ItemId::new(col(row, "item_id")?),
        kind: parse_col(row, "kind")?,
        loan_phase: parse_opt_col(row, "loan_phase")?,
        origin_area: AreaId::new(col(row, "origin_area_id")?),
        destination_area: AreaId::new(col(row, "destination_area_id")?),
        equipment_id: col::<Option<i64>>(row, "equipment_id")?.map(EquipmentId::new),
        actor: Actor::new(col::<String>(row, "actor")?)?,
        reason: col(row, "reason")?,
        detail: col(row, "detail")?,
        occurred_at: col(row, "occurred_at")?,
    })
}

fn decode_area_ref(row: &PgRow, id_column: &str, name_column: &str) -> Result<Option<AreaRef>, StoreError> {
    let id: Option<i64> = col(row, id_column)?;
    let name: Option<String> = col(row, name_column)?;
    Ok(id.zip(name).map(|(id, name)| AreaRef {
        id: AreaId::new(id),
        name,
    }))
}

fn decode_equipment_summary(
    row: &PgRow,
    id_column: &str,
    code_column: &str,
    name_column: &str,
) -> Result<Option<EquipmentSummary>, StoreError> {
    let id: Option<i64> = col(row, id_column)?;
    let code: Option<String> = col(row, code_column)?;
    let name: Option<String> = col(row, name_column)?;
    Ok(match (id, code, name) {
        (Some(id), Some(code), Some(name)) => Some(EquipmentSummary {
            id: EquipmentId::new(id),
            code,
            name,
        }),
        _ => None,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // unique, foreign key, check
                Some("23505") | Some("23503") | Some("23514") => StoreError::ConstraintViolation(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::RowNotFound => StoreError::Storage(format!("unexpected row not found in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
