//! Postgres-backed escrow store
//!
//! Each [`EscrowStore::commit`] runs in one SQL transaction. Transition ops
//! lock the escrow row with `SELECT ... FOR UPDATE` and write back with a
//! `WHERE state = $from` guard, so a concurrent writer that got there first
//! turns this op into `AlreadyApplied` or `Conflict` instead of a lost update.
//! Funding hashes are checked against other escrows inside the same
//! transaction; the partial unique index on `onchain_tx_hash` backs that up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{
    check_transition, conflict_reason, tx_taken_reason, EscrowStore, OpOutcome, StoreOp, TransitionCheck,
};
use crate::models::{Escrow, EscrowEvent, EscrowFilter, EscrowState, NewEscrowEvent, Page, PageRequest};
use crate::state_machine::StateChange;
use crate::{EscrowError, EscrowResult};

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Apply embedded migrations on connect
    pub run_migrations: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 5,
            run_migrations: true,
        }
    }
}

const ESCROW_COLUMNS: &str = "id, contract_id, buyer_id, seller_id, onchain_trade_id, onchain_tx_hash, \
     amount::TEXT AS amount, state, completed_by, confirmations, is_confirmed, timeout_at, metadata, \
     dispute_reason, resolution_notes, created_at, updated_at, funded_at, completed_at, disputed_at";

const EVENT_COLUMNS: &str = "id, escrow_id, kind, payload, tx_hash, block_number, block_hash, log_index, \
     is_processed, processed_at, error_message, retry_count, created_at";

#[derive(Debug, sqlx::FromRow)]
struct EscrowRow {
    id: Uuid,
    contract_id: Uuid,
    buyer_id: Uuid,
    seller_id: Uuid,
    onchain_trade_id: Option<i64>,
    onchain_tx_hash: Option<String>,
    amount: String,
    state: String,
    completed_by: Option<String>,
    confirmations: i64,
    is_confirmed: bool,
    timeout_at: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
    dispute_reason: Option<String>,
    resolution_notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    funded_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    disputed_at: Option<DateTime<Utc>>,
}

impl TryFrom<EscrowRow> for Escrow {
    type Error = EscrowError;

    fn try_from(row: EscrowRow) -> Result<Self, Self::Error> {
        Ok(Escrow {
            id: row.id,
            contract_id: row.contract_id,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            onchain_trade_id: row.onchain_trade_id.map(from_i64).transpose()?,
            onchain_tx_hash: row.onchain_tx_hash,
            amount: row.amount.parse().map_err(|e| {
                EscrowError::storage(format!("corrupt amount in escrow {}: {e}", row.id))
            })?,
            state: row.state.parse()?,
            completed_by: row.completed_by.as_deref().map(str::parse).transpose()?,
            confirmations: from_i64(row.confirmations)?,
            is_confirmed: row.is_confirmed,
            timeout_at: row.timeout_at,
            metadata: row.metadata,
            dispute_reason: row.dispute_reason,
            resolution_notes: row.resolution_notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            funded_at: row.funded_at,
            completed_at: row.completed_at,
            disputed_at: row.disputed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    escrow_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    tx_hash: Option<String>,
    block_number: Option<i64>,
    block_hash: Option<String>,
    log_index: Option<i64>,
    is_processed: bool,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EscrowEvent {
    type Error = EscrowError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EscrowEvent {
            id: row.id,
            escrow_id: row.escrow_id,
            kind: row.kind.parse()?,
            payload: row.payload,
            tx_hash: row.tx_hash,
            block_number: row.block_number.map(from_i64).transpose()?,
            block_hash: row.block_hash,
            log_index: row.log_index.map(from_i64).transpose()?,
            is_processed: row.is_processed,
            processed_at: row.processed_at,
            error_message: row.error_message,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            created_at: row.created_at,
        })
    }
}

fn from_i64(value: i64) -> EscrowResult<u64> {
    u64::try_from(value).map_err(|_| EscrowError::storage(format!("negative value {value} in store")))
}

fn to_i64(value: u64) -> EscrowResult<i64> {
    i64::try_from(value).map_err(|_| EscrowError::storage(format!("value {value} exceeds BIGINT")))
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &EscrowFilter) {
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(contract_id) = filter.contract_id {
        qb.push(" AND contract_id = ").push_bind(contract_id);
    }
    if let Some(party) = filter.party_id {
        qb.push(" AND (buyer_id = ")
            .push_bind(party)
            .push(" OR seller_id = ")
            .push_bind(party)
            .push(")");
    }
}

async fn lock_escrow(conn: &mut PgConnection, id: Uuid) -> EscrowResult<Escrow> {
    let row: Option<EscrowRow> = sqlx::query_as(&format!(
        "SELECT {ESCROW_COLUMNS} FROM escrows WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| EscrowError::not_found(format!("Escrow {id}")))?
        .try_into()
}

/// Write back the mutable columns, guarded on the state we read
async fn write_escrow(conn: &mut PgConnection, escrow: &Escrow, expected: EscrowState) -> EscrowResult<bool> {
    let result = sqlx::query(
        "UPDATE escrows SET
            state = $3, onchain_trade_id = $4, onchain_tx_hash = $5, confirmations = $6,
            is_confirmed = $7, dispute_reason = $8, resolution_notes = $9, updated_at = $10,
            funded_at = $11, completed_at = $12, disputed_at = $13, completed_by = $14
         WHERE id = $1 AND state = $2",
    )
    .bind(escrow.id)
    .bind(expected.as_str())
    .bind(escrow.state.as_str())
    .bind(escrow.onchain_trade_id.map(to_i64).transpose()?)
    .bind(&escrow.onchain_tx_hash)
    .bind(to_i64(escrow.confirmations)?)
    .bind(escrow.is_confirmed)
    .bind(&escrow.dispute_reason)
    .bind(&escrow.resolution_notes)
    .bind(escrow.updated_at)
    .bind(escrow.funded_at)
    .bind(escrow.completed_at)
    .bind(escrow.disputed_at)
    .bind(escrow.completed_by.map(|a| a.as_str()))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn event_exists(conn: &mut PgConnection, key: &Option<(String, u64)>) -> EscrowResult<bool> {
    let Some((tx_hash, log_index)) = key else {
        return Ok(false);
    };
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM escrow_events WHERE tx_hash = $1 AND log_index = $2)",
    )
    .bind(tx_hash)
    .bind(to_i64(*log_index)?)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Whether another escrow holds `tx_hash` or recorded it as processed funding
async fn tx_taken(conn: &mut PgConnection, tx_hash: &str, escrow_id: Uuid) -> EscrowResult<bool> {
    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM escrows WHERE onchain_tx_hash = $1 AND id <> $2)
             OR EXISTS (SELECT 1 FROM escrow_events
                        WHERE tx_hash = $1 AND kind = 'funded' AND is_processed AND escrow_id <> $2)",
    )
    .bind(tx_hash)
    .bind(escrow_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(taken)
}

/// Insert an event; `false` when the idempotency key already exists
async fn insert_event(conn: &mut PgConnection, event: &NewEscrowEvent) -> EscrowResult<bool> {
    let result = sqlx::query(
        "INSERT INTO escrow_events
            (escrow_id, kind, payload, tx_hash, block_number, block_hash, log_index,
             is_processed, processed_at, error_message, retry_count, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, CASE WHEN $8 THEN NOW() END, $9, 0, NOW())
         ON CONFLICT (tx_hash, log_index) WHERE tx_hash IS NOT NULL AND log_index IS NOT NULL
         DO NOTHING",
    )
    .bind(event.escrow_id)
    .bind(event.kind.as_str())
    .bind(&event.payload)
    .bind(&event.tx_hash)
    .bind(event.block_number.map(to_i64).transpose()?)
    .bind(&event.block_hash)
    .bind(event.log_index.map(to_i64).transpose()?)
    .bind(event.is_processed)
    .bind(&event.error_message)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Apply a planned change to the locked escrow
async fn apply_change(conn: &mut PgConnection, change: &StateChange) -> EscrowResult<OpOutcome> {
    let mut escrow = lock_escrow(conn, change.escrow_id).await?;
    let current = escrow.state;
    match check_transition(&escrow, change) {
        TransitionCheck::Apply => {
            if let Some(hash) = &change.fields.onchain_tx_hash {
                if tx_taken(conn, hash, escrow.id).await? {
                    return Ok(OpOutcome::Rejected {
                        reason: tx_taken_reason(hash),
                    });
                }
            }
            change.apply_to(&mut escrow);
            if !write_escrow(conn, &escrow, current).await? {
                return Err(EscrowError::storage(format!(
                    "Escrow {} changed while locked",
                    escrow.id
                )));
            }
            Ok(OpOutcome::Applied)
        }
        TransitionCheck::AlreadyApplied => Ok(OpOutcome::AlreadyApplied),
        TransitionCheck::Conflict => Ok(OpOutcome::Conflict {
            actual: current,
            reason: conflict_reason(current, change),
        }),
    }
}

async fn apply_op(conn: &mut PgConnection, op: StoreOp) -> EscrowResult<OpOutcome> {
    match op {
        StoreOp::Transition(record) => {
            let key = record.event.idempotency_key();
            // Lock first so the duplicate check cannot race a writer on this escrow
            let escrow = lock_escrow(conn, record.change.escrow_id).await?;
            if event_exists(conn, &key).await? {
                return Ok(OpOutcome::Duplicate);
            }

            let outcome = apply_change(conn, &record.change).await?;
            match &outcome {
                OpOutcome::Applied => {
                    insert_event(conn, &record.event).await?;
                }
                OpOutcome::AlreadyApplied if key.is_some() => {
                    insert_event(conn, &record.event).await?;
                }
                OpOutcome::Conflict { reason, .. } | OpOutcome::Rejected { reason } if key.is_some() => {
                    insert_event(conn, &record.event.clone().unprocessed(reason.clone())).await?;
                }
                _ => {}
            }
            if outcome.is_applied() {
                info!(
                    "Escrow {} {} -> {}",
                    escrow.id, record.change.from, record.change.to
                );
            }
            Ok(outcome)
        }
        StoreOp::Append(event) => {
            if insert_event(conn, &event).await? {
                Ok(OpOutcome::Applied)
            } else {
                Ok(OpOutcome::Duplicate)
            }
        }
        StoreOp::LinkTrade {
            escrow_id,
            trade_id,
            tx_hash,
            event,
        } => {
            let mut escrow = lock_escrow(conn, escrow_id).await?;
            if event_exists(conn, &event.idempotency_key()).await? {
                return Ok(OpOutcome::Duplicate);
            }

            let trade = to_i64(trade_id)?;
            let taken_by_other: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM escrows WHERE onchain_trade_id = $1 AND id <> $2)",
            )
            .bind(trade)
            .bind(escrow_id)
            .fetch_one(&mut *conn)
            .await?;

            let conflict = if taken_by_other {
                Some(format!("Trade {trade_id} is already linked to another escrow"))
            } else {
                match escrow.onchain_trade_id {
                    Some(existing) if existing != trade_id => Some(format!(
                        "Escrow {escrow_id} is already linked to trade {existing}"
                    )),
                    _ => None,
                }
            };
            if let Some(reason) = conflict {
                insert_event(conn, &event.unprocessed(reason.clone())).await?;
                return Ok(OpOutcome::Conflict {
                    actual: escrow.state,
                    reason,
                });
            }

            let outcome = if escrow.onchain_trade_id == Some(trade_id) {
                OpOutcome::AlreadyApplied
            } else {
                let current = escrow.state;
                escrow.onchain_trade_id = Some(trade_id);
                if escrow.onchain_tx_hash.is_none() && !tx_taken(conn, &tx_hash, escrow_id).await? {
                    escrow.onchain_tx_hash = Some(tx_hash);
                }
                escrow.updated_at = Utc::now();
                write_escrow(conn, &escrow, current).await?;
                OpOutcome::Applied
            };
            insert_event(conn, &event).await?;
            Ok(outcome)
        }
        StoreOp::Settle { event_id, change } => {
            let locked: Option<i64> =
                sqlx::query_scalar("SELECT id FROM escrow_events WHERE id = $1 FOR UPDATE")
                    .bind(event_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            if locked.is_none() {
                return Err(EscrowError::not_found(format!("Escrow event {event_id}")));
            }

            let outcome = match change {
                Some(change) => apply_change(conn, &change).await?,
                None => OpOutcome::Applied,
            };
            match &outcome {
                OpOutcome::Conflict { reason, .. } | OpOutcome::Rejected { reason } => {
                    sqlx::query(
                        "UPDATE escrow_events SET retry_count = retry_count + 1, error_message = $2
                         WHERE id = $1",
                    )
                    .bind(event_id)
                    .bind(reason)
                    .execute(&mut *conn)
                    .await?;
                }
                _ => {
                    sqlx::query(
                        "UPDATE escrow_events SET is_processed = TRUE, processed_at = NOW(),
                            error_message = NULL
                         WHERE id = $1",
                    )
                    .bind(event_id)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            Ok(outcome)
        }
        StoreOp::Fail { event_id, error } => {
            let result = sqlx::query(
                "UPDATE escrow_events SET retry_count = retry_count + 1, error_message = $2
                 WHERE id = $1",
            )
            .bind(event_id)
            .bind(&error)
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 0 {
                return Err(EscrowError::not_found(format!("Escrow event {event_id}")));
            }
            Ok(OpOutcome::Applied)
        }
    }
}

/// Escrow store backed by Postgres
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `config`, applying migrations if enabled
    pub async fn connect(config: &StoreConfig) -> EscrowResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| EscrowError::config("store.database_url is not set"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(url)
            .await?;
        info!("Connected to PostgreSQL");

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> EscrowResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EscrowStore for PgStore {
    async fn insert_escrow(&self, escrow: &Escrow) -> EscrowResult<()> {
        let result = sqlx::query(
            "INSERT INTO escrows
                (id, contract_id, buyer_id, seller_id, onchain_trade_id, onchain_tx_hash, amount,
                 state, confirmations, is_confirmed, timeout_at, metadata, dispute_reason,
                 resolution_notes, created_at, updated_at, funded_at, completed_at, disputed_at,
                 completed_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20)
             ON CONFLICT (contract_id) DO NOTHING",
        )
        .bind(escrow.id)
        .bind(escrow.contract_id)
        .bind(escrow.buyer_id)
        .bind(escrow.seller_id)
        .bind(escrow.onchain_trade_id.map(to_i64).transpose()?)
        .bind(&escrow.onchain_tx_hash)
        .bind(escrow.amount.to_string())
        .bind(escrow.state.as_str())
        .bind(to_i64(escrow.confirmations)?)
        .bind(escrow.is_confirmed)
        .bind(escrow.timeout_at)
        .bind(&escrow.metadata)
        .bind(&escrow.dispute_reason)
        .bind(&escrow.resolution_notes)
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .bind(escrow.funded_at)
        .bind(escrow.completed_at)
        .bind(escrow.disputed_at)
        .bind(escrow.completed_by.map(|a| a.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EscrowError::validation(
                "Escrow already exists for this contract",
            ));
        }
        Ok(())
    }

    async fn escrow(&self, id: Uuid) -> EscrowResult<Option<Escrow>> {
        let row: Option<EscrowRow> =
            sqlx::query_as(&format!("SELECT {ESCROW_COLUMNS} FROM escrows WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Escrow::try_from).transpose()
    }

    async fn escrow_by_trade_id(&self, trade_id: u64) -> EscrowResult<Option<Escrow>> {
        let row: Option<EscrowRow> = sqlx::query_as(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows WHERE onchain_trade_id = $1"
        ))
        .bind(to_i64(trade_id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Escrow::try_from).transpose()
    }

    async fn list_escrows(&self, filter: &EscrowFilter, page: PageRequest) -> EscrowResult<Page<Escrow>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM escrows WHERE TRUE");
        push_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {ESCROW_COLUMNS} FROM escrows WHERE TRUE"));
        push_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(to_i64(page.offset())?);
        let rows: Vec<EscrowRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let items = rows
            .into_iter()
            .map(Escrow::try_from)
            .collect::<EscrowResult<Vec<_>>>()?;
        Ok(Page::new(items, from_i64(total)?, page))
    }

    async fn events(&self, escrow_id: Uuid) -> EscrowResult<Vec<EscrowEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM escrow_events WHERE escrow_id = $1 ORDER BY id"
        ))
        .bind(escrow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EscrowEvent::try_from).collect()
    }

    async fn has_event(&self, tx_hash: &str, log_index: u64) -> EscrowResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM escrow_events WHERE tx_hash = $1 AND log_index = $2)",
        )
        .bind(tx_hash)
        .bind(to_i64(log_index)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn last_processed_block(&self) -> EscrowResult<Option<u64>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_number) FROM escrow_events WHERE is_processed")
                .fetch_one(&self.pool)
                .await?;
        max.map(from_i64).transpose()
    }

    async fn pending_ledger_events(&self, max_retries: u32, limit: usize) -> EscrowResult<Vec<EscrowEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM escrow_events
             WHERE is_processed = FALSE AND retry_count < $1
               AND tx_hash IS NOT NULL AND log_index IS NOT NULL
             ORDER BY block_number, log_index
             LIMIT $2"
        ))
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EscrowEvent::try_from).collect()
    }

    async fn record_confirmations(
        &self,
        escrow_id: Uuid,
        tx_hash: &str,
        confirmations: u64,
        is_confirmed: bool,
    ) -> EscrowResult<Escrow> {
        sqlx::query(
            "UPDATE escrows SET confirmations = $3, is_confirmed = is_confirmed OR $4, updated_at = NOW()
             WHERE id = $1 AND onchain_tx_hash = $2 AND confirmations < $3",
        )
        .bind(escrow_id)
        .bind(tx_hash)
        .bind(to_i64(confirmations)?)
        .bind(is_confirmed)
        .execute(&self.pool)
        .await?;

        self.escrow(escrow_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {escrow_id}")))
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> EscrowResult<Vec<OpOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            // Early return drops `tx`, which rolls back
            outcomes.push(apply_op(&mut tx, op).await?);
        }
        tx.commit().await?;
        Ok(outcomes)
    }
}
