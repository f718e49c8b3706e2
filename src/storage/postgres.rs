//! PostgreSQL storage backend.
//!
//! A unit of work is one database transaction. Reads inside a unit take row
//! locks (`SELECT ... FOR UPDATE`), and the coordinator reads slot pairs in
//! ascending id order, so concurrent units serialize on the rows they share
//! instead of deadlocking. Every write is an `UPDATE ... WHERE status = $expected`
//! whose affected-row count decides the [`CasOutcome`].
//!
//! Serialization failures, deadlocks, unique violations and pool timeouts map
//! to [`SwapError::Conflict`] so the coordinator can retry them. Every other
//! database error is a [`SwapError::StorageFailure`].

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use super::{CasOutcome, ExchangeRequestStore, SlotStore, Storage, UnitOfWork};
use crate::domain::exchange::{
    AnyExchangeRequest, ExchangeData, ExchangeId, ExchangeRequest, ExchangeStatus, Pending,
};
use crate::domain::slot::{Slot, SlotId, SlotStatus, SlotUpdate, TimeRange, UserId};
use crate::error::{Result, SwapError};

const SLOT_COLUMNS: &str =
    "id, owner_id, title, start_time, end_time, status, created_at, updated_at";

const EXCHANGE_COLUMNS: &str = "id, requester_id, requester_slot_id, receiver_id, receiver_slot_id, status, created_at, responded_at";

/// SQLSTATEs that mean "another unit got there first".
const RETRYABLE_SQLSTATES: [&str; 3] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "23505", // unique_violation
];

/// PostgreSQL implementation of [`Storage`].
///
/// # Example
/// ```ignore
/// use slotswap::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/slotswap").await?;
/// slotswap::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
/// ```
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(context: &str, e: sqlx::Error) -> SwapError {
    if let sqlx::Error::Database(db_err) = &e
        && let Some(code) = db_err.code()
        && RETRYABLE_SQLSTATES.iter().any(|retryable| *retryable == code)
    {
        return SwapError::Conflict(format!("{}: {}", context, db_err));
    }
    if matches!(e, sqlx::Error::PoolTimedOut) {
        return SwapError::Conflict(format!("{}: connection pool timed out", context));
    }
    SwapError::StorageFailure(anyhow!("{}: {}", context, e))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| SwapError::StorageFailure(anyhow!("Failed to read {}: {}", name, e)))
}

fn slot_from_row(row: &PgRow) -> Result<Slot> {
    let status_str: String = column(row, "status")?;
    let status = status_str
        .parse::<SlotStatus>()
        .map_err(|e| SwapError::StorageFailure(anyhow!(e)))?;
    let start: DateTime<Utc> = column(row, "start_time")?;
    let end: DateTime<Utc> = column(row, "end_time")?;
    let owner: String = column(row, "owner_id")?;

    Ok(Slot {
        id: SlotId(column(row, "id")?),
        owner: UserId(owner),
        title: column(row, "title")?,
        range: TimeRange::new(start, end)?,
        status,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn exchange_from_row(row: &PgRow) -> Result<AnyExchangeRequest> {
    let status_str: String = column(row, "status")?;
    let status = status_str
        .parse::<ExchangeStatus>()
        .map_err(|e| SwapError::StorageFailure(anyhow!(e)))?;
    let requester: String = column(row, "requester_id")?;
    let receiver: String = column(row, "receiver_id")?;
    let responded_at: Option<DateTime<Utc>> = column(row, "responded_at")?;

    let data = ExchangeData {
        id: ExchangeId(column(row, "id")?),
        requester: UserId(requester),
        requester_slot: SlotId(column(row, "requester_slot_id")?),
        receiver: UserId(receiver),
        receiver_slot: SlotId(column(row, "receiver_slot_id")?),
        created_at: column(row, "created_at")?,
    };
    AnyExchangeRequest::from_parts(data, status, responded_at)
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        Ok(Box::new(PostgresUnit { tx }))
    }

    async fn find_slot(&self, id: SlotId) -> Result<Slot> {
        let row = sqlx::query(&format!("SELECT {} FROM slots WHERE id = $1", SLOT_COLUMNS))
            .bind(*id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to fetch slot", e))?
            .ok_or_else(|| SwapError::slot_not_found(id))?;
        slot_from_row(&row)
    }

    async fn find_exchange(&self, id: ExchangeId) -> Result<AnyExchangeRequest> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM exchange_requests WHERE id = $1",
            EXCHANGE_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch exchange request", e))?
        .ok_or_else(|| SwapError::exchange_not_found(id))?;
        exchange_from_row(&row)
    }

    async fn list_swappable_slots(&self, excluding: &UserId) -> Result<Vec<Slot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM slots WHERE status = 'SWAPPABLE' AND owner_id <> $1 ORDER BY start_time ASC, id ASC",
            SLOT_COLUMNS
        ))
        .bind(&excluding.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list swappable slots", e))?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn list_slots_owned_by(&self, owner: &UserId) -> Result<Vec<Slot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM slots WHERE owner_id = $1 ORDER BY start_time ASC, id ASC",
            SLOT_COLUMNS
        ))
        .bind(&owner.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list slots", e))?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn list_exchanges_for(&self, user: &UserId) -> Result<Vec<AnyExchangeRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM exchange_requests WHERE requester_id = $1 OR receiver_id = $1 ORDER BY created_at DESC, id DESC",
            EXCHANGE_COLUMNS
        ))
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list exchange requests", e))?;
        rows.iter().map(exchange_from_row).collect()
    }
}

/// A unit of work backed by one PostgreSQL transaction.
///
/// Dropping it without committing rolls the transaction back.
pub struct PostgresUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SlotStore for PostgresUnit {
    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM slots WHERE id = $1 FOR UPDATE",
            SLOT_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to lock slot", e))?;
        row.as_ref().map(slot_from_row).transpose()
    }

    async fn create_slot(&mut self, slot: &Slot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO slots (id, owner_id, title, start_time, end_time, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*slot.id)
        .bind(&slot.owner.0)
        .bind(&slot.title)
        .bind(slot.range.start)
        .bind(slot.range.end)
        .bind(slot.status.as_str())
        .bind(slot.created_at)
        .bind(slot.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to create slot", e))?;
        Ok(())
    }

    async fn compare_and_set_slot(
        &mut self,
        id: SlotId,
        expected: SlotStatus,
        update: &SlotUpdate,
    ) -> Result<CasOutcome> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE slots
            SET status = $3,
                owner_id = COALESCE($4, owner_id),
                title = COALESCE($5, title),
                start_time = COALESCE($6, start_time),
                end_time = COALESCE($7, end_time),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(*id)
        .bind(expected.as_str())
        .bind(update.status.as_str())
        .bind(update.owner.as_ref().map(|o| o.0.as_str()))
        .bind(update.title.as_deref())
        .bind(update.range.map(|r| r.start))
        .bind(update.range.map(|r| r.end))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to update slot", e))?
        .rows_affected();

        if rows_affected == 0 {
            tracing::debug!(slot_id = %id, expected = %expected, "Slot write lost compare-and-set");
            return Ok(CasOutcome::Conflict);
        }
        Ok(CasOutcome::Applied)
    }

    async fn delete_slot(&mut self, id: SlotId, expected: SlotStatus) -> Result<CasOutcome> {
        let rows_affected = sqlx::query("DELETE FROM slots WHERE id = $1 AND status = $2")
            .bind(*id)
            .bind(expected.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("Failed to delete slot", e))?
            .rows_affected();

        Ok(if rows_affected == 0 {
            CasOutcome::Conflict
        } else {
            CasOutcome::Applied
        })
    }
}

#[async_trait]
impl ExchangeRequestStore for PostgresUnit {
    async fn get_exchange(&mut self, id: ExchangeId) -> Result<Option<AnyExchangeRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM exchange_requests WHERE id = $1 FOR UPDATE",
            EXCHANGE_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to lock exchange request", e))?;
        row.as_ref().map(exchange_from_row).transpose()
    }

    async fn create_exchange(&mut self, request: &ExchangeRequest<Pending>) -> Result<()> {
        let data = &request.data;
        sqlx::query(
            r#"
            INSERT INTO exchange_requests
                (id, requester_id, requester_slot_id, receiver_id, receiver_slot_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)
            "#,
        )
        .bind(*data.id)
        .bind(&data.requester.0)
        .bind(*data.requester_slot)
        .bind(&data.receiver.0)
        .bind(*data.receiver_slot)
        .bind(data.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to create exchange request", e))?;
        Ok(())
    }

    async fn compare_and_set_exchange(
        &mut self,
        id: ExchangeId,
        expected: ExchangeStatus,
        next: &AnyExchangeRequest,
    ) -> Result<CasOutcome> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE exchange_requests
            SET status = $3, responded_at = $4
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(*id)
        .bind(expected.as_str())
        .bind(next.status().as_str())
        .bind(next.responded_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to update exchange request", e))?
        .rows_affected();

        if rows_affected == 0 {
            tracing::debug!(request_id = %id, expected = %expected, "Exchange write lost compare-and-set");
            return Ok(CasOutcome::Conflict);
        }
        Ok(CasOutcome::Applied)
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnit {
    #[tracing::instrument(skip(self))]
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("Failed to roll back transaction", e))
    }
}
