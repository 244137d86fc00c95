use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    BacklogEntry, BacklogQueue, BacklogStore, ExpirationBatch, ExpirationStore, MessageLog,
    StaffStore, VersionedStaff,
};
use crate::error::{AppResult, StoreError};
use crate::exchange::ChatMessage;
use crate::staff::{AssignedTrade, Staff};

/// Postgres staff directory. The assigned-trade list is stored as a
/// JSONB document per staff row; `version` implements the
/// compare-and-swap protocol.
pub struct PgStaffStore {
    pool: PgPool,
}

impl PgStaffStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_versioned(row: &PgRow) -> AppResult<VersionedStaff> {
        let trades: Json<Vec<AssignedTrade>> = row.try_get("assigned_trades")?;
        Ok(VersionedStaff {
            version: row.try_get::<i64, _>("version")? as u64,
            staff: Staff {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                role: row.try_get("role")?,
                assigned_trades: trades.0,
                created_at: row.try_get("created_at")?,
            },
        })
    }
}

#[async_trait]
impl StaffStore for PgStaffStore {
    async fn insert(&self, staff: Staff) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO staff (id, name, email, role, assigned_trades, version, created_at)
            VALUES ($1, $2, $3, $4, $5, 1, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&staff.id)
        .bind(&staff.name)
        .bind(&staff.email)
        .bind(&staff.role)
        .bind(Json(&staff.assigned_trades))
        .bind(staff.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, staff_id: &str) -> AppResult<Option<VersionedStaff>> {
        let row = sqlx::query(
            "SELECT id, name, email, role, assigned_trades, version, created_at \
             FROM staff WHERE id = $1",
        )
        .bind(staff_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_versioned).transpose()
    }

    async fn list(&self) -> AppResult<Vec<VersionedStaff>> {
        let rows = sqlx::query(
            "SELECT id, name, email, role, assigned_trades, version, created_at \
             FROM staff ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_versioned).collect()
    }

    async fn compare_and_swap(&self, expected_version: u64, staff: Staff) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE staff
            SET name = $2, email = $3, role = $4, assigned_trades = $5,
                version = version + 1
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(&staff.id)
        .bind(&staff.name)
        .bind(&staff.email)
        .bind(&staff.role)
        .bind(Json(&staff.assigned_trades))
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found: Option<i64> = sqlx::query_scalar("SELECT version FROM staff WHERE id = $1")
                .bind(&staff.id)
                .fetch_optional(&self.pool)
                .await?;
            return match found {
                Some(found) => Err(StoreError::VersionConflict {
                    entity: format!("staff/{}", staff.id),
                    expected: expected_version,
                    found: found as u64,
                }
                .into()),
                None => {
                    Err(StoreError::Unavailable(format!("staff {} missing", staff.id)).into())
                }
            };
        }
        Ok(())
    }
}

/// Postgres FIFO backlog. `FOR UPDATE SKIP LOCKED` keeps concurrent
/// poppers from handing the same entry to two staff.
pub struct PgBacklogStore {
    pool: PgPool,
}

impl PgBacklogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> AppResult<BacklogEntry> {
        Ok(BacklogEntry {
            trade_hash: row.try_get("trade_hash")?,
            fiat_amount_requested: row.try_get::<Decimal, _>("fiat_amount_requested")?,
            fiat_currency_code: row.try_get("fiat_currency_code")?,
            enqueued_at: row.try_get("enqueued_at")?,
        })
    }
}

#[async_trait]
impl BacklogStore for PgBacklogStore {
    async fn push(&self, queue: BacklogQueue, entry: BacklogEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backlog (queue, trade_hash, fiat_amount_requested,
                                 fiat_currency_code, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(queue.as_str())
        .bind(&entry.trade_hash)
        .bind(entry.fiat_amount_requested)
        .bind(&entry.fiat_currency_code)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop_oldest(&self, queue: BacklogQueue) -> AppResult<Option<BacklogEntry>> {
        let row = sqlx::query(
            r#"
            DELETE FROM backlog
            WHERE id = (
                SELECT id FROM backlog WHERE queue = $1
                ORDER BY enqueued_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING trade_hash, fiat_amount_requested, fiat_currency_code, enqueued_at
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn pop_up_to(&self, queue: BacklogQueue, count: usize) -> AppResult<Vec<BacklogEntry>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM backlog
            WHERE id IN (
                SELECT id FROM backlog WHERE queue = $1
                ORDER BY enqueued_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING trade_hash, fiat_amount_requested, fiat_currency_code, enqueued_at
            "#,
        )
        .bind(queue.as_str())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<BacklogEntry> =
            rows.iter().map(Self::row_to_entry).collect::<AppResult<_>>()?;
        // RETURNING does not guarantee ordering.
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn len(&self, queue: BacklogQueue) -> AppResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backlog WHERE queue = $1")
            .bind(queue.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn snapshot(&self, queue: BacklogQueue) -> AppResult<Vec<BacklogEntry>> {
        let rows = sqlx::query(
            "SELECT trade_hash, fiat_amount_requested, fiat_currency_code, enqueued_at \
             FROM backlog WHERE queue = $1 ORDER BY enqueued_at, id",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}

pub struct PgExpirationStore {
    pool: PgPool,
}

impl PgExpirationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExpirationStore for PgExpirationStore {
    async fn put(&self, batch: ExpirationBatch) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO expiration_batches (batch_id, staff_id, deadline)
            VALUES ($1, $2, $3)
            ON CONFLICT (batch_id) DO UPDATE SET deadline = EXCLUDED.deadline
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.staff_id)
        .bind(batch.deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM expiration_batches WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> AppResult<Vec<ExpirationBatch>> {
        let rows = sqlx::query("SELECT batch_id, staff_id, deadline FROM expiration_batches")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ExpirationBatch {
                    batch_id: row.try_get("batch_id")?,
                    staff_id: row.try_get("staff_id")?,
                    deadline: row.try_get::<DateTime<Utc>, _>("deadline")?,
                })
            })
            .collect()
    }
}

/// Chat transcripts, appended with a single upsert so concurrent
/// webhook deliveries never lose messages.
pub struct PgMessageLog {
    pool: PgPool,
}

impl PgMessageLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn append(&self, trade_hash: &str, messages: &[ChatMessage]) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_messages (trade_hash, messages, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (trade_hash) DO UPDATE
            SET messages = trade_messages.messages || EXCLUDED.messages,
                updated_at = NOW()
            "#,
        )
        .bind(trade_hash)
        .bind(Json(messages))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, trade_hash: &str) -> AppResult<Vec<ChatMessage>> {
        let row = sqlx::query("SELECT messages FROM trade_messages WHERE trade_hash = $1")
            .bind(trade_hash)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let messages: Json<Vec<ChatMessage>> = row.try_get("messages")?;
                Ok(messages.0)
            }
            None => Ok(Vec::new()),
        }
    }
}
