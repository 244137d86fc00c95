use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use super::models::LedgerRecord;
use crate::error::{AppResult, ReconcileError};

/// Ledger store with atomic read-modify-write per trade.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the record for a newly started trade. Fails with
    /// `AlreadyStarted` if the trade is already tracked.
    async fn create(&self, record: LedgerRecord) -> AppResult<()>;

    async fn get(&self, trade_hash: &str) -> AppResult<Option<LedgerRecord>>;

    /// Atomically adds `delta` to the trade's balance and returns the
    /// updated record. Concurrent deltas are serialized; no update is
    /// ever lost.
    async fn apply_delta(&self, trade_hash: &str, delta: Decimal) -> AppResult<LedgerRecord>;

    async fn set_crypto_released(&self, trade_hash: &str, released: bool) -> AppResult<()>;

    async fn find_by_payment_reference(&self, reference: &str)
        -> AppResult<Option<LedgerRecord>>;
}

/// In-memory ledger guarded by one coarse lock for the whole store,
/// mirroring the advisory file lock of the original deployment. Low
/// trade volume makes the serialization acceptable.
pub struct MemoryLedgerStore {
    records: Mutex<HashMap<String, LedgerRecord>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create(&self, record: LedgerRecord) -> AppResult<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.trade_hash) {
            return Err(ReconcileError::AlreadyStarted(record.trade_hash).into());
        }
        records.insert(record.trade_hash.clone(), record);
        Ok(())
    }

    async fn get(&self, trade_hash: &str) -> AppResult<Option<LedgerRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(trade_hash).cloned())
    }

    async fn apply_delta(&self, trade_hash: &str, delta: Decimal) -> AppResult<LedgerRecord> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(trade_hash)
            .ok_or_else(|| ReconcileError::TradeNotFound(trade_hash.to_string()))?;
        record.fiat_balance += delta;
        Ok(record.clone())
    }

    async fn set_crypto_released(&self, trade_hash: &str, released: bool) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(trade_hash)
            .ok_or_else(|| ReconcileError::TradeNotFound(trade_hash.to_string()))?;
        record.crypto_released = released;
        Ok(())
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> AppResult<Option<LedgerRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|r| r.expected_payment_reference == reference)
            .cloned())
    }
}

/// Postgres ledger. Row-level atomicity replaces the coarse advisory
/// lock: the balance update is a single `UPDATE … RETURNING`.
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &PgRow) -> AppResult<LedgerRecord> {
        Ok(LedgerRecord {
            trade_hash: row.try_get("trade_hash")?,
            fiat_balance: row.try_get("fiat_balance")?,
            expected_fiat_amount: row.try_get("expected_fiat_amount")?,
            expected_fiat_currency: row.try_get("expected_fiat_currency")?,
            expected_payment_reference: row.try_get("expected_payment_reference")?,
            crypto_released: row.try_get("crypto_released")?,
        })
    }
}

const LEDGER_COLUMNS: &str = "trade_hash, fiat_balance, expected_fiat_amount, \
     expected_fiat_currency, expected_payment_reference, crypto_released";

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create(&self, record: LedgerRecord) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger (trade_hash, fiat_balance, expected_fiat_amount,
                                expected_fiat_currency, expected_payment_reference,
                                crypto_released)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (trade_hash) DO NOTHING
            "#,
        )
        .bind(&record.trade_hash)
        .bind(record.fiat_balance)
        .bind(record.expected_fiat_amount)
        .bind(&record.expected_fiat_currency)
        .bind(&record.expected_payment_reference)
        .bind(record.crypto_released)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::AlreadyStarted(record.trade_hash).into());
        }
        Ok(())
    }

    async fn get(&self, trade_hash: &str) -> AppResult<Option<LedgerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger WHERE trade_hash = $1",
            LEDGER_COLUMNS
        ))
        .bind(trade_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn apply_delta(&self, trade_hash: &str, delta: Decimal) -> AppResult<LedgerRecord> {
        let row = sqlx::query(&format!(
            "UPDATE ledger SET fiat_balance = fiat_balance + $2 \
             WHERE trade_hash = $1 RETURNING {}",
            LEDGER_COLUMNS
        ))
        .bind(trade_hash)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => Err(ReconcileError::TradeNotFound(trade_hash.to_string()).into()),
        }
    }

    async fn set_crypto_released(&self, trade_hash: &str, released: bool) -> AppResult<()> {
        let result = sqlx::query("UPDATE ledger SET crypto_released = $2 WHERE trade_hash = $1")
            .bind(trade_hash)
            .bind(released)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::TradeNotFound(trade_hash.to_string()).into());
        }
        Ok(())
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> AppResult<Option<LedgerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger WHERE expected_payment_reference = $1",
            LEDGER_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }
}
