pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::exchange::ChatMessage;
use crate::staff::Staff;

pub use memory::{MemoryBacklogStore, MemoryExpirationStore, MemoryMessageLog, MemoryStaffStore};
pub use postgres::{PgBacklogStore, PgExpirationStore, PgMessageLog, PgStaffStore};

/// A staff document together with the version it was read at.
/// Writers must hand the version back through `compare_and_swap`.
#[derive(Debug, Clone)]
pub struct VersionedStaff {
    pub version: u64,
    pub staff: Staff,
}

/// Which backlog a trade waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogQueue {
    Auto,
    Manual,
}

impl BacklogQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacklogQueue::Auto => "auto",
            BacklogQueue::Manual => "manual",
        }
    }
}

/// Snapshot of a trade awaiting assignment, FIFO by enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub trade_hash: String,
    pub fiat_amount_requested: Decimal,
    pub fiat_currency_code: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable record of a pending manual-batch expiration. Survives a
/// process restart; the startup recovery scan re-arms these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationBatch {
    pub batch_id: Uuid,
    pub staff_id: String,
    pub deadline: DateTime<Utc>,
}

/// Staff directory: each staff record is an independently
/// addressable document with optimistic per-document concurrency.
/// `list` returns directory iteration order (insertion order), which
/// the scheduler uses to break least-loaded ties.
#[async_trait]
pub trait StaffStore: Send + Sync {
    /// Idempotent onboarding: inserting an existing id leaves the
    /// stored document untouched.
    async fn insert(&self, staff: Staff) -> AppResult<()>;

    async fn get(&self, staff_id: &str) -> AppResult<Option<VersionedStaff>>;

    async fn list(&self) -> AppResult<Vec<VersionedStaff>>;

    /// Conditional write: succeeds only if the stored version still
    /// equals `expected_version`. Returns `StoreError::VersionConflict`
    /// otherwise; callers re-read and retry.
    async fn compare_and_swap(&self, expected_version: u64, staff: Staff) -> AppResult<()>;
}

#[async_trait]
pub trait BacklogStore: Send + Sync {
    async fn push(&self, queue: BacklogQueue, entry: BacklogEntry) -> AppResult<()>;

    /// Pop the single oldest entry, or `None` when the queue is empty.
    async fn pop_oldest(&self, queue: BacklogQueue) -> AppResult<Option<BacklogEntry>>;

    /// Pop up to `count` oldest entries in FIFO order. May return
    /// fewer than requested; empty when the queue is empty.
    async fn pop_up_to(&self, queue: BacklogQueue, count: usize) -> AppResult<Vec<BacklogEntry>>;

    async fn len(&self, queue: BacklogQueue) -> AppResult<usize>;

    async fn snapshot(&self, queue: BacklogQueue) -> AppResult<Vec<BacklogEntry>>;
}

#[async_trait]
pub trait ExpirationStore: Send + Sync {
    async fn put(&self, batch: ExpirationBatch) -> AppResult<()>;

    async fn delete(&self, batch_id: Uuid) -> AppResult<()>;

    async fn list(&self) -> AppResult<Vec<ExpirationBatch>>;
}

/// Per-trade chat transcript with transactional append semantics
/// (read-then-conditional-write in the document store).
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, trade_hash: &str, messages: &[ChatMessage]) -> AppResult<()>;

    async fn get(&self, trade_hash: &str) -> AppResult<Vec<ChatMessage>>;
}
