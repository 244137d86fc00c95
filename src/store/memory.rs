use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    BacklogEntry, BacklogQueue, BacklogStore, ExpirationBatch, ExpirationStore, MessageLog,
    StaffStore, VersionedStaff,
};
use crate::error::{AppResult, StoreError};
use crate::exchange::ChatMessage;
use crate::staff::Staff;

/// In-memory staff directory. Insertion order is preserved so the
/// scheduler's tie-break matches the persistent store's
/// `ORDER BY created_at`.
pub struct MemoryStaffStore {
    entries: RwLock<Vec<VersionedStaff>>,
}

impl MemoryStaffStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStaffStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StaffStore for MemoryStaffStore {
    async fn insert(&self, staff: Staff) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.staff.id == staff.id) {
            debug!("Staff {} already onboarded, keeping existing record", staff.id);
            return Ok(());
        }
        entries.push(VersionedStaff { version: 1, staff });
        Ok(())
    }

    async fn get(&self, staff_id: &str) -> AppResult<Option<VersionedStaff>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.staff.id == staff_id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<VersionedStaff>> {
        let entries = self.entries.read().await;
        Ok(entries.clone())
    }

    async fn compare_and_swap(&self, expected_version: u64, staff: Staff) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.staff.id == staff.id)
            .ok_or_else(|| StoreError::Unavailable(format!("staff {} missing", staff.id)))?;

        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: format!("staff/{}", staff.id),
                expected: expected_version,
                found: entry.version,
            }
            .into());
        }

        entry.version += 1;
        entry.staff = staff;
        Ok(())
    }
}

/// FIFO backlog queues held in memory.
pub struct MemoryBacklogStore {
    queues: RwLock<HashMap<BacklogQueue, VecDeque<BacklogEntry>>>,
}

impl MemoryBacklogStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBacklogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacklogStore for MemoryBacklogStore {
    async fn push(&self, queue: BacklogQueue, entry: BacklogEntry) -> AppResult<()> {
        let mut queues = self.queues.write().await;
        let q = queues.entry(queue).or_default();
        // Queues stay ordered by enqueue time, matching the persistent
        // store's `ORDER BY enqueued_at`. A requeued entry (failed
        // drain) slots back in front of anything newer.
        let position = q
            .iter()
            .position(|e| e.enqueued_at > entry.enqueued_at)
            .unwrap_or(q.len());
        q.insert(position, entry);
        Ok(())
    }

    async fn pop_oldest(&self, queue: BacklogQueue) -> AppResult<Option<BacklogEntry>> {
        let mut queues = self.queues.write().await;
        Ok(queues.entry(queue).or_default().pop_front())
    }

    async fn pop_up_to(&self, queue: BacklogQueue, count: usize) -> AppResult<Vec<BacklogEntry>> {
        let mut queues = self.queues.write().await;
        let q = queues.entry(queue).or_default();
        let take = count.min(q.len());
        Ok(q.drain(..take).collect())
    }

    async fn len(&self, queue: BacklogQueue) -> AppResult<usize> {
        let queues = self.queues.read().await;
        Ok(queues.get(&queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn snapshot(&self, queue: BacklogQueue) -> AppResult<Vec<BacklogEntry>> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(&queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory expiration batches. Not durable; the Postgres store is
/// what makes restart recovery work in production.
pub struct MemoryExpirationStore {
    batches: RwLock<HashMap<Uuid, ExpirationBatch>>,
}

impl MemoryExpirationStore {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryExpirationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpirationStore for MemoryExpirationStore {
    async fn put(&self, batch: ExpirationBatch) -> AppResult<()> {
        let mut batches = self.batches.write().await;
        batches.insert(batch.batch_id, batch);
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> AppResult<()> {
        let mut batches = self.batches.write().await;
        batches.remove(&batch_id);
        Ok(())
    }

    async fn list(&self) -> AppResult<Vec<ExpirationBatch>> {
        let batches = self.batches.read().await;
        Ok(batches.values().cloned().collect())
    }
}

pub struct MemoryMessageLog {
    logs: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMessageLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn append(&self, trade_hash: &str, messages: &[ChatMessage]) -> AppResult<()> {
        let mut logs = self.logs.write().await;
        logs.entry(trade_hash.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn get(&self, trade_hash: &str) -> AppResult<Vec<ChatMessage>> {
        let logs = self.logs.read().await;
        Ok(logs.get(trade_hash).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::AppError;

    fn staff(id: &str) -> Staff {
        Staff::new(
            id.to_string(),
            "Test".to_string(),
            "test@example.com".to_string(),
            "Payer".to_string(),
        )
    }

    fn entry(hash: &str) -> BacklogEntry {
        BacklogEntry {
            trade_hash: hash.to_string(),
            fiat_amount_requested: dec!(50.00),
            fiat_currency_code: "USD".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryStaffStore::new();
        store.insert(staff("s1")).await.unwrap();

        let mut versioned = store.get("s1").await.unwrap().unwrap();
        versioned
            .staff
            .assigned_trades
            .push(crate::staff::AssignedTrade::new(
                "t1".to_string(),
                dec!(10),
                "USD".to_string(),
            ));
        store
            .compare_and_swap(versioned.version, versioned.staff)
            .await
            .unwrap();

        // Re-onboarding must not wipe the assigned list.
        store.insert(staff("s1")).await.unwrap();
        let kept = store.get("s1").await.unwrap().unwrap();
        assert_eq!(kept.staff.assigned_trades.len(), 1);
    }

    #[tokio::test]
    async fn test_cas_detects_stale_version() {
        let store = MemoryStaffStore::new();
        store.insert(staff("s1")).await.unwrap();

        let first = store.get("s1").await.unwrap().unwrap();
        store
            .compare_and_swap(first.version, first.staff.clone())
            .await
            .unwrap();

        // Second write against the stale version must fail.
        let result = store.compare_and_swap(first.version, first.staff).await;
        assert!(matches!(
            result,
            Err(AppError::Store(StoreError::VersionConflict { .. }))
        ));
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let store = MemoryStaffStore::new();
        store.insert(staff("b")).await.unwrap();
        store.insert(staff("a")).await.unwrap();
        store.insert(staff("c")).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.staff.id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_backlog_fifo() {
        let store = MemoryBacklogStore::new();
        for hash in ["t1", "t2", "t3"] {
            store.push(BacklogQueue::Auto, entry(hash)).await.unwrap();
        }

        assert_eq!(store.len(BacklogQueue::Auto).await.unwrap(), 3);
        let first = store.pop_oldest(BacklogQueue::Auto).await.unwrap().unwrap();
        assert_eq!(first.trade_hash, "t1");

        let rest = store.pop_up_to(BacklogQueue::Auto, 5).await.unwrap();
        let hashes: Vec<&str> = rest.iter().map(|e| e.trade_hash.as_str()).collect();
        assert_eq!(hashes, vec!["t2", "t3"]);

        assert!(store.pop_oldest(BacklogQueue::Auto).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeued_entry_keeps_fifo_position() {
        let store = MemoryBacklogStore::new();
        let mut oldest = entry("t1");
        oldest.enqueued_at = Utc::now() - chrono::Duration::seconds(10);
        store.push(BacklogQueue::Auto, oldest).await.unwrap();
        store.push(BacklogQueue::Auto, entry("t2")).await.unwrap();

        // A failed drain pops the oldest entry and pushes it back; it
        // must still drain before anything enqueued after it.
        let popped = store.pop_oldest(BacklogQueue::Auto).await.unwrap().unwrap();
        assert_eq!(popped.trade_hash, "t1");
        store.push(BacklogQueue::Auto, popped).await.unwrap();

        let next = store.pop_oldest(BacklogQueue::Auto).await.unwrap().unwrap();
        assert_eq!(next.trade_hash, "t1");
        let next = store.pop_oldest(BacklogQueue::Auto).await.unwrap().unwrap();
        assert_eq!(next.trade_hash, "t2");
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let store = MemoryBacklogStore::new();
        store.push(BacklogQueue::Auto, entry("t1")).await.unwrap();
        store.push(BacklogQueue::Manual, entry("t2")).await.unwrap();

        assert_eq!(store.len(BacklogQueue::Auto).await.unwrap(), 1);
        assert_eq!(store.len(BacklogQueue::Manual).await.unwrap(), 1);

        let manual = store.pop_oldest(BacklogQueue::Manual).await.unwrap().unwrap();
        assert_eq!(manual.trade_hash, "t2");
        assert_eq!(store.len(BacklogQueue::Auto).await.unwrap(), 1);
    }
}
