use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult, StoreError};
use crate::staff::{MarkSentinel, PaidMarker};
use crate::store::{ExpirationBatch, ExpirationStore, StaffStore};

use super::scheduler::TradeDispatcher;

/// One-shot deadline enforcement for manual batches.
///
/// Each armed batch sleeps until its deadline, then sweeps the staff
/// document: every still-unpaid overdue trade is marked paid with the
/// `expired` sentinel so the staff becomes eligible again. The durable
/// batch record is only deleted after a successful sweep, and the
/// startup recovery scan re-arms whatever records survive a restart.
pub struct ExpirationMonitor {
    staff: Arc<dyn StaffStore>,
    expirations: Arc<dyn ExpirationStore>,
    dispatcher: Arc<TradeDispatcher>,
    retry_delay: Duration,
    cas_max_retries: u32,
}

impl ExpirationMonitor {
    pub fn new(
        staff: Arc<dyn StaffStore>,
        expirations: Arc<dyn ExpirationStore>,
        dispatcher: Arc<TradeDispatcher>,
        retry_delay: Duration,
        cas_max_retries: u32,
    ) -> Self {
        Self {
            staff,
            expirations,
            dispatcher,
            retry_delay,
            cas_max_retries,
        }
    }

    /// Spawn the one-shot timer for a batch. Past deadlines fire
    /// immediately, which is how recovered batches catch up.
    pub fn arm(self: &Arc<Self>, batch: ExpirationBatch) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let wait = (batch.deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            loop {
                match monitor.sweep(&batch).await {
                    Ok(expired) => {
                        info!(
                            "Expiration batch {} swept, {} trades expired",
                            batch.batch_id, expired
                        );
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Expiration sweep for batch {} failed, retrying: {}",
                            batch.batch_id, e
                        );
                        tokio::time::sleep(monitor.retry_delay).await;
                    }
                }
            }
        })
    }

    /// Mark every overdue unpaid trade on the batch's staff, delete
    /// the batch record, then hand a freed slot to the backlog.
    /// Returns the number of trades expired.
    pub async fn sweep(&self, batch: &ExpirationBatch) -> AppResult<usize> {
        let mut expired = 0;
        let now = Utc::now();

        let mut attempts = 0;
        loop {
            let Some(versioned) = self.staff.get(&batch.staff_id).await? else {
                // Staff deleted out from under the batch; nothing to
                // sweep, but the record must still go.
                warn!(
                    "Staff {} missing for expiration batch {}",
                    batch.staff_id, batch.batch_id
                );
                break;
            };

            let mut staff = versioned.staff;
            expired = 0;
            for trade in &mut staff.assigned_trades {
                if trade.is_overdue(now) {
                    trade.is_paid = true;
                    trade.marked_at = Some(PaidMarker::Sentinel(MarkSentinel::Expired));
                    expired += 1;
                }
            }

            if expired == 0 {
                break;
            }

            match self.staff.compare_and_swap(versioned.version, staff).await {
                Ok(()) => break,
                Err(e @ AppError::Store(StoreError::VersionConflict { .. })) => {
                    attempts += 1;
                    if attempts >= self.cas_max_retries {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.expirations.delete(batch.batch_id).await?;

        if expired > 0 {
            if let Err(e) = self.dispatcher.drain_one().await {
                // The expiry itself is committed; the backlog catches
                // up on the next paid/expired event.
                warn!("Post-expiry backlog drain failed: {}", e);
            }
        }

        Ok(expired)
    }

    /// Re-arm every durable batch record found at startup.
    pub async fn recover(self: &Arc<Self>) -> AppResult<usize> {
        let batches = self.expirations.list().await?;
        let count = batches.len();
        for batch in batches {
            info!(
                "Recovering expiration batch {} for staff {} (deadline {})",
                batch.batch_id, batch.staff_id, batch.deadline
            );
            self.arm(batch);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;
    use crate::staff::{AssignedTrade, Staff};
    use crate::store::{
        BacklogEntry, BacklogQueue, BacklogStore, MemoryBacklogStore, MemoryExpirationStore,
        MemoryStaffStore,
    };

    struct Fixture {
        staff: Arc<MemoryStaffStore>,
        backlog: Arc<MemoryBacklogStore>,
        expirations: Arc<MemoryExpirationStore>,
        monitor: Arc<ExpirationMonitor>,
    }

    fn fixture() -> Fixture {
        let staff: Arc<MemoryStaffStore> = Arc::new(MemoryStaffStore::new());
        let backlog: Arc<MemoryBacklogStore> = Arc::new(MemoryBacklogStore::new());
        let expirations: Arc<MemoryExpirationStore> = Arc::new(MemoryExpirationStore::new());
        let dispatcher = Arc::new(TradeDispatcher::new(
            staff.clone(),
            backlog.clone(),
            expirations.clone(),
            5,
        ));
        let monitor = Arc::new(ExpirationMonitor::new(
            staff.clone(),
            expirations.clone(),
            dispatcher,
            Duration::from_millis(10),
            5,
        ));
        Fixture {
            staff,
            backlog,
            expirations,
            monitor,
        }
    }

    fn overdue_trade(hash: &str) -> AssignedTrade {
        AssignedTrade::new(hash.to_string(), dec!(50), "USD".to_string())
            .with_expiry(Utc::now() - chrono::Duration::seconds(1))
    }

    #[tokio::test]
    async fn test_sweep_expires_unpaid_overdue_trades() {
        let f = fixture();
        let mut staff = Staff::new(
            "c".to_string(),
            "Casey".to_string(),
            "c@example.com".to_string(),
            "Payer".to_string(),
        );
        staff.assigned_trades.push(overdue_trade("m1"));
        staff.assigned_trades.push(overdue_trade("m2"));
        let mut paid = overdue_trade("m3");
        paid.is_paid = true;
        paid.marked_at = Some(PaidMarker::Elapsed(12.0));
        staff.assigned_trades.push(paid);
        f.staff.insert(staff).await.unwrap();

        let batch = ExpirationBatch {
            batch_id: Uuid::new_v4(),
            staff_id: "c".to_string(),
            deadline: Utc::now() - chrono::Duration::seconds(1),
        };
        f.expirations.put(batch.clone()).await.unwrap();

        let expired = f.monitor.sweep(&batch).await.unwrap();
        assert_eq!(expired, 2);
        assert!(f.expirations.list().await.unwrap().is_empty());

        let versioned = f.staff.get("c").await.unwrap().unwrap();
        for trade in &versioned.staff.assigned_trades {
            assert!(trade.is_paid);
        }
        let m1 = versioned.staff.find_trade("m1").unwrap();
        assert!(matches!(
            m1.marked_at,
            Some(PaidMarker::Sentinel(MarkSentinel::Expired))
        ));
        // A genuinely paid trade keeps its original marker.
        let m3 = versioned.staff.find_trade("m3").unwrap();
        assert!(matches!(m3.marked_at, Some(PaidMarker::Elapsed(_))));
    }

    #[tokio::test]
    async fn test_sweep_frees_a_backlog_slot() {
        let f = fixture();
        let mut staff = Staff::new(
            "c".to_string(),
            "Casey".to_string(),
            "c@example.com".to_string(),
            "Payer".to_string(),
        );
        staff.assigned_trades.push(overdue_trade("m1"));
        f.staff.insert(staff).await.unwrap();

        f.backlog
            .push(
                BacklogQueue::Auto,
                BacklogEntry {
                    trade_hash: "waiting".to_string(),
                    fiat_amount_requested: dec!(75),
                    fiat_currency_code: "USD".to_string(),
                    enqueued_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let batch = ExpirationBatch {
            batch_id: Uuid::new_v4(),
            staff_id: "c".to_string(),
            deadline: Utc::now() - chrono::Duration::seconds(1),
        };
        f.expirations.put(batch.clone()).await.unwrap();
        f.monitor.sweep(&batch).await.unwrap();

        let versioned = f.staff.get("c").await.unwrap().unwrap();
        assert!(versioned.staff.find_trade("waiting").is_some());
        assert_eq!(f.backlog.len(BacklogQueue::Auto).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_armed_batch_fires_after_deadline() {
        let f = fixture();
        let mut staff = Staff::new(
            "c".to_string(),
            "Casey".to_string(),
            "c@example.com".to_string(),
            "Payer".to_string(),
        );
        staff.assigned_trades.push(
            AssignedTrade::new("m1".to_string(), dec!(50), "USD".to_string())
                .with_expiry(Utc::now() + chrono::Duration::milliseconds(50)),
        );
        f.staff.insert(staff).await.unwrap();

        let batch = ExpirationBatch {
            batch_id: Uuid::new_v4(),
            staff_id: "c".to_string(),
            deadline: Utc::now() + chrono::Duration::milliseconds(50),
        };
        f.expirations.put(batch.clone()).await.unwrap();

        f.monitor.arm(batch).await.unwrap();

        let versioned = f.staff.get("c").await.unwrap().unwrap();
        let trade = versioned.staff.find_trade("m1").unwrap();
        assert!(trade.is_paid);
        assert!(matches!(
            trade.marked_at,
            Some(PaidMarker::Sentinel(MarkSentinel::Expired))
        ));
        assert!(f.expirations.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_rearms_persisted_batches() {
        let f = fixture();
        let mut staff = Staff::new(
            "c".to_string(),
            "Casey".to_string(),
            "c@example.com".to_string(),
            "Payer".to_string(),
        );
        staff.assigned_trades.push(overdue_trade("m1"));
        f.staff.insert(staff).await.unwrap();

        f.expirations
            .put(ExpirationBatch {
                batch_id: Uuid::new_v4(),
                staff_id: "c".to_string(),
                deadline: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();

        let recovered = f.monitor.recover().await.unwrap();
        assert_eq!(recovered, 1);

        // The recovered batch fires immediately; give the task a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let versioned = f.staff.get("c").await.unwrap().unwrap();
        assert!(versioned.staff.find_trade("m1").unwrap().is_paid);
    }
}
