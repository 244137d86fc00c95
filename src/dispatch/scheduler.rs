use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, DispatchError, StoreError};
use crate::exchange::TradeDetails;
use crate::staff::{AssignedTrade, Staff};
use crate::store::{
    BacklogEntry, BacklogQueue, BacklogStore, ExpirationBatch, ExpirationStore, StaffStore,
    VersionedStaff,
};

/// Result of routing a newly started trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Assigned { staff_id: String },
    Queued,
}

/// Least-loaded greedy dispatcher over the staff directory.
///
/// Greedy is deliberate: staff pools are small and per-staff trade
/// volume is low, so an O(staff) pick beats anything global-optimal.
pub struct TradeDispatcher {
    staff: Arc<dyn StaffStore>,
    backlog: Arc<dyn BacklogStore>,
    expirations: Arc<dyn ExpirationStore>,
    cas_max_retries: u32,
}

impl TradeDispatcher {
    pub fn new(
        staff: Arc<dyn StaffStore>,
        backlog: Arc<dyn BacklogStore>,
        expirations: Arc<dyn ExpirationStore>,
        cas_max_retries: u32,
    ) -> Self {
        Self {
            staff,
            backlog,
            expirations,
            cas_max_retries,
        }
    }

    /// Eligible staff with the fewest assigned trades; ties go to the
    /// first staff encountered in directory iteration order.
    fn pick_least_loaded<'a>(
        candidates: impl Iterator<Item = &'a VersionedStaff>,
    ) -> Option<&'a VersionedStaff> {
        let mut best: Option<&'a VersionedStaff> = None;
        for candidate in candidates {
            match best {
                Some(current) if candidate.staff.load() >= current.staff.load() => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    async fn already_tracked(&self, trade_hash: &str) -> AppResult<Option<AssignmentOutcome>> {
        for versioned in self.staff.list().await? {
            if versioned.staff.find_trade(trade_hash).is_some() {
                return Ok(Some(AssignmentOutcome::Assigned {
                    staff_id: versioned.staff.id,
                }));
            }
        }
        for queue in [BacklogQueue::Auto, BacklogQueue::Manual] {
            if self
                .backlog
                .snapshot(queue)
                .await?
                .iter()
                .any(|e| e.trade_hash == trade_hash)
            {
                return Ok(Some(AssignmentOutcome::Queued));
            }
        }
        Ok(None)
    }

    /// Route a newly started trade: assign to the least-loaded
    /// eligible staff, or queue it when everyone has an unpaid trade
    /// pending. Webhook redelivery is a no-op returning the existing
    /// placement (a trade hash lives in at most one place).
    pub async fn assign(&self, details: &TradeDetails) -> AppResult<AssignmentOutcome> {
        if let Some(existing) = self.already_tracked(&details.trade_hash).await? {
            info!(
                "Trade {} already tracked, keeping existing placement",
                details.trade_hash
            );
            return Ok(existing);
        }

        let mut last_conflict: Option<AppError> = None;
        for _ in 0..self.cas_max_retries {
            let directory = self.staff.list().await?;
            let chosen =
                Self::pick_least_loaded(directory.iter().filter(|v| v.staff.is_eligible()));

            let Some(chosen) = chosen else {
                info!(
                    "All staff have pending unpaid trades, queueing trade {}",
                    details.trade_hash
                );
                self.backlog
                    .push(
                        BacklogQueue::Auto,
                        BacklogEntry {
                            trade_hash: details.trade_hash.clone(),
                            fiat_amount_requested: details.fiat_amount_requested,
                            fiat_currency_code: details.fiat_currency_code.clone(),
                            enqueued_at: Utc::now(),
                        },
                    )
                    .await?;
                return Ok(AssignmentOutcome::Queued);
            };

            let mut staff = chosen.staff.clone();
            staff.assigned_trades.push(AssignedTrade::new(
                details.trade_hash.clone(),
                details.fiat_amount_requested,
                details.fiat_currency_code.clone(),
            ));

            let staff_id = staff.id.clone();
            match self.staff.compare_and_swap(chosen.version, staff).await {
                Ok(()) => {
                    info!("Trade {} assigned to {}", details.trade_hash, staff_id);
                    return Ok(AssignmentOutcome::Assigned { staff_id });
                }
                Err(e @ AppError::Store(StoreError::VersionConflict { .. })) => {
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict
            .unwrap_or_else(|| StoreError::Unavailable("assign retries exhausted".into()).into()))
    }

    /// Move the oldest backlog entry to the least-loaded eligible
    /// staff, if any. Idempotent: an empty backlog or a fully busy
    /// directory is a safe no-op returning `None`.
    pub async fn drain_one(&self) -> AppResult<Option<String>> {
        let directory = self.staff.list().await?;
        if !directory.iter().any(|v| v.staff.is_eligible()) {
            return Ok(None);
        }

        let Some(entry) = self.backlog.pop_oldest(BacklogQueue::Auto).await? else {
            return Ok(None);
        };

        match self.place(&entry).await {
            Ok(Some(staff_id)) => {
                info!("Backlog trade {} assigned to {}", entry.trade_hash, staff_id);
                Ok(Some(staff_id))
            }
            Ok(None) => {
                // Eligibility vanished between the check and the pop;
                // the entry goes back to wait for the next drain.
                warn!(
                    "No eligible staff for backlog trade {}, requeueing",
                    entry.trade_hash
                );
                self.backlog.push(BacklogQueue::Auto, entry).await?;
                Ok(None)
            }
            Err(e) => {
                self.backlog.push(BacklogQueue::Auto, entry).await?;
                Err(e)
            }
        }
    }

    /// CAS-append a popped backlog entry to the least-loaded eligible
    /// staff.
    async fn place(&self, entry: &BacklogEntry) -> AppResult<Option<String>> {
        let mut last_conflict: Option<AppError> = None;
        for _ in 0..self.cas_max_retries {
            let directory = self.staff.list().await?;
            let chosen =
                Self::pick_least_loaded(directory.iter().filter(|v| v.staff.is_eligible()));

            let Some(chosen) = chosen else {
                return Ok(None);
            };

            let mut staff = chosen.staff.clone();
            staff.assigned_trades.push(AssignedTrade::new(
                entry.trade_hash.clone(),
                entry.fiat_amount_requested,
                entry.fiat_currency_code.clone(),
            ));

            let staff_id = staff.id.clone();
            match self.staff.compare_and_swap(chosen.version, staff).await {
                Ok(()) => return Ok(Some(staff_id)),
                Err(e @ AppError::Store(StoreError::VersionConflict { .. })) => {
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict
            .unwrap_or_else(|| StoreError::Unavailable("place retries exhausted".into()).into()))
    }

    /// Queue a trade for manual processing.
    pub async fn enqueue_manual(&self, details: &TradeDetails) -> AppResult<()> {
        if self.already_tracked(&details.trade_hash).await?.is_some() {
            info!(
                "Trade {} already tracked, not enqueueing again",
                details.trade_hash
            );
            return Ok(());
        }
        self.backlog
            .push(
                BacklogQueue::Manual,
                BacklogEntry {
                    trade_hash: details.trade_hash.clone(),
                    fiat_amount_requested: details.fiat_amount_requested,
                    fiat_currency_code: details.fiat_currency_code.clone(),
                    enqueued_at: Utc::now(),
                },
            )
            .await
    }

    /// Pull up to `count` oldest manual-backlog trades into the named
    /// staff's list, each stamped with `now + time_limit`, and record
    /// the durable expiration batch. The caller arms the one-shot
    /// sweep for the returned batch.
    pub async fn assign_manual_batch(
        &self,
        staff_id: &str,
        count: u32,
        time_limit: Duration,
    ) -> AppResult<ExpirationBatch> {
        if count == 0 {
            return Err(DispatchError::InvalidArgument("count must be positive".into()).into());
        }
        if time_limit.is_zero() {
            return Err(
                DispatchError::InvalidArgument("time limit must be positive".into()).into(),
            );
        }

        let Some(current) = self.staff.get(staff_id).await? else {
            return Err(DispatchError::StaffNotFound(staff_id.to_string()).into());
        };

        let entries = self
            .backlog
            .pop_up_to(BacklogQueue::Manual, count as usize)
            .await?;
        if entries.is_empty() {
            return Err(DispatchError::EmptyQueue.into());
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(time_limit)
                .map_err(|_| DispatchError::InvalidArgument("time limit out of range".into()))?;

        let mut versioned = current;
        let mut last_conflict: Option<AppError> = None;
        for attempt in 0..self.cas_max_retries {
            if attempt > 0 {
                versioned = self
                    .staff
                    .get(staff_id)
                    .await?
                    .ok_or_else(|| DispatchError::StaffNotFound(staff_id.to_string()))?;
            }

            let mut staff: Staff = versioned.staff.clone();
            for entry in &entries {
                staff.assigned_trades.push(
                    AssignedTrade::new(
                        entry.trade_hash.clone(),
                        entry.fiat_amount_requested,
                        entry.fiat_currency_code.clone(),
                    )
                    .with_expiry(deadline),
                );
            }

            match self.staff.compare_and_swap(versioned.version, staff).await {
                Ok(()) => {
                    let batch = ExpirationBatch {
                        batch_id: Uuid::new_v4(),
                        staff_id: staff_id.to_string(),
                        deadline,
                    };
                    self.expirations.put(batch.clone()).await?;
                    info!(
                        "Manual batch {} of {} trades assigned to {} (deadline {})",
                        batch.batch_id,
                        entries.len(),
                        staff_id,
                        deadline
                    );
                    return Ok(batch);
                }
                Err(e @ AppError::Store(StoreError::VersionConflict { .. })) => {
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            StoreError::Unavailable("manual batch retries exhausted".into()).into()
        }))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::store::{MemoryBacklogStore, MemoryExpirationStore, MemoryStaffStore};

    fn details(hash: &str, amount: Decimal) -> TradeDetails {
        TradeDetails {
            trade_hash: hash.to_string(),
            fiat_amount_requested: amount,
            fiat_currency_code: "USD".to_string(),
            buyer_name: None,
        }
    }

    fn staff(id: &str) -> Staff {
        Staff::new(
            id.to_string(),
            format!("Staff {}", id),
            format!("{}@example.com", id),
            "Payer".to_string(),
        )
    }

    struct Fixture {
        staff: Arc<MemoryStaffStore>,
        backlog: Arc<MemoryBacklogStore>,
        dispatcher: TradeDispatcher,
    }

    fn fixture() -> Fixture {
        let staff: Arc<MemoryStaffStore> = Arc::new(MemoryStaffStore::new());
        let backlog: Arc<MemoryBacklogStore> = Arc::new(MemoryBacklogStore::new());
        let expirations = Arc::new(MemoryExpirationStore::new());
        let dispatcher = TradeDispatcher::new(
            staff.clone(),
            backlog.clone(),
            expirations,
            5,
        );
        Fixture {
            staff,
            backlog,
            dispatcher,
        }
    }

    async fn mark_all_paid(fixture: &Fixture, staff_id: &str) {
        let mut versioned = fixture.staff.get(staff_id).await.unwrap().unwrap();
        for trade in &mut versioned.staff.assigned_trades {
            trade.is_paid = true;
        }
        fixture
            .staff
            .compare_and_swap(versioned.version, versioned.staff)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_least_loaded_wins() {
        let f = fixture();

        // A carries two already-paid trades (still eligible, load 2);
        // B is empty. The next assign must go to B.
        let mut loaded = staff("a");
        for hash in ["t1", "t2"] {
            let mut trade = AssignedTrade::new(hash.to_string(), dec!(10), "USD".to_string());
            trade.is_paid = true;
            loaded.assigned_trades.push(trade);
        }
        f.staff.insert(loaded).await.unwrap();
        f.staff.insert(staff("b")).await.unwrap();

        let outcome = f.dispatcher.assign(&details("t3", dec!(10))).await.unwrap();
        assert_eq!(
            outcome,
            AssignmentOutcome::Assigned {
                staff_id: "b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_queues_when_no_staff_eligible() {
        let f = fixture();
        f.staff.insert(staff("a")).await.unwrap();

        // First trade occupies A; second has nowhere to go.
        f.dispatcher.assign(&details("t1", dec!(10))).await.unwrap();
        let outcome = f.dispatcher.assign(&details("t2", dec!(20))).await.unwrap();
        assert_eq!(outcome, AssignmentOutcome::Queued);
        assert_eq!(f.backlog.len(BacklogQueue::Auto).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backlog_drains_in_fifo_order() {
        let f = fixture();
        f.staff.insert(staff("a")).await.unwrap();
        f.dispatcher.assign(&details("t0", dec!(5))).await.unwrap();

        for hash in ["t1", "t2", "t3"] {
            let outcome = f.dispatcher.assign(&details(hash, dec!(5))).await.unwrap();
            assert_eq!(outcome, AssignmentOutcome::Queued);
        }

        for expected in ["t1", "t2", "t3"] {
            mark_all_paid(&f, "a").await;
            let assigned_to = f.dispatcher.drain_one().await.unwrap();
            assert_eq!(assigned_to.as_deref(), Some("a"));

            let versioned = f.staff.get("a").await.unwrap().unwrap();
            let last = versioned.staff.assigned_trades.last().unwrap();
            assert_eq!(last.trade_hash, expected);
        }
    }

    #[tokio::test]
    async fn test_drain_is_idempotent_on_empty_backlog() {
        let f = fixture();
        f.staff.insert(staff("a")).await.unwrap();

        assert_eq!(f.dispatcher.drain_one().await.unwrap(), None);
        assert_eq!(f.dispatcher.drain_one().await.unwrap(), None);
        let versioned = f.staff.get("a").await.unwrap().unwrap();
        assert!(versioned.staff.assigned_trades.is_empty());
    }

    #[tokio::test]
    async fn test_trade_hash_lives_in_one_place() {
        let f = fixture();
        f.staff.insert(staff("a")).await.unwrap();

        // Redelivered webhook while assigned.
        f.dispatcher.assign(&details("t1", dec!(10))).await.unwrap();
        f.dispatcher.assign(&details("t1", dec!(10))).await.unwrap();
        let versioned = f.staff.get("a").await.unwrap().unwrap();
        assert_eq!(versioned.staff.assigned_trades.len(), 1);
        assert_eq!(f.backlog.len(BacklogQueue::Auto).await.unwrap(), 0);

        // Redelivered webhook while queued.
        f.dispatcher.assign(&details("t2", dec!(10))).await.unwrap();
        f.dispatcher.assign(&details("t2", dec!(10))).await.unwrap();
        assert_eq!(f.backlog.len(BacklogQueue::Auto).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_batch_validation() {
        let f = fixture();
        f.staff.insert(staff("c")).await.unwrap();

        let err = f
            .dispatcher
            .assign_manual_batch("c", 0, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Dispatch(DispatchError::InvalidArgument(_))
        ));

        let err = f
            .dispatcher
            .assign_manual_batch("c", 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Dispatch(DispatchError::InvalidArgument(_))
        ));

        let err = f
            .dispatcher
            .assign_manual_batch("ghost", 3, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Dispatch(DispatchError::StaffNotFound(_))
        ));

        let err = f
            .dispatcher
            .assign_manual_batch("c", 3, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Dispatch(DispatchError::EmptyQueue)));
    }

    #[tokio::test]
    async fn test_manual_batch_attaches_deadline() {
        let f = fixture();
        f.staff.insert(staff("c")).await.unwrap();
        for hash in ["m1", "m2", "m3", "m4"] {
            f.dispatcher
                .enqueue_manual(&details(hash, dec!(25)))
                .await
                .unwrap();
        }

        let batch = f
            .dispatcher
            .assign_manual_batch("c", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(batch.staff_id, "c");

        let versioned = f.staff.get("c").await.unwrap().unwrap();
        assert_eq!(versioned.staff.assigned_trades.len(), 3);
        for trade in &versioned.staff.assigned_trades {
            assert_eq!(trade.expires_at, Some(batch.deadline));
            assert!(!trade.is_paid);
        }

        // Oldest three were pulled, the fourth stays queued.
        let hashes: Vec<&str> = versioned
            .staff
            .assigned_trades
            .iter()
            .map(|t| t.trade_hash.as_str())
            .collect();
        assert_eq!(hashes, vec!["m1", "m2", "m3"]);
        assert_eq!(f.backlog.len(BacklogQueue::Manual).await.unwrap(), 1);
    }
}
