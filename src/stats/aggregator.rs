use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::AppResult;
use crate::staff::{AssignedTrade, Staff};
use crate::store::StaffStore;

/// Speed baseline for the score bonus: settling at or under this
/// many seconds earns the full bonus, scaling linearly to zero.
const SPEED_BASELINE_SECONDS: f64 = 600.0;

/// Per-staff performance snapshot. Derived, never authoritative;
/// always recomputable from the staff directory.
#[derive(Debug, Clone, Serialize)]
pub struct StaffStatistics {
    pub staff_id: String,
    pub name: String,
    pub total_trades: usize,
    pub paid_trades: usize,
    pub unpaid_trades: usize,
    pub expired_trades: usize,
    pub flagged_trades: usize,
    pub total_requested: Decimal,
    pub total_paid: Decimal,
    /// Mean seconds from assignment to payment confirmation over
    /// trades with a numeric marker; `None` when no trade has one.
    pub average_speed_seconds: Option<f64>,
    /// Share of amount-reporting paid trades whose reported amount
    /// equalled the requested amount exactly.
    pub accuracy: f64,
    /// Composite 0-10 score: accuracy (up to 5) + paid ratio (up to
    /// 3) + speed bonus (up to 2).
    pub score: f64,
    /// Paid trades whose numeric fields were missing or malformed and
    /// were excluded from the averages above.
    pub skipped_entries: usize,
}

/// Directory-wide snapshot with the global mispayment total.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub staff: Vec<StaffStatistics>,
    /// `sum(requested) - sum(paid)` over all amount-reporting paid
    /// trades. Positive means buyers underpaid overall.
    pub global_mispayment: Decimal,
    pub computed_at: DateTime<Utc>,
}

/// Computes statistics from the staff directory, serving a cached
/// snapshot within a short TTL so dashboard polling does not hammer
/// the store.
pub struct StatsAggregator {
    staff: Arc<dyn StaffStore>,
    ttl: Duration,
    cache: RwLock<Option<StatisticsSnapshot>>,
}

impl StatsAggregator {
    pub fn new(staff: Arc<dyn StaffStore>, ttl: Duration) -> Self {
        Self {
            staff,
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub async fn compute(&self) -> AppResult<StatisticsSnapshot> {
        {
            let cache = self.cache.read();
            if let Some(snapshot) = cache.as_ref() {
                let age = Utc::now() - snapshot.computed_at;
                if age.to_std().unwrap_or(Duration::MAX) < self.ttl {
                    debug!("Serving cached statistics snapshot");
                    return Ok(snapshot.clone());
                }
            }
        }

        let directory = self.staff.list().await?;
        let mut per_staff = Vec::with_capacity(directory.len());
        let mut global_mispayment = Decimal::ZERO;

        for versioned in directory {
            let stats = compute_for_staff(&versioned.staff);
            global_mispayment += stats.mispayment;
            per_staff.push(stats.statistics);
        }

        let snapshot = StatisticsSnapshot {
            staff: per_staff,
            global_mispayment,
            computed_at: Utc::now(),
        };

        *self.cache.write() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

struct StaffComputation {
    statistics: StaffStatistics,
    mispayment: Decimal,
}

fn compute_for_staff(staff: &Staff) -> StaffComputation {
    let mut paid = 0usize;
    let mut expired = 0usize;
    let mut flagged = 0usize;
    let mut skipped = 0usize;
    let mut total_requested = Decimal::ZERO;
    let mut total_paid = Decimal::ZERO;
    let mut mispayment = Decimal::ZERO;
    let mut speed_sum = 0.0f64;
    let mut speed_count = 0usize;
    let mut accurate = 0usize;
    let mut reporting = 0usize;

    for trade in &staff.assigned_trades {
        total_requested += trade.fiat_amount_requested;
        if !trade.is_paid {
            continue;
        }
        paid += 1;

        if trade.marked_at.as_ref().map(|m| m.is_expired()).unwrap_or(false) {
            // Force-closed by the expiration monitor; no payment data
            // to fold into speed or accuracy.
            expired += 1;
            continue;
        }

        if trade.flagged {
            flagged += 1;
        }

        match speed_of(trade) {
            Some(seconds) => {
                speed_sum += seconds;
                speed_count += 1;
            }
            None => skipped += 1,
        }

        match trade.amount_paid {
            Some(amount) => {
                reporting += 1;
                total_paid += amount;
                mispayment += trade.fiat_amount_requested - amount;
                if amount == trade.fiat_amount_requested {
                    accurate += 1;
                }
            }
            None => skipped += 1,
        }
    }

    let total = staff.assigned_trades.len();
    let average_speed_seconds = if speed_count > 0 {
        Some(speed_sum / speed_count as f64)
    } else {
        None
    };
    let accuracy = if reporting > 0 {
        accurate as f64 / reporting as f64
    } else {
        1.0
    };
    let paid_ratio = if total > 0 {
        paid as f64 / total as f64
    } else {
        0.0
    };
    let speed_bonus = average_speed_seconds
        .map(|avg| 2.0 * (1.0 - (avg / SPEED_BASELINE_SECONDS).min(1.0)))
        .unwrap_or(0.0);
    let score = (accuracy * 5.0 + paid_ratio * 3.0 + speed_bonus).clamp(0.0, 10.0);

    StaffComputation {
        statistics: StaffStatistics {
            staff_id: staff.id.clone(),
            name: staff.name.clone(),
            total_trades: total,
            paid_trades: paid,
            unpaid_trades: total - paid,
            expired_trades: expired,
            flagged_trades: flagged,
            total_requested,
            total_paid,
            average_speed_seconds,
            accuracy,
            score,
            skipped_entries: skipped,
        },
        mispayment,
    }
}

/// Numeric settlement speed in seconds, when the marker carries one.
/// Sentinels and negative garbage are excluded rather than coerced.
fn speed_of(trade: &AssignedTrade) -> Option<f64> {
    let seconds = trade.marked_at.as_ref()?.elapsed_seconds()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(seconds)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::staff::{MarkSentinel, PaidMarker};
    use crate::store::MemoryStaffStore;

    fn trade(hash: &str, requested: Decimal) -> AssignedTrade {
        AssignedTrade::new(hash.to_string(), requested, "USD".to_string())
    }

    fn paid_trade(hash: &str, requested: Decimal, paid: Decimal, speed: f64) -> AssignedTrade {
        let mut t = trade(hash, requested);
        t.is_paid = true;
        t.marked_at = Some(PaidMarker::Elapsed(speed));
        t.amount_paid = Some(paid);
        t.flagged = paid != requested;
        t
    }

    async fn seeded(staff: Staff) -> Arc<MemoryStaffStore> {
        let store = Arc::new(MemoryStaffStore::new());
        store.insert(staff).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_counts_and_mispayment() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        staff
            .assigned_trades
            .push(paid_trade("t1", dec!(100.00), dec!(100.00), 60.0));
        staff
            .assigned_trades
            .push(paid_trade("t2", dec!(200.00), dec!(195.00), 120.0));
        staff.assigned_trades.push(trade("t3", dec!(50.00)));

        let aggregator = StatsAggregator::new(seeded(staff).await, Duration::from_secs(30));
        let snapshot = aggregator.compute().await.unwrap();

        let s = &snapshot.staff[0];
        assert_eq!(s.total_trades, 3);
        assert_eq!(s.paid_trades, 2);
        assert_eq!(s.unpaid_trades, 1);
        assert_eq!(s.flagged_trades, 1);
        assert_eq!(s.total_requested, dec!(350.00));
        assert_eq!(s.total_paid, dec!(295.00));
        assert_eq!(s.average_speed_seconds, Some(90.0));
        assert_eq!(s.accuracy, 0.5);
        assert_eq!(snapshot.global_mispayment, dec!(5.00));
    }

    #[tokio::test]
    async fn test_sentinels_excluded_from_speed_and_accuracy() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        staff
            .assigned_trades
            .push(paid_trade("t1", dec!(100.00), dec!(100.00), 30.0));
        let mut expired = trade("t2", dec!(100.00));
        expired.is_paid = true;
        expired.marked_at = Some(PaidMarker::Sentinel(MarkSentinel::Expired));
        staff.assigned_trades.push(expired);

        let aggregator = StatsAggregator::new(seeded(staff).await, Duration::from_secs(30));
        let snapshot = aggregator.compute().await.unwrap();

        let s = &snapshot.staff[0];
        assert_eq!(s.paid_trades, 2);
        assert_eq!(s.expired_trades, 1);
        assert_eq!(s.average_speed_seconds, Some(30.0));
        assert_eq!(s.accuracy, 1.0);
        // Expired trades carry no reported amount, so mispayment only
        // reflects the genuinely reported one.
        assert_eq!(snapshot.global_mispayment, dec!(0.00));
    }

    #[tokio::test]
    async fn test_missing_fields_skip_not_fail() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        let mut bare = trade("t1", dec!(100.00));
        bare.is_paid = true; // paid with no marker and no amount
        staff.assigned_trades.push(bare);

        let aggregator = StatsAggregator::new(seeded(staff).await, Duration::from_secs(30));
        let snapshot = aggregator.compute().await.unwrap();

        let s = &snapshot.staff[0];
        assert_eq!(s.paid_trades, 1);
        assert_eq!(s.skipped_entries, 2);
        assert_eq!(s.average_speed_seconds, None);
    }

    #[tokio::test]
    async fn test_score_is_clamped() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        staff
            .assigned_trades
            .push(paid_trade("t1", dec!(100.00), dec!(100.00), 0.0));

        let aggregator = StatsAggregator::new(seeded(staff).await, Duration::from_secs(30));
        let snapshot = aggregator.compute().await.unwrap();

        let s = &snapshot.staff[0];
        // Perfect accuracy, all paid, instant settlement: 5 + 3 + 2.
        assert_eq!(s.score, 10.0);
        assert!(s.score <= 10.0);
    }

    #[tokio::test]
    async fn test_snapshot_is_cached_within_ttl() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        staff
            .assigned_trades
            .push(paid_trade("t1", dec!(100.00), dec!(100.00), 10.0));
        let store = seeded(staff).await;

        let aggregator = StatsAggregator::new(store.clone(), Duration::from_secs(60));
        let first = aggregator.compute().await.unwrap();

        // Mutate the directory; within the TTL callers still see the
        // original snapshot.
        let mut versioned = store.get("a").await.unwrap().unwrap();
        versioned.staff.assigned_trades.push(trade("t2", dec!(5)));
        store
            .compare_and_swap(versioned.version, versioned.staff)
            .await
            .unwrap();

        let second = aggregator.compute().await.unwrap();
        assert_eq!(second.computed_at, first.computed_at);
        assert_eq!(second.staff[0].total_trades, 1);
    }

    #[tokio::test]
    async fn test_expired_ttl_recomputes() {
        let mut staff = Staff::new(
            "a".to_string(),
            "Ada".to_string(),
            "a@example.com".to_string(),
            "Payer".to_string(),
        );
        staff.assigned_trades.push(trade("t1", dec!(5)));
        let store = seeded(staff).await;

        let aggregator = StatsAggregator::new(store.clone(), Duration::from_millis(1));
        let first = aggregator.compute().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut versioned = store.get("a").await.unwrap().unwrap();
        versioned.staff.assigned_trades.push(trade("t2", dec!(5)));
        store
            .compare_and_swap(versioned.version, versioned.staff)
            .await
            .unwrap();

        let second = aggregator.compute().await.unwrap();
        assert!(second.computed_at > first.computed_at);
        assert_eq!(second.staff[0].total_trades, 2);
    }
}
