use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::AssignmentMode;
use crate::dispatch::{AssignmentOutcome, TradeDispatcher};
use crate::error::{AppError, AppResult, DispatchError, ReconcileError, StoreError};
use crate::exchange::{fetch_chat_with_retry, ChatFetch, MessageSink, TradeSource};
use crate::ledger::{LedgerRecord, LedgerStore};
use crate::reconcile::matcher::{MatchStrategy, MatchVerdict};
use crate::staff::{MarkSentinel, PaidMarker};
use crate::store::{MessageLog, StaffStore, VersionedStaff};

/// Outcome of matching a staff-reported payment to one of their
/// assigned trades.
#[derive(Debug, Clone)]
pub struct ReportedMatch {
    pub trade_hash: String,
    pub flagged: bool,
}

pub struct ReconcilerOptions {
    pub assignment_mode: AssignmentMode,
    pub overwrite_on_remark: bool,
    pub chat_fetch_attempts: u32,
    pub chat_fetch_delay: Duration,
    pub cas_max_retries: u32,
}

/// Trade intake plus both settlement policies: the exact-decimal
/// ledger for automated trades and heuristic amount matching for
/// staff-reported payments.
pub struct Reconciler {
    staff: Arc<dyn StaffStore>,
    ledger: Arc<dyn LedgerStore>,
    messages: Arc<dyn MessageLog>,
    dispatcher: Arc<TradeDispatcher>,
    source: Arc<dyn TradeSource>,
    sink: Arc<dyn MessageSink>,
    matcher: Box<dyn MatchStrategy>,
    options: ReconcilerOptions,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        staff: Arc<dyn StaffStore>,
        ledger: Arc<dyn LedgerStore>,
        messages: Arc<dyn MessageLog>,
        dispatcher: Arc<TradeDispatcher>,
        source: Arc<dyn TradeSource>,
        sink: Arc<dyn MessageSink>,
        matcher: Box<dyn MatchStrategy>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            staff,
            ledger,
            messages,
            dispatcher,
            source,
            sink,
            matcher,
            options,
        }
    }

    /// Intake for a trade-started event: open the ledger record,
    /// greet the buyer with the payment reference, kick off chat
    /// capture, and route the trade. Re-starting a tracked trade
    /// fails with `AlreadyStarted`.
    pub async fn start_trade(self: &Arc<Self>, trade_hash: &str) -> AppResult<AssignmentOutcome> {
        let details = self.source.get_trade(trade_hash).await?;

        let record = LedgerRecord::open(&details);
        let reference = record.expected_payment_reference.clone();
        self.ledger.create(record).await?;

        // Buyer-facing; losing the greeting never fails the intake.
        let greeting = format!(
            "Please include the payment reference {} with your transfer of {} {}.",
            reference, details.fiat_amount_requested, details.fiat_currency_code
        );
        if let Err(e) = self.sink.post_message(trade_hash, &greeting).await {
            warn!("Could not post greeting for trade {}: {}", trade_hash, e);
        }

        self.spawn_chat_capture(trade_hash.to_string());

        match self.options.assignment_mode {
            AssignmentMode::Auto => self.dispatcher.assign(&details).await,
            AssignmentMode::Manual => {
                self.dispatcher.enqueue_manual(&details).await?;
                Ok(AssignmentOutcome::Queued)
            }
        }
    }

    /// Background chat capture: the exchange populates the transcript
    /// lazily, so this polls with a bounded retry and archives what it
    /// gets. A terminal give-up is logged, never raised.
    pub fn spawn_chat_capture(self: &Arc<Self>, trade_hash: String) {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let fetched = fetch_chat_with_retry(
                reconciler.source.as_ref(),
                &trade_hash,
                reconciler.options.chat_fetch_attempts,
                reconciler.options.chat_fetch_delay,
            )
            .await;

            match fetched {
                ChatFetch::Messages(messages) => {
                    if let Err(e) = reconciler.messages.append(&trade_hash, &messages).await {
                        warn!("Could not archive chat for trade {}: {}", trade_hash, e);
                    }
                }
                ChatFetch::GaveUp { attempts } => {
                    warn!(
                        "Gave up fetching chat for trade {} after {} attempts",
                        trade_hash, attempts
                    );
                }
            }
        });
    }

    /// Exact ledger policy: atomically add `delta` to the trade's
    /// fiat balance and return the updated record.
    pub async fn record_payment(
        &self,
        trade_hash: &str,
        delta: Decimal,
    ) -> AppResult<LedgerRecord> {
        let record = self.ledger.apply_delta(trade_hash, delta).await?;
        if record.is_settled() {
            info!(
                "Trade {} settled: balance {} against expected {}",
                trade_hash, record.fiat_balance, record.expected_fiat_amount
            );
        }
        Ok(record)
    }

    /// Automated settlement path: an incoming bank transfer carries
    /// the payment reference, which locates the ledger record. The
    /// delta is applied, and once the balance covers the expected
    /// amount the crypto is released and the assigned trade is closed
    /// with the automatic sentinel.
    pub async fn apply_reference_payment(
        &self,
        reference: &str,
        amount: Decimal,
    ) -> AppResult<LedgerRecord> {
        let record = self
            .ledger
            .find_by_payment_reference(reference)
            .await?
            .ok_or_else(|| ReconcileError::TradeNotFound(reference.to_string()))?;

        let mut updated = self.ledger.apply_delta(&record.trade_hash, amount).await?;
        if updated.is_settled() && !updated.crypto_released {
            self.ledger
                .set_crypto_released(&updated.trade_hash, true)
                .await?;
            updated.crypto_released = true;
            info!(
                "Trade {} settled by reference payment, crypto released",
                updated.trade_hash
            );
            // The trade may still sit in the backlog rather than on a
            // staff list; closing it there is not this path's job.
            if let Err(e) = self
                .mark_paid(
                    &updated.trade_hash,
                    PaidMarker::Sentinel(MarkSentinel::Automatic),
                    None,
                    Some(updated.fiat_balance),
                )
                .await
            {
                warn!(
                    "Could not close trade {} after automatic settlement: {}",
                    updated.trade_hash, e
                );
            }
        }
        Ok(updated)
    }

    /// True iff the trade's accumulated balance covers the expected
    /// amount, by exact decimal comparison.
    pub async fn is_settled(&self, trade_hash: &str) -> AppResult<bool> {
        let record = self
            .ledger
            .get(trade_hash)
            .await?
            .ok_or_else(|| ReconcileError::TradeNotFound(trade_hash.to_string()))?;
        Ok(record.is_settled())
    }

    /// Heuristic policy: pair a staff-reported amount with one of
    /// that staff's unpaid trades, recording the reported amount and
    /// payer name on the matched entry. Each report overwrites the
    /// recorded name with the latest one; only `mark_paid` honours
    /// the `overwrite_on_remark` policy. A mismatched-but-matching
    /// amount is kept and flagged for review.
    pub async fn report_payment(
        &self,
        staff_id: &str,
        reported: &str,
        payer_name: Option<String>,
    ) -> AppResult<ReportedMatch> {
        let amount = Decimal::from_str(reported.trim())?;

        for _ in 0..self.options.cas_max_retries {
            let Some(versioned) = self.staff.get(staff_id).await? else {
                return Err(DispatchError::StaffNotFound(staff_id.to_string()).into());
            };

            let mut staff = versioned.staff;
            let matched = staff
                .assigned_trades
                .iter_mut()
                .filter(|t| !t.is_paid)
                .find_map(|t| {
                    self.matcher
                        .evaluate(t.fiat_amount_requested, amount)
                        .map(|verdict| (t, verdict))
                });

            let Some((trade, verdict)) = matched else {
                return Err(ReconcileError::NoMatch {
                    staff_id: staff_id.to_string(),
                    reported: reported.to_string(),
                }
                .into());
            };

            trade.amount_paid = Some(amount);
            if payer_name.is_some() {
                trade.buyer_name = payer_name.clone();
            }
            trade.flagged = verdict == MatchVerdict::Flagged;
            let result = ReportedMatch {
                trade_hash: trade.trade_hash.clone(),
                flagged: trade.flagged,
            };

            match self.staff.compare_and_swap(versioned.version, staff).await {
                Ok(()) => {
                    if result.flagged {
                        warn!(
                            "Reported amount {} flagged against trade {} for staff {}",
                            reported, result.trade_hash, staff_id
                        );
                    }
                    return Ok(result);
                }
                Err(AppError::Store(StoreError::VersionConflict { .. })) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Unavailable("report retries exhausted".into()).into())
    }

    /// Locate the trade across all staff and close it as paid.
    /// Existing operator-entered name/amount values survive a re-mark
    /// unless `overwrite_on_remark` is set. Frees a backlog slot.
    pub async fn mark_paid(
        &self,
        trade_hash: &str,
        marked_at: PaidMarker,
        payer_name: Option<String>,
        amount_paid: Option<Decimal>,
    ) -> AppResult<()> {
        for _ in 0..self.options.cas_max_retries {
            let Some(versioned) = self.find_holder(trade_hash).await? else {
                return Err(ReconcileError::TradeNotFound(trade_hash.to_string()).into());
            };

            let mut staff = versioned.staff;
            let Some(trade) = staff.find_trade_mut(trade_hash) else {
                // Holder changed between lookup and mutation; retry.
                continue;
            };

            trade.is_paid = true;
            trade.marked_at = Some(marked_at.clone());
            if payer_name.is_some() && (self.options.overwrite_on_remark || trade.buyer_name.is_none())
            {
                trade.buyer_name = payer_name.clone();
            }
            if amount_paid.is_some() && (self.options.overwrite_on_remark || trade.amount_paid.is_none())
            {
                trade.amount_paid = amount_paid;
            }

            match self.staff.compare_and_swap(versioned.version, staff).await {
                Ok(()) => {
                    info!("Trade {} marked paid", trade_hash);
                    if let Err(e) = self.dispatcher.drain_one().await {
                        warn!("Post-mark backlog drain failed: {}", e);
                    }
                    return Ok(());
                }
                Err(AppError::Store(StoreError::VersionConflict { .. })) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Unavailable("mark retries exhausted".into()).into())
    }

    /// Refresh a tracked trade's details from the exchange. Used when
    /// the buyer edits the trade after intake.
    pub async fn update_trade_details(&self, trade_hash: &str) -> AppResult<()> {
        let details = self.source.get_trade(trade_hash).await?;

        for _ in 0..self.options.cas_max_retries {
            let Some(versioned) = self.find_holder(trade_hash).await? else {
                return Err(ReconcileError::TradeNotFound(trade_hash.to_string()).into());
            };

            let mut staff = versioned.staff;
            let Some(trade) = staff.find_trade_mut(trade_hash) else {
                continue;
            };

            trade.fiat_amount_requested = details.fiat_amount_requested;
            trade.fiat_currency_code = details.fiat_currency_code.clone();
            if details.buyer_name.is_some() {
                trade.buyer_name = details.buyer_name.clone();
            }

            match self.staff.compare_and_swap(versioned.version, staff).await {
                Ok(()) => return Ok(()),
                Err(AppError::Store(StoreError::VersionConflict { .. })) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Unavailable("update retries exhausted".into()).into())
    }

    /// Elapsed marker for a trade paid right now, measured from its
    /// assignment time.
    pub async fn elapsed_marker(&self, trade_hash: &str) -> AppResult<PaidMarker> {
        let Some(versioned) = self.find_holder(trade_hash).await? else {
            return Err(ReconcileError::TradeNotFound(trade_hash.to_string()).into());
        };
        let trade = versioned
            .staff
            .find_trade(trade_hash)
            .ok_or_else(|| ReconcileError::TradeNotFound(trade_hash.to_string()))?;
        let elapsed = (Utc::now() - trade.assigned_at).num_milliseconds() as f64 / 1000.0;
        Ok(PaidMarker::Elapsed(elapsed.max(0.0)))
    }

    async fn find_holder(&self, trade_hash: &str) -> AppResult<Option<VersionedStaff>> {
        for versioned in self.staff.list().await? {
            if versioned.staff.find_trade(trade_hash).is_some() {
                return Ok(Some(versioned));
            }
        }
        Ok(None)
    }
}
