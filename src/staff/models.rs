use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a trade came to be marked paid.
///
/// Staff report the elapsed seconds between assignment and payment
/// confirmation as a number; automated paths write a string sentinel
/// instead. Sentinels are excluded from speed statistics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PaidMarker {
    Elapsed(f64),
    Sentinel(MarkSentinel),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarkSentinel {
    /// Force-closed by the expiration monitor.
    #[serde(alias = "Expired")]
    Expired,
    /// Settled by the exact-ledger policy without operator input.
    #[serde(alias = "Automatic")]
    Automatic,
}

impl PaidMarker {
    pub fn elapsed_seconds(&self) -> Option<f64> {
        match self {
            PaidMarker::Elapsed(secs) => Some(*secs),
            PaidMarker::Sentinel(_) => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, PaidMarker::Sentinel(MarkSentinel::Expired))
    }
}

/// One trade in a staff member's assigned list.
///
/// The list itself is append-only; entries are only ever updated in
/// place (`is_paid`, `marked_at`, `buyer_name`, `amount_paid`,
/// `flagged`) and never removed by automated assignment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignedTrade {
    pub trade_hash: String,
    pub fiat_amount_requested: Decimal,
    pub fiat_currency_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    pub is_paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marked_at: Option<PaidMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<Decimal>,
    #[serde(default)]
    pub flagged: bool,
    pub assigned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AssignedTrade {
    pub fn new(
        trade_hash: String,
        fiat_amount_requested: Decimal,
        fiat_currency_code: String,
    ) -> Self {
        Self {
            trade_hash,
            fiat_amount_requested,
            fiat_currency_code,
            buyer_name: None,
            payment_reference: None,
            is_paid: false,
            marked_at: None,
            amount_paid: None,
            flagged: false,
            assigned_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_paid && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// A human operator processing assigned trades.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Staff {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub assigned_trades: Vec<AssignedTrade>,
    pub created_at: DateTime<Utc>,
}

impl Staff {
    pub fn new(id: String, name: String, email: String, role: String) -> Self {
        Self {
            id,
            name,
            email,
            role,
            assigned_trades: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// A staff member is eligible for automatic assignment iff no
    /// assigned trade is still unpaid. The expiration monitor keeps
    /// this accurate for manual batches by force-marking overdue
    /// entries paid.
    pub fn is_eligible(&self) -> bool {
        !self.assigned_trades.iter().any(|t| !t.is_paid)
    }

    pub fn load(&self) -> usize {
        self.assigned_trades.len()
    }

    pub fn find_trade(&self, trade_hash: &str) -> Option<&AssignedTrade> {
        self.assigned_trades
            .iter()
            .find(|t| t.trade_hash == trade_hash)
    }

    pub fn find_trade_mut(&mut self, trade_hash: &str) -> Option<&mut AssignedTrade> {
        self.assigned_trades
            .iter_mut()
            .find(|t| t.trade_hash == trade_hash)
    }
}
