use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::AssignmentOutcome;
use crate::staff::AssignedTrade;

// ========== REQUEST MODELS ==========

/// Trade-lifecycle event pushed by the exchange.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub trade_hash: String,
}

/// Request to onboard a staff member.
#[derive(Debug, Deserialize)]
pub struct AddStaffRequest {
    /// Directory id; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub role: String,
}

/// Staff-reported incoming payment, matched heuristically against
/// their unpaid trades.
#[derive(Debug, Deserialize)]
pub struct ReportPaymentRequest {
    /// Amount as the staff typed it; parsed as an exact decimal.
    pub amount: String,
    pub payer_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkPaidRequest {
    /// Seconds from assignment to confirmation. Computed from the
    /// assignment timestamp when absent.
    pub elapsed_seconds: Option<f64>,
    pub payer_name: Option<String>,
    pub amount_paid: Option<Decimal>,
}

/// Ledger delta for the exact settlement policy.
#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
}

/// Incoming bank-transfer notification carrying the payment
/// reference the buyer was told to include.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhookRequest {
    pub payment_reference: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ManualBatchRequest {
    pub staff_id: String,
    pub count: u32,
    pub time_limit_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub trade_hash: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
}

impl AssignmentResponse {
    pub fn from_outcome(trade_hash: String, outcome: AssignmentOutcome) -> Self {
        match outcome {
            AssignmentOutcome::Assigned { staff_id } => Self {
                trade_hash,
                status: "assigned".to_string(),
                staff_id: Some(staff_id),
            },
            AssignmentOutcome::Queued => Self {
                trade_hash,
                status: "queued".to_string(),
                staff_id: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StaffResponse {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub assigned_trades: usize,
    pub eligible: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StaffHistoryResponse {
    pub staff_id: String,
    pub name: String,
    pub trades: Vec<AssignedTrade>,
}

#[derive(Debug, Serialize)]
pub struct ReportPaymentResponse {
    pub trade_hash: String,
    pub flagged: bool,
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub trade_hash: String,
    pub fiat_balance: Decimal,
    pub expected_fiat_amount: Decimal,
    pub expected_fiat_currency: String,
    pub settled: bool,
}

#[derive(Debug, Serialize)]
pub struct SettledResponse {
    pub trade_hash: String,
    pub settled: bool,
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    /// Staff the oldest backlog entry went to, if anyone was free.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ManualBatchResponse {
    pub batch_id: Uuid,
    pub staff_id: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}
