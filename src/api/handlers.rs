use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    dispatch::{ExpirationMonitor, TradeDispatcher},
    error::{AppError, AppResult},
    exchange::{ChatMessage, MessageSink},
    reconcile::Reconciler,
    staff::{PaidMarker, Staff},
    stats::{StatsAggregator, StatisticsSnapshot},
    store::{MessageLog, StaffStore},
};

#[derive(Clone)]
pub struct AppState {
    pub staff: Arc<dyn StaffStore>,
    pub messages: Arc<dyn MessageLog>,
    pub dispatcher: Arc<TradeDispatcher>,
    pub monitor: Arc<ExpirationMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub stats: Arc<StatsAggregator>,
    pub sink: Arc<dyn MessageSink>,
}

/// Exchange webhook intake.
/// POST /webhook
pub async fn exchange_webhook(
    State(state): State<AppState>,
    Json(event): Json<WebhookEvent>,
) -> AppResult<Json<serde_json::Value>> {
    let trade_hash = event.payload.trade_hash.clone();
    info!("Webhook {} for trade {}", event.kind, trade_hash);

    match event.kind.as_str() {
        "trade.started" => {
            let outcome = state.reconciler.start_trade(&trade_hash).await?;
            let response = AssignmentResponse::from_outcome(trade_hash, outcome);
            Ok(Json(serde_json::to_value(response).map_err(|e| {
                AppError::Internal(format!("serialize response: {}", e))
            })?))
        }
        "trade.paid" => {
            let marker = state.reconciler.elapsed_marker(&trade_hash).await?;
            state
                .reconciler
                .mark_paid(&trade_hash, marker, None, None)
                .await?;
            Ok(Json(serde_json::json!({ "trade_hash": trade_hash, "status": "paid" })))
        }
        "trade.chat_message_received" => {
            state.reconciler.spawn_chat_capture(trade_hash.clone());
            Ok(Json(serde_json::json!({ "trade_hash": trade_hash, "status": "capturing" })))
        }
        other => {
            // Unknown event kinds are acknowledged so the exchange
            // does not retry them forever.
            warn!("Ignoring unhandled webhook kind {}", other);
            Ok(Json(serde_json::json!({ "status": "ignored" })))
        }
    }
}

/// Bank-transfer notification: route the amount to the ledger record
/// matching the payment reference.
/// POST /webhook/payment
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(request): Json<PaymentWebhookRequest>,
) -> AppResult<Json<LedgerResponse>> {
    let record = state
        .reconciler
        .apply_reference_payment(&request.payment_reference, request.amount)
        .await?;
    let settled = record.is_settled();
    Ok(Json(LedgerResponse {
        trade_hash: record.trade_hash,
        fiat_balance: record.fiat_balance,
        expected_fiat_amount: record.expected_fiat_amount,
        expected_fiat_currency: record.expected_fiat_currency,
        settled,
    }))
}

/// Onboard a staff member. Re-posting an existing id is a no-op.
/// POST /staff
pub async fn add_staff(
    State(state): State<AppState>,
    Json(request): Json<AddStaffRequest>,
) -> AppResult<Json<StaffResponse>> {
    if request.name.trim().is_empty() {
        return Err(AppError::InvalidInput("staff name must not be empty".into()));
    }

    let id = request
        .id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let staff = Staff::new(id.clone(), request.name, request.email, request.role);
    state.staff.insert(staff).await?;

    let versioned = state
        .staff
        .get(&id)
        .await?
        .ok_or_else(|| AppError::Internal("staff vanished after insert".into()))?;
    Ok(Json(staff_response(&versioned.staff)))
}

/// GET /staff
pub async fn list_staff(State(state): State<AppState>) -> AppResult<Json<Vec<StaffResponse>>> {
    let directory = state.staff.list().await?;
    Ok(Json(
        directory.iter().map(|v| staff_response(&v.staff)).collect(),
    ))
}

/// Full assigned-trade history for one staff member.
/// GET /staff/:staff_id/history
pub async fn staff_history(
    State(state): State<AppState>,
    Path(staff_id): Path<String>,
) -> AppResult<Json<StaffHistoryResponse>> {
    let versioned = state
        .staff
        .get(&staff_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("staff {}", staff_id)))?;

    Ok(Json(StaffHistoryResponse {
        staff_id: versioned.staff.id.clone(),
        name: versioned.staff.name.clone(),
        trades: versioned.staff.assigned_trades,
    }))
}

/// Heuristic match of a staff-reported payment.
/// POST /staff/:staff_id/report-payment
pub async fn report_payment(
    State(state): State<AppState>,
    Path(staff_id): Path<String>,
    Json(request): Json<ReportPaymentRequest>,
) -> AppResult<Json<ReportPaymentResponse>> {
    let matched = state
        .reconciler
        .report_payment(&staff_id, &request.amount, request.payer_name)
        .await?;
    Ok(Json(ReportPaymentResponse {
        trade_hash: matched.trade_hash,
        flagged: matched.flagged,
    }))
}

/// Route a trade through the dispatcher without waiting for the
/// webhook (operator-triggered intake).
/// POST /trades/:trade_hash/assign
pub async fn assign_trade(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
) -> AppResult<Json<AssignmentResponse>> {
    let outcome = state.reconciler.start_trade(&trade_hash).await?;
    Ok(Json(AssignmentResponse::from_outcome(trade_hash, outcome)))
}

/// POST /trades/:trade_hash/mark-paid
pub async fn mark_paid(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
    Json(request): Json<MarkPaidRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let marker = match request.elapsed_seconds {
        Some(seconds) if seconds >= 0.0 => PaidMarker::Elapsed(seconds),
        Some(_) => {
            return Err(AppError::InvalidInput(
                "elapsed_seconds must be non-negative".into(),
            ))
        }
        None => state.reconciler.elapsed_marker(&trade_hash).await?,
    };

    state
        .reconciler
        .mark_paid(&trade_hash, marker, request.payer_name, request.amount_paid)
        .await?;
    Ok(Json(serde_json::json!({ "trade_hash": trade_hash, "status": "paid" })))
}

/// Refresh stored trade details from the exchange.
/// POST /trades/:trade_hash/refresh
pub async fn update_trade_details(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.reconciler.update_trade_details(&trade_hash).await?;
    Ok(Json(serde_json::json!({ "trade_hash": trade_hash, "status": "refreshed" })))
}

/// Exact-ledger policy: apply a payment delta.
/// POST /trades/:trade_hash/payments
pub async fn record_payment(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
    Json(request): Json<RecordPaymentRequest>,
) -> AppResult<Json<LedgerResponse>> {
    let record = state
        .reconciler
        .record_payment(&trade_hash, request.amount)
        .await?;
    let settled = record.is_settled();
    Ok(Json(LedgerResponse {
        trade_hash: record.trade_hash,
        fiat_balance: record.fiat_balance,
        expected_fiat_amount: record.expected_fiat_amount,
        expected_fiat_currency: record.expected_fiat_currency,
        settled,
    }))
}

/// GET /trades/:trade_hash/settled
pub async fn is_settled(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
) -> AppResult<Json<SettledResponse>> {
    let settled = state.reconciler.is_settled(&trade_hash).await?;
    Ok(Json(SettledResponse {
        trade_hash,
        settled,
    }))
}

/// Archived chat transcript for a trade.
/// GET /trades/:trade_hash/messages
pub async fn trade_messages(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    Ok(Json(state.messages.get(&trade_hash).await?))
}

/// POST /trades/:trade_hash/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(trade_hash): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if request.text.trim().is_empty() {
        return Err(AppError::InvalidInput("message text must not be empty".into()));
    }
    state.sink.post_message(&trade_hash, &request.text).await?;
    Ok(Json(serde_json::json!({ "trade_hash": trade_hash, "status": "sent" })))
}

/// Manually nudge the backlog.
/// POST /backlog/drain
pub async fn drain_backlog(State(state): State<AppState>) -> AppResult<Json<DrainResponse>> {
    let assigned_to = state.dispatcher.drain_one().await?;
    Ok(Json(DrainResponse { assigned_to }))
}

/// Pull a batch of manual-backlog trades onto one staff member with a
/// processing deadline.
/// POST /backlog/manual-batch
pub async fn assign_manual_batch(
    State(state): State<AppState>,
    Json(request): Json<ManualBatchRequest>,
) -> AppResult<Json<ManualBatchResponse>> {
    let batch = state
        .dispatcher
        .assign_manual_batch(
            &request.staff_id,
            request.count,
            Duration::from_secs(request.time_limit_seconds),
        )
        .await?;
    state.monitor.arm(batch.clone());

    Ok(Json(ManualBatchResponse {
        batch_id: batch.batch_id,
        staff_id: batch.staff_id,
        deadline: batch.deadline,
    }))
}

/// GET /statistics
pub async fn statistics(
    State(state): State<AppState>,
) -> AppResult<Json<StatisticsSnapshot>> {
    Ok(Json(state.stats.compute().await?))
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

fn staff_response(staff: &Staff) -> StaffResponse {
    StaffResponse {
        id: staff.id.clone(),
        name: staff.name.clone(),
        email: staff.email.clone(),
        role: staff.role.clone(),
        assigned_trades: staff.load(),
        eligible: staff.is_eligible(),
        created_at: staff.created_at,
    }
}
