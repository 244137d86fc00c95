use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handlers::{
    add_staff, assign_manual_batch, assign_trade, drain_backlog, exchange_webhook, health_check,
    is_settled, list_staff, mark_paid, payment_webhook, record_payment, report_payment,
    send_message, staff_history, statistics, trade_messages, update_trade_details, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // Exchange webhook intake at root level
        .route("/webhook", post(exchange_webhook))
        .route("/webhook/payment", post(payment_webhook))
        .nest(
            "/api/v1",
            Router::new()
                // Staff directory endpoints
                .route("/staff", post(add_staff).get(list_staff))
                .route("/staff/:staff_id/history", get(staff_history))
                .route("/staff/:staff_id/report-payment", post(report_payment))
                // Trade endpoints
                .route("/trades/:trade_hash/assign", post(assign_trade))
                .route("/trades/:trade_hash/mark-paid", post(mark_paid))
                .route("/trades/:trade_hash/refresh", post(update_trade_details))
                .route("/trades/:trade_hash/payments", post(record_payment))
                .route("/trades/:trade_hash/settled", get(is_settled))
                .route(
                    "/trades/:trade_hash/messages",
                    get(trade_messages).post(send_message),
                )
                // Backlog endpoints
                .route("/backlog/drain", post(drain_backlog))
                .route("/backlog/manual-batch", post(assign_manual_batch))
                // Statistics endpoint
                .route("/statistics", get(statistics)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
