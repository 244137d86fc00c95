use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Assignment scheduler and backlog errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Staff not found: {0}")]
    StaffNotFound(String),

    #[error("No backlog entries to assign")]
    EmptyQueue,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Payment matching and settlement errors
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("No assigned trade matches reported amount {reported} for staff {staff_id}")]
    NoMatch { staff_id: String, reported: String },

    #[error("Trade {0} has already been started")]
    AlreadyStarted(String),

    #[error("Trade not found: {0}")]
    TradeNotFound(String),

    #[error("Malformed amount: {0}")]
    MalformedAmount(String),
}

/// Document/ledger store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: u64,
        found: u64,
    },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Dispatch(DispatchError::StaffNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "STAFF_NOT_FOUND",
                format!("Staff not found: {}", id),
            ),
            AppError::Dispatch(DispatchError::EmptyQueue) => (
                StatusCode::CONFLICT,
                "EMPTY_QUEUE",
                "No backlog entries to assign".to_string(),
            ),
            AppError::Dispatch(DispatchError::InvalidArgument(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("Invalid argument: {}", msg),
            ),
            AppError::Reconcile(ReconcileError::NoMatch { staff_id, reported }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NO_MATCH",
                format!(
                    "No assigned trade matches reported amount {} for staff {}",
                    reported, staff_id
                ),
            ),
            AppError::Reconcile(ReconcileError::AlreadyStarted(hash)) => (
                StatusCode::CONFLICT,
                "ALREADY_STARTED",
                format!("Trade {} has already been started", hash),
            ),
            AppError::Reconcile(ReconcileError::TradeNotFound(hash)) => (
                StatusCode::NOT_FOUND,
                "TRADE_NOT_FOUND",
                format!("Trade not found: {}", hash),
            ),
            AppError::Reconcile(ReconcileError::MalformedAmount(msg)) => (
                StatusCode::BAD_REQUEST,
                "MALFORMED_AMOUNT",
                format!("Malformed amount: {}", msg),
            ),
            AppError::Store(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "Underlying store call failed".to_string(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                format!("Invalid input: {}", msg),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        AppError::Store(StoreError::Unavailable(error.to_string()))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Reconcile(ReconcileError::MalformedAmount(error.to_string()))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
