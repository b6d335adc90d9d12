use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;
use crate::types::InvoiceState;

pub const E_BAD_REQUEST: &str = "BAD_REQUEST";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_DUPLICATE_CREDIT: &str = "DUPLICATE_CREDIT";
pub const E_INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
pub const E_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const E_PROCESSOR_FAILURE: &str = "PROCESSOR_FAILURE";
pub const E_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const E_UNKNOWN_INVOICE: &str = "UNKNOWN_INVOICE";

/// Domain error taxonomy. Everything a processor, the registry, the ledger
/// or the engine can fail with; raw transport errors never cross the API
/// boundary unwrapped.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The processor's API rejected or failed a call. The invoice (if any)
    /// stays `pending`; the user is told to try again.
    #[error("processor error: {0}")]
    Processor(String),

    #[error("no adapter registered for processor: {0}")]
    UnknownProcessor(String),

    /// A check or webhook referenced an invoice the registry never minted.
    #[error("unknown invoice: {0}")]
    UnknownInvoice(String),

    /// An attempted edge not present in the state machine. Carries the
    /// state actually observed so racing callers can converge on it.
    #[error("invalid transition for invoice {invoice_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        invoice_id: String,
        from: InvoiceState,
        to: InvoiceState,
    },

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    /// A second topup credit referenced the same invoice. The engine's own
    /// guards make this unreachable except under a concurrent race or a
    /// bypass; never swallowed silently.
    #[error("duplicate topup credit for invoice {0}")]
    DuplicateInvoiceCredit(String),

    #[error("unsupported currency: {0}")]
    InvalidCurrency(String),

    #[error("invalid purchase intent: {0}")]
    InvalidIntent(String),

    /// Webhook failed its authenticity check. Dropped at the boundary.
    #[error("unauthenticated webhook")]
    Unauthenticated,

    /// Webhook payload did not match any shape the adapter knows. Dropped
    /// at the boundary rather than guessed at.
    #[error("unrecognized webhook payload")]
    UnrecognizedWebhook,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Upstream(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

/// Maps a domain error onto the coded HTTP envelope.
pub fn api_error(e: StoreError, meta: RequestMeta) -> ApiErrorWithMeta {
    match e {
        StoreError::Processor(msg) => ApiError::Upstream(msg)
            .with_meta(meta)
            .with_code(E_PROCESSOR_FAILURE),
        StoreError::UnknownProcessor(p) => {
            ApiError::BadRequest(format!("unknown processor: {p}"))
                .with_meta(meta)
                .with_code(E_BAD_REQUEST)
        }
        StoreError::UnknownInvoice(id) => ApiError::NotFound(format!("unknown invoice: {id}"))
            .with_meta(meta)
            .with_code(E_UNKNOWN_INVOICE),
        StoreError::InvalidTransition { .. } => {
            ApiError::Conflict("invoice state changed concurrently".into())
                .with_meta(meta)
                .with_code(E_INVALID_TRANSITION)
        }
        StoreError::InsufficientFunds { balance, requested } => ApiError::BadRequest(format!(
            "insufficient funds: balance {balance}, requested {requested}"
        ))
        .with_meta(meta)
        .with_code(E_INSUFFICIENT_FUNDS),
        StoreError::DuplicateInvoiceCredit(id) => {
            error!(invoice_id = %id, "duplicate topup credit reached the API layer");
            ApiError::Conflict("invoice already credited".into())
                .with_meta(meta)
                .with_code(E_DUPLICATE_CREDIT)
        }
        StoreError::InvalidCurrency(c) => ApiError::BadRequest(format!("unsupported currency: {c}"))
            .with_meta(meta)
            .with_code(E_BAD_REQUEST),
        StoreError::InvalidIntent(msg) => ApiError::BadRequest(msg)
            .with_meta(meta)
            .with_code(E_BAD_REQUEST),
        StoreError::Unauthenticated | StoreError::UnrecognizedWebhook => {
            ApiError::Unauthorized("unauthenticated".into())
                .with_meta(meta)
                .with_code(E_UNAUTHENTICATED)
        }
        StoreError::Database(e) => ApiError::Internal(e.into())
            .with_meta(meta)
            .with_code(E_DB_FAILURE),
        StoreError::Migrate(e) => ApiError::Internal(e.into())
            .with_meta(meta)
            .with_code(E_DB_FAILURE),
        StoreError::Http(e) => ApiError::Upstream(e.to_string())
            .with_meta(meta)
            .with_code(E_PROCESSOR_FAILURE),
    }
}
