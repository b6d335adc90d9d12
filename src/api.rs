use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, warn};

use crate::adapters::{
    AdapterSet, CardGatewayAdapter, CryptoInvoiceAdapter, PeerWalletAdapter,
};
use crate::config::Config;
use crate::delivery::{DeliveryService, HttpDeliveryService};
use crate::error::{ApiError, ApiErrorWithMeta, E_BAD_REQUEST, api_error};
use crate::ledger::LedgerStore;
use crate::reconcile::Reconciler;
use crate::registry::InvoiceRegistry;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::session::SessionContext;
use crate::types::{
    Currency, Invoice, InvoiceState, LedgerReason, Processor, PurchaseIntent, PurchaseKind,
    ReconcileOutcome,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: InvoiceRegistry,
    pub ledger: LedgerStore,
    pub adapters: Arc<AdapterSet>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    /// Wires the production adapters and delivery service from config.
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(config.check_timeout_secs);

        let adapters = Arc::new(
            AdapterSet::new()
                .register(Arc::new(CryptoInvoiceAdapter::new(
                    client.clone(),
                    config.crypto_invoice_base.clone(),
                    config.crypto_invoice_token.clone(),
                    timeout,
                )))
                .register(Arc::new(CardGatewayAdapter::new(
                    client.clone(),
                    config.card_gateway_base.clone(),
                    config.card_gateway_merchant_id.clone(),
                    config.card_gateway_secret.clone(),
                    timeout,
                )))
                .register(Arc::new(PeerWalletAdapter::new(
                    client.clone(),
                    config.peer_wallet_base.clone(),
                    config.peer_wallet_token.clone(),
                    timeout,
                ))),
        );
        let delivery = Arc::new(HttpDeliveryService::new(
            client,
            config.delivery_base.clone(),
            config.delivery_token.clone(),
            timeout,
        ));

        Self::with_collaborators(pool, adapters, delivery)
    }

    /// Same wiring with caller-supplied collaborators (tests use mocks).
    pub fn with_collaborators(
        pool: SqlitePool,
        adapters: Arc<AdapterSet>,
        delivery: Arc<dyn DeliveryService>,
    ) -> Self {
        let registry = InvoiceRegistry::new(pool.clone());
        let ledger = LedgerStore::new(pool);
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            ledger.clone(),
            adapters.clone(),
            delivery,
        ));
        Self {
            registry,
            ledger,
            adapters,
            reconciler,
        }
    }
}

/// The request to create a purchase: intent fields plus the processor to
/// mint with. Amount and recipient are stored server-side at this point and
/// never accepted again later.
#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    pub processor: Processor,
    pub kind: PurchaseKind,
    /// Minor units.
    pub amount: i64,
    pub currency: Currency,
    pub recipient: Option<String>,
}

#[derive(Serialize)]
pub struct CreatePurchaseResponse {
    pub invoice_id: String,
    pub pay_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The client-side check: processor tag plus the invoice id, nothing else.
#[derive(Deserialize)]
pub struct PaymentCheckRequest {
    pub processor: Processor,
    #[serde(default)]
    pub invoice_id: String,
}

#[derive(Deserialize)]
pub struct BalanceQuery {
    pub currency: Option<String>,
}

#[derive(Serialize)]
pub struct CurrencyBalance {
    pub currency: Currency,
    pub balance: i64,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balances: Vec<CurrencyBalance>,
}

/// A balance spend or credit that does not go through a payment processor,
/// e.g. a prize-wheel spin bought from stored balance.
#[derive(Deserialize)]
pub struct BalanceMutationRequest {
    pub currency: String,
    /// Minor units; always positive, the endpoint decides the sign.
    pub amount: i64,
    pub reason: String,
}

#[derive(Serialize)]
pub struct BalanceMutationResponse {
    pub entry_id: String,
    pub balance: i64,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub invoices: Vec<Invoice>,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/purchases", post(create_purchase_handler))
        .route("/api/purchases/history", get(purchase_history_handler))
        .route("/api/payment/check", post(payment_check_handler))
        .route("/webhooks/{processor}", post(webhook_handler))
        .route("/api/balance", get(get_balance_handler))
        .route("/api/balance/debit", post(debit_balance_handler))
        .route("/api/balance/credit", post(credit_balance_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn create_purchase_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: SessionContext,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<ApiOk<CreatePurchaseResponse>, ApiErrorWithMeta> {
    let intent = PurchaseIntent::new(
        req.kind,
        req.amount,
        req.currency,
        req.recipient,
        session.user_id,
    )
    .map_err(|e| api_error(e, meta.clone()))?;

    let adapter = st
        .adapters
        .get(req.processor)
        .map_err(|e| api_error(e, meta.clone()))?;
    let invoice = st
        .registry
        .create(&intent, adapter.as_ref())
        .await
        .map_err(|e| api_error(e, meta.clone()))?;

    Ok(ApiOk::created(
        "invoice created",
        CreatePurchaseResponse {
            invoice_id: invoice.invoice_id,
            pay_url: invoice.pay_url,
            expires_at: invoice.expires_at,
        },
        meta,
    ))
}

async fn payment_check_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<PaymentCheckRequest>,
) -> Result<ApiOk<ReconcileOutcome>, ApiErrorWithMeta> {
    if req.invoice_id.is_empty() {
        return Err(ApiError::BadRequest("invoice_id is required".into())
            .with_meta(meta)
            .with_code(E_BAD_REQUEST));
    }

    // The stored invoice is authoritative for processor, amount and
    // recipient; the client payload carries identifiers only.
    let outcome = st
        .reconciler
        .reconcile(&req.invoice_id)
        .await
        .map_err(|e| api_error(e, meta.clone()))?;

    Ok(ApiOk::ok("payment checked", outcome, meta))
}

async fn webhook_handler(
    State(st): State<AppState>,
    Path(processor): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(processor) = processor.parse::<Processor>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(adapter) = st.adapters.get(processor) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Fail closed: anything that does not authenticate and parse is dropped
    // with no state change.
    let event = match adapter.parse_webhook(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            warn!(processor = %processor, error = %e, "webhook dropped");
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    if event.paid {
        match st.reconciler.reconcile_paid_signal(&event.invoice_id).await {
            Ok(outcome) => (
                StatusCode::OK,
                Json(json!({ "ok": true, "fulfilled": outcome.fulfilled })),
            )
                .into_response(),
            Err(crate::error::StoreError::UnknownInvoice(id)) => {
                warn!(
                    processor = %processor,
                    invoice_id = %id,
                    "paid webhook for an invoice never minted; possible forgery or replay"
                );
                StatusCode::NOT_FOUND.into_response()
            }
            Err(e) => api_error(e, meta).into_response(),
        }
    } else {
        match st
            .registry
            .transition(&event.invoice_id, InvoiceState::Failed)
            .await
        {
            Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
            // Already past pending; the failure signal is a no-op.
            Err(crate::error::StoreError::InvalidTransition { .. }) => {
                (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
            }
            Err(crate::error::StoreError::UnknownInvoice(id)) => {
                warn!(processor = %processor, invoice_id = %id, "failure webhook for unknown invoice");
                StatusCode::NOT_FOUND.into_response()
            }
            Err(e) => api_error(e, meta).into_response(),
        }
    }
}

async fn get_balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: SessionContext,
    Query(q): Query<BalanceQuery>,
) -> Result<ApiOk<BalanceResponse>, ApiErrorWithMeta> {
    let balances = match q.currency {
        Some(raw) => {
            let currency: Currency = raw.parse().map_err(|e| api_error(e, meta.clone()))?;
            let balance = st
                .ledger
                .current_balance(&session.user_id, currency)
                .await
                .map_err(|e| api_error(e, meta.clone()))?;
            vec![CurrencyBalance { currency, balance }]
        }
        None => st
            .ledger
            .balances(&session.user_id)
            .await
            .map_err(|e| api_error(e, meta.clone()))?
            .into_iter()
            .map(|(currency, balance)| CurrencyBalance { currency, balance })
            .collect(),
    };

    Ok(ApiOk::ok(
        "balance fetched",
        BalanceResponse {
            user_id: session.user_id,
            balances,
        },
        meta,
    ))
}

async fn debit_balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: SessionContext,
    Json(req): Json<BalanceMutationRequest>,
) -> Result<ApiOk<BalanceMutationResponse>, ApiErrorWithMeta> {
    mutate_balance(&st, meta, session, req, -1).await
}

async fn credit_balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: SessionContext,
    Json(req): Json<BalanceMutationRequest>,
) -> Result<ApiOk<BalanceMutationResponse>, ApiErrorWithMeta> {
    mutate_balance(&st, meta, session, req, 1).await
}

async fn mutate_balance(
    st: &AppState,
    meta: RequestMeta,
    session: SessionContext,
    req: BalanceMutationRequest,
    sign: i64,
) -> Result<ApiOk<BalanceMutationResponse>, ApiErrorWithMeta> {
    if req.amount <= 0 {
        return Err(ApiError::BadRequest("amount must be positive".into())
            .with_meta(meta)
            .with_code(E_BAD_REQUEST));
    }
    let currency: Currency = req.currency.parse().map_err(|e| api_error(e, meta.clone()))?;
    let reason: LedgerReason = req.reason.parse().map_err(|e| api_error(e, meta.clone()))?;
    if reason == LedgerReason::Topup {
        return Err(
            ApiError::BadRequest("topup entries are written by payment reconciliation".into())
                .with_meta(meta)
                .with_code(E_BAD_REQUEST),
        );
    }
    // A reason must match the direction of the entry it explains.
    let direction_ok = if sign > 0 {
        reason.allows_credit()
    } else {
        reason.allows_debit()
    };
    if !direction_ok {
        return Err(ApiError::BadRequest(format!(
            "reason {} does not allow this direction",
            req.reason
        ))
        .with_meta(meta)
        .with_code(E_BAD_REQUEST));
    }

    let entry = st
        .ledger
        .apply_entry(&session.user_id, currency, sign * req.amount, reason, None)
        .await
        .map_err(|e| api_error(e, meta.clone()))?;
    let balance = st
        .ledger
        .current_balance(&session.user_id, currency)
        .await
        .map_err(|e| api_error(e, meta.clone()))?;

    Ok(ApiOk::ok(
        "balance updated",
        BalanceMutationResponse {
            entry_id: entry.entry_id,
            balance,
        },
        meta,
    ))
}

async fn purchase_history_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    session: SessionContext,
) -> Result<ApiOk<HistoryResponse>, ApiErrorWithMeta> {
    let invoices = st
        .registry
        .history(&session.user_id)
        .await
        .map_err(|e| api_error(e, meta.clone()))?;
    Ok(ApiOk::ok("history fetched", HistoryResponse { invoices }, meta))
}
