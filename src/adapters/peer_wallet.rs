//! Peer-wallet adapter.
//!
//! This processor runs the whole flow itself: once an order is paid, the
//! wallet service has already delivered the goods server-side. The adapter
//! therefore reports `delivers_on_payment`, and the engine marks paid
//! invoices fulfilled without touching the ledger or the delivery service.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{ProcessorAdapter, verify_secret_header};
use crate::error::StoreError;
use crate::types::{MintedInvoice, PaidStatus, Processor, PurchaseIntent, WebhookEvent};

const TOKEN_HEADER: &str = "x-webhook-token";
const EVENT_COMPLETED: &str = "order.completed";
const EVENT_FAILED: &str = "order.failed";

pub struct PeerWalletAdapter {
    client: Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    order_id: String,
    #[serde(default)]
    payment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    order_id: String,
}

impl PeerWalletAdapter {
    pub fn new(client: Client, base_url: String, token: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            token,
            timeout,
        }
    }
}

#[async_trait]
impl ProcessorAdapter for PeerWalletAdapter {
    fn processor(&self) -> Processor {
        Processor::PeerWallet
    }

    fn delivers_on_payment(&self) -> bool {
        true
    }

    async fn mint_invoice(&self, intent: &PurchaseIntent) -> Result<MintedInvoice, StoreError> {
        let resp = self
            .client
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&json!({
                "kind": intent.kind.as_str(),
                "recipient": intent.recipient,
                "amount": intent.amount,
                "currency": intent.currency.as_str(),
                "payload": intent.intent_id.to_string(),
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "wallet rejected order: HTTP {}",
                resp.status()
            )));
        }
        let order: CreatedOrder = resp.json().await?;

        Ok(MintedInvoice {
            invoice_id: order.order_id,
            pay_url: order.payment_url,
            expires_at: None,
        })
    }

    async fn check_paid(&self, invoice_id: &str) -> Result<PaidStatus, StoreError> {
        if invoice_id.is_empty() {
            return Err(StoreError::Processor("order id required".into()));
        }

        let resp = self
            .client
            .get(format!("{}/orders/{}", self.base_url, invoice_id))
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(invoice_id, "wallet order poll timed out; treating as not paid");
                return Ok(PaidStatus {
                    paid: false,
                    raw_status: "timeout".into(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "wallet order check failed: HTTP {}",
                resp.status()
            )));
        }
        let order: OrderStatus = resp.json().await?;
        let paid = order.status == "completed";

        Ok(PaidStatus {
            paid,
            raw_status: order.status,
        })
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent, StoreError> {
        verify_secret_header(headers, TOKEN_HEADER, &self.token)?;

        let parsed: WebhookBody =
            serde_json::from_slice(body).map_err(|_| StoreError::UnrecognizedWebhook)?;
        let paid = match parsed.event.as_str() {
            EVENT_COMPLETED => true,
            EVENT_FAILED => false,
            _ => return Err(StoreError::UnrecognizedWebhook),
        };

        Ok(WebhookEvent {
            invoice_id: parsed.order_id,
            paid,
        })
    }
}
