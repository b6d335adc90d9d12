//! Card/SBP gateway adapter.
//!
//! Transactions are created and polled with merchant-id + secret headers;
//! webhooks are authenticated by the same secret header. Status strings are
//! the gateway's own: PENDING, CONFIRMED, CANCELED, EXPIRED.

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

const MERCHANT_HEADER: &str = "X-MerchantId";
const SECRET_HEADER: &str = "X-Secret";
const STATUS_CONFIRMED: &str = "CONFIRMED";

pub struct CardGatewayAdapter {
    client: Client,
    base_url: String,
    merchant_id: String,
    secret: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CreatedTransaction {
    #[serde(alias = "transactionId")]
    transaction_id: String,
    #[serde(default)]
    redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(alias = "transactionId", alias = "id")]
    transaction_id: String,
    status: String,
}

impl CardGatewayAdapter {
    pub fn new(
        client: Client,
        base_url: String,
        merchant_id: String,
        secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            merchant_id,
            secret,
            timeout,
        }
    }
}

#[async_trait]
impl ProcessorAdapter for CardGatewayAdapter {
    fn processor(&self) -> Processor {
        Processor::CardGateway
    }

    async fn mint_invoice(&self, intent: &PurchaseIntent) -> Result<MintedInvoice, StoreError> {
        let amount = format!("{}.{:02}", intent.amount / 100, intent.amount % 100);
        let resp = self
            .client
            .post(format!("{}/transaction/process", self.base_url))
            .header(MERCHANT_HEADER, &self.merchant_id)
            .header(SECRET_HEADER, &self.secret)
            .timeout(self.timeout)
            .json(&json!({
                "amount": amount,
                "currency": intent.currency.as_str(),
                "description": format!("{} purchase", intent.kind.as_str()),
                "payload": intent.intent_id.to_string(),
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "gateway rejected transaction: HTTP {}",
                resp.status()
            )));
        }
        let created: CreatedTransaction = resp.json().await?;

        Ok(MintedInvoice {
            invoice_id: created.transaction_id,
            pay_url: created.redirect,
            expires_at: None,
        })
    }

    async fn check_paid(&self, invoice_id: &str) -> Result<PaidStatus, StoreError> {
        if invoice_id.is_empty() {
            return Err(StoreError::Processor("transaction id required".into()));
        }

        let resp = self
            .client
            .get(format!("{}/transaction/{}", self.base_url, invoice_id))
            .header(MERCHANT_HEADER, &self.merchant_id)
            .header(SECRET_HEADER, &self.secret)
            .timeout(self.timeout)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(invoice_id, "gateway status poll timed out; treating as not paid");
                return Ok(PaidStatus {
                    paid: false,
                    raw_status: "timeout".into(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "gateway status check failed: HTTP {}",
                resp.status()
            )));
        }
        let status: TransactionStatus = resp.json().await?;

        Ok(PaidStatus {
            paid: status.status == STATUS_CONFIRMED,
            raw_status: status.status,
        })
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent, StoreError> {
        verify_secret_header(headers, SECRET_HEADER, &self.secret)?;

        let parsed: WebhookBody =
            serde_json::from_slice(body).map_err(|_| StoreError::UnrecognizedWebhook)?;

        Ok(WebhookEvent {
            invoice_id: parsed.transaction_id,
            paid: parsed.status == STATUS_CONFIRMED,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(secret: &str) -> CardGatewayAdapter {
        CardGatewayAdapter::new(
            Client::new(),
            "http://127.0.0.1:0".into(),
            "merchant-1".into(),
            secret.into(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn confirmed_webhook_with_secret_is_paid() {
        let a = adapter("s3cr3t");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "s3cr3t".parse().unwrap());
        let ev = a
            .parse_webhook(
                &headers,
                br#"{"transactionId":"tx-1","status":"CONFIRMED"}"#,
            )
            .unwrap();
        assert!(ev.paid);
        assert_eq!(ev.invoice_id, "tx-1");
    }

    #[test]
    fn canceled_webhook_is_a_failure_signal() {
        let a = adapter("s3cr3t");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "s3cr3t".parse().unwrap());
        let ev = a
            .parse_webhook(&headers, br#"{"transactionId":"tx-1","status":"CANCELED"}"#)
            .unwrap();
        assert!(!ev.paid);
    }

    #[test]
    fn wrong_secret_fails_closed() {
        let a = adapter("s3cr3t");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "guess".parse().unwrap());
        assert!(matches!(
            a.parse_webhook(&headers, br#"{"transactionId":"tx-1","status":"CONFIRMED"}"#),
            Err(StoreError::Unauthenticated)
        ));
    }

    #[test]
    fn malformed_body_is_unrecognized() {
        let a = adapter("s3cr3t");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "s3cr3t".parse().unwrap());
        assert!(matches!(
            a.parse_webhook(&headers, b"not-json"),
            Err(StoreError::UnrecognizedWebhook)
        ));
    }
}
