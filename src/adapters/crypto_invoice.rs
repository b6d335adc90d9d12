//! Crypto-invoice processor adapter.
//!
//! Mints invoices through the processor's `createInvoice` call, polls
//! `getInvoices?status=paid`, and authenticates webhooks by the hex
//! HMAC-SHA256 of the raw body, keyed with the SHA-256 of the API token.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{ProcessorAdapter, constant_time_eq};
use crate::error::StoreError;
use crate::types::{Currency, MintedInvoice, PaidStatus, Processor, PurchaseIntent, WebhookEvent};

const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";
const TOKEN_HEADER: &str = "Crypto-Pay-API-Token";
const INVOICE_TTL_SECS: i64 = 3600;

pub struct CryptoInvoiceAdapter {
    client: Client,
    base_url: String,
    api_token: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CreatedInvoice {
    invoice_id: i64,
    #[serde(default)]
    mini_app_invoice_url: Option<String>,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
}

/// `getInvoices` has returned both `{items: [...]}` and a bare list in the
/// wild; accept either.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InvoiceList {
    Wrapped { items: Vec<InvoiceStatus> },
    Bare(Vec<InvoiceStatus>),
}

#[derive(Debug, Deserialize)]
struct InvoiceStatus {
    invoice_id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookUpdate {
    update_type: String,
    payload: Option<WebhookInvoice>,
}

#[derive(Debug, Deserialize)]
struct WebhookInvoice {
    invoice_id: i64,
    #[serde(default)]
    status: Option<String>,
}

impl CryptoInvoiceAdapter {
    pub fn new(client: Client, base_url: String, api_token: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            api_token,
            timeout,
        }
    }

    fn webhook_secret(&self) -> [u8; 32] {
        Sha256::digest(self.api_token.as_bytes()).into()
    }
}

#[async_trait]
impl ProcessorAdapter for CryptoInvoiceAdapter {
    fn processor(&self) -> Processor {
        Processor::CryptoInvoice
    }

    async fn mint_invoice(&self, intent: &PurchaseIntent) -> Result<MintedInvoice, StoreError> {
        let amount = format!("{}.{:02}", intent.amount / 100, intent.amount % 100);
        let mut body = json!({
            "amount": amount,
            "description": format!("{} purchase", intent.kind.as_str()),
            "payload": intent.intent_id.to_string(),
            "expires_in": INVOICE_TTL_SECS,
        });
        match intent.currency {
            Currency::Rub => {
                body["currency_type"] = json!("fiat");
                body["fiat"] = json!("RUB");
            }
            Currency::Usdt => body["asset"] = json!("USDT"),
            Currency::Ton => body["asset"] = json!("TON"),
        }

        let resp = self
            .client
            .post(format!("{}/createInvoice", self.base_url))
            .header(TOKEN_HEADER, &self.api_token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let data: ApiResponse<CreatedInvoice> = resp.json().await?;
        if !data.ok {
            return Err(StoreError::Processor(format!(
                "createInvoice rejected: {}",
                data.error.unwrap_or_default()
            )));
        }
        let inv = data
            .result
            .ok_or_else(|| StoreError::Processor("createInvoice returned no result".into()))?;
        let pay_url = inv
            .mini_app_invoice_url
            .or(inv.bot_invoice_url)
            .or(inv.pay_url);

        Ok(MintedInvoice {
            invoice_id: inv.invoice_id.to_string(),
            pay_url,
            expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(INVOICE_TTL_SECS)),
        })
    }

    async fn check_paid(&self, invoice_id: &str) -> Result<PaidStatus, StoreError> {
        if invoice_id.is_empty() {
            return Err(StoreError::Processor("invoice_id required".into()));
        }

        let resp = self
            .client
            .get(format!("{}/getInvoices", self.base_url))
            .header(TOKEN_HEADER, &self.api_token)
            .query(&[("invoice_ids", invoice_id), ("status", "paid")])
            .timeout(self.timeout)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(invoice_id, "check_paid timed out; treating as not paid");
                return Ok(PaidStatus {
                    paid: false,
                    raw_status: "timeout".into(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let data: ApiResponse<InvoiceList> = resp.json().await?;
        if !data.ok {
            return Err(StoreError::Processor(format!(
                "getInvoices rejected: {}",
                data.error.unwrap_or_default()
            )));
        }
        let items = match data.result {
            Some(InvoiceList::Wrapped { items }) => items,
            Some(InvoiceList::Bare(items)) => items,
            None => Vec::new(),
        };
        let paid = items
            .iter()
            .any(|inv| inv.invoice_id.to_string() == invoice_id && inv.status == "paid");

        Ok(PaidStatus {
            paid,
            raw_status: items
                .first()
                .map(|i| i.status.clone())
                .unwrap_or_else(|| "active".into()),
        })
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent, StoreError> {
        if self.api_token.is_empty() {
            return Err(StoreError::Unauthenticated);
        }
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(StoreError::Unauthenticated)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.webhook_secret())
            .map_err(|_| StoreError::Unauthenticated)?;
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(StoreError::Unauthenticated);
        }

        let update: WebhookUpdate =
            serde_json::from_slice(body).map_err(|_| StoreError::UnrecognizedWebhook)?;
        if update.update_type != "invoice_paid" {
            return Err(StoreError::UnrecognizedWebhook);
        }
        let payload = update.payload.ok_or(StoreError::UnrecognizedWebhook)?;
        let paid = payload.status.as_deref().unwrap_or("paid") == "paid";

        Ok(WebhookEvent {
            invoice_id: payload.invoice_id.to_string(),
            paid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn adapter(token: &str) -> CryptoInvoiceAdapter {
        CryptoInvoiceAdapter::new(
            Client::new(),
            "http://127.0.0.1:0".into(),
            token.into(),
            Duration::from_secs(1),
        )
    }

    fn sign(token: &str, body: &[u8]) -> String {
        let secret: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn webhook_with_valid_signature_parses() {
        let a = adapter("tok");
        let body =
            br#"{"update_type":"invoice_paid","payload":{"invoice_id":42,"status":"paid"}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign("tok", body).parse().unwrap());

        let ev = a.parse_webhook(&headers, body).unwrap();
        assert_eq!(
            ev,
            WebhookEvent {
                invoice_id: "42".into(),
                paid: true
            }
        );
    }

    #[test]
    fn webhook_with_bad_signature_fails_closed() {
        let a = adapter("tok");
        let body =
            br#"{"update_type":"invoice_paid","payload":{"invoice_id":42,"status":"paid"}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign("other-token", body).parse().unwrap());

        assert!(matches!(
            a.parse_webhook(&headers, body),
            Err(StoreError::Unauthenticated)
        ));
    }

    #[test]
    fn webhook_without_signature_fails_closed() {
        let a = adapter("tok");
        let body = br#"{"update_type":"invoice_paid","payload":{"invoice_id":42}}"#;
        assert!(matches!(
            a.parse_webhook(&HeaderMap::new(), body),
            Err(StoreError::Unauthenticated)
        ));
    }

    #[test]
    fn unrelated_update_type_is_unrecognized() {
        let a = adapter("tok");
        let body = br#"{"update_type":"invoice_expired","payload":{"invoice_id":42}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign("tok", body).parse().unwrap());

        assert!(matches!(
            a.parse_webhook(&headers, body),
            Err(StoreError::UnrecognizedWebhook)
        ));
    }

    #[test]
    fn unconfigured_token_rejects_webhooks() {
        let a = adapter("");
        let body = br#"{"update_type":"invoice_paid","payload":{"invoice_id":42}}"#;
        assert!(matches!(
            a.parse_webhook(&HeaderMap::new(), body),
            Err(StoreError::Unauthenticated)
        ));
    }
}
