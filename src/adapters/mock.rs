//! Scriptable in-process adapter for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ProcessorAdapter, verify_secret_header};
use crate::error::StoreError;
use crate::types::{MintedInvoice, PaidStatus, Processor, PurchaseIntent, WebhookEvent};

pub const MOCK_TOKEN_HEADER: &str = "x-mock-token";

pub struct MockAdapter {
    processor: Processor,
    delivers_on_payment: bool,
    token: String,
    paid_invoices: Mutex<Vec<String>>,
    expires_at: Mutex<Option<DateTime<Utc>>>,
    fail_minting: Mutex<bool>,
    mint_seq: AtomicU64,
    check_calls: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct MockWebhookBody {
    invoice_id: String,
    paid: bool,
}

impl MockAdapter {
    pub fn new(processor: Processor) -> Self {
        Self {
            processor,
            delivers_on_payment: false,
            token: "mock-token".into(),
            paid_invoices: Mutex::new(Vec::new()),
            expires_at: Mutex::new(None),
            fail_minting: Mutex::new(false),
            mint_seq: AtomicU64::new(0),
            check_calls: AtomicU64::new(0),
        }
    }

    pub fn delivering(processor: Processor) -> Self {
        Self {
            delivers_on_payment: true,
            ..Self::new(processor)
        }
    }

    /// Marks an invoice as paid on the "processor" side; subsequent
    /// `check_paid` calls observe it.
    pub fn set_paid(&self, invoice_id: &str) {
        self.paid_invoices
            .lock()
            .expect("mock lock")
            .push(invoice_id.to_string());
    }

    /// Minted invoices will carry this expiry.
    pub fn set_expires_at(&self, at: DateTime<Utc>) {
        *self.expires_at.lock().expect("mock lock") = Some(at);
    }

    pub fn set_fail_minting(&self, fail: bool) {
        *self.fail_minting.lock().expect("mock lock") = fail;
    }

    pub fn check_calls(&self) -> u64 {
        self.check_calls.load(Ordering::SeqCst)
    }

    /// Builds the webhook (headers, body) pair this adapter accepts.
    pub fn webhook(&self, invoice_id: &str, paid: bool) -> (HeaderMap, Vec<u8>) {
        let mut headers = HeaderMap::new();
        headers.insert(MOCK_TOKEN_HEADER, self.token.parse().expect("header value"));
        let body = serde_json::json!({ "invoice_id": invoice_id, "paid": paid });
        (headers, body.to_string().into_bytes())
    }
}

#[async_trait]
impl ProcessorAdapter for MockAdapter {
    fn processor(&self) -> Processor {
        self.processor
    }

    fn delivers_on_payment(&self) -> bool {
        self.delivers_on_payment
    }

    async fn mint_invoice(&self, _intent: &PurchaseIntent) -> Result<MintedInvoice, StoreError> {
        if *self.fail_minting.lock().expect("mock lock") {
            return Err(StoreError::Processor("mock mint failure".into()));
        }
        let n = self.mint_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MintedInvoice {
            invoice_id: format!("{}-inv-{}", self.processor.as_str(), n),
            pay_url: Some(format!("https://pay.example/{n}")),
            expires_at: *self.expires_at.lock().expect("mock lock"),
        })
    }

    async fn check_paid(&self, invoice_id: &str) -> Result<PaidStatus, StoreError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let paid = self
            .paid_invoices
            .lock()
            .expect("mock lock")
            .iter()
            .any(|id| id == invoice_id);
        Ok(PaidStatus {
            paid,
            raw_status: if paid { "paid".into() } else { "active".into() },
        })
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent, StoreError> {
        verify_secret_header(headers, MOCK_TOKEN_HEADER, &self.token)?;
        let parsed: MockWebhookBody =
            serde_json::from_slice(body).map_err(|_| StoreError::UnrecognizedWebhook)?;
        Ok(WebhookEvent {
            invoice_id: parsed.invoice_id,
            paid: parsed.paid,
        })
    }
}
