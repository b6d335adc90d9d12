//! The delivery collaborator: hands the purchased good (stars, premium,
//! Steam topup, spin tickets) to the external fulfillment service once
//! payment is confirmed. Balance topups never come through here; they are
//! ledger credits.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::error::StoreError;
use crate::types::Invoice;

#[async_trait]
pub trait DeliveryService: Send + Sync {
    /// Delivers the good for a paid invoice. Must only be called for
    /// confirmed payments; a failure leaves the invoice `paid` for retry.
    async fn deliver(&self, invoice: &Invoice) -> Result<(), StoreError>;
}

/// Delivery over HTTP to the fulfillment service.
pub struct HttpDeliveryService {
    client: Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpDeliveryService {
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
impl DeliveryService for HttpDeliveryService {
    async fn deliver(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(format!("{}/deliver", self.base_url))
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&json!({
                "invoice_id": invoice.invoice_id,
                "kind": invoice.kind.as_str(),
                "recipient": invoice.recipient,
                "amount": invoice.amount,
                "currency": invoice.currency.as_str(),
                "user_id": invoice.owner_user_id,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "delivery failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Scriptable delivery for tests: fails the next N calls, then succeeds,
/// recording every invoice it delivered.
#[derive(Default)]
pub struct MockDelivery {
    fail_remaining: AtomicU64,
    delivered: Mutex<Vec<String>>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u64) {
        self.fail_remaining.store(times, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().expect("mock lock").clone()
    }

    pub fn delivered_count(&self, invoice_id: &str) -> usize {
        self.delivered
            .lock()
            .expect("mock lock")
            .iter()
            .filter(|id| *id == invoice_id)
            .count()
    }
}

#[async_trait]
impl DeliveryService for MockDelivery {
    async fn deliver(&self, invoice: &Invoice) -> Result<(), StoreError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Processor("mock delivery failure".into()));
        }
        self.delivered
            .lock()
            .expect("mock lock")
            .push(invoice.invoice_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::types::{Currency, InvoiceState, Processor, PurchaseKind};

    fn invoice(id: &str) -> Invoice {
        Invoice {
            invoice_id: id.to_string(),
            processor: Processor::CryptoInvoice,
            state: InvoiceState::Paid,
            intent_id: Uuid::new_v4().to_string(),
            kind: PurchaseKind::Stars,
            amount: 10_000,
            currency: Currency::Rub,
            recipient: Some("someone".to_string()),
            owner_user_id: "user-1".to_string(),
            pay_url: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn mock_fails_exactly_n_times_then_records() {
        let delivery = MockDelivery::new();
        delivery.fail_next(2);

        tokio_test::block_on(async {
            assert!(delivery.deliver(&invoice("inv-1")).await.is_err());
            assert!(delivery.deliver(&invoice("inv-1")).await.is_err());
            assert!(delivery.deliver(&invoice("inv-1")).await.is_ok());
            assert!(delivery.deliver(&invoice("inv-1")).await.is_ok());
        });

        assert_eq!(delivery.delivered_count("inv-1"), 2);
        assert_eq!(delivery.delivered_count("inv-2"), 0);
    }
}
