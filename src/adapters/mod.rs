//! Processor adapters: one per payment processor, each normalizing
//! "mint an invoice", "is this invoice paid" and "push me a payment event"
//! into a common shape so the reconciliation engine stays processor-agnostic.
//!
//! Adding a processor means implementing [`ProcessorAdapter`] and registering
//! it in the [`AdapterSet`]; nothing in shared logic branches on tags.

pub mod card_gateway;
pub mod crypto_invoice;
pub mod mock;
pub mod peer_wallet;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::StoreError;
use crate::types::{MintedInvoice, PaidStatus, Processor, PurchaseIntent, WebhookEvent};

pub use card_gateway::CardGatewayAdapter;
pub use crypto_invoice::CryptoInvoiceAdapter;
pub use mock::MockAdapter;
pub use peer_wallet::PeerWalletAdapter;

#[async_trait]
pub trait ProcessorAdapter: Send + Sync {
    fn processor(&self) -> Processor;

    /// True when the processor delivers the goods itself as part of its
    /// payment flow; the engine then marks paid invoices fulfilled without
    /// crediting the ledger or calling delivery.
    fn delivers_on_payment(&self) -> bool {
        false
    }

    /// Asks the processor for a payment request. Fails with
    /// `StoreError::Processor` on rejection; nothing is persisted yet.
    async fn mint_invoice(&self, intent: &PurchaseIntent) -> Result<MintedInvoice, StoreError>;

    /// Point-in-time poll, safe to repeat, read-only on the processor side.
    /// A timeout reads as "not yet paid", never the other way around.
    async fn check_paid(&self, invoice_id: &str) -> Result<PaidStatus, StoreError>;

    /// Normalizes an inbound notification. Must validate whatever
    /// authenticity mechanism the processor provides and fail closed: an
    /// unauthenticated "paid" signal is a direct path to free goods.
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent, StoreError>;
}

/// The registered adapters, keyed by processor tag.
#[derive(Clone, Default)]
pub struct AdapterSet {
    inner: HashMap<Processor, Arc<dyn ProcessorAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProcessorAdapter>) -> Self {
        self.inner.insert(adapter.processor(), adapter);
        self
    }

    pub fn get(&self, processor: Processor) -> Result<&Arc<dyn ProcessorAdapter>, StoreError> {
        self.inner
            .get(&processor)
            .ok_or_else(|| StoreError::UnknownProcessor(processor.to_string()))
    }
}

/// Length-independent early exit is fine; only the content comparison needs
/// to be constant-time.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Shared-secret header check used by the card gateway and peer wallet.
/// An unconfigured secret rejects everything rather than accepting everything.
pub(crate) fn verify_secret_header(
    headers: &HeaderMap,
    header_name: &str,
    expected: &str,
) -> Result<(), StoreError> {
    if expected.is_empty() {
        return Err(StoreError::Unauthenticated);
    }
    let supplied = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or(StoreError::Unauthenticated)?;
    if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(StoreError::Unauthenticated)
    }
}
