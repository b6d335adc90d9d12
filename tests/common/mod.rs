#![allow(dead_code)]

use std::sync::Arc;

use sqlx::SqlitePool;
use storefront_relay::adapters::{AdapterSet, MockAdapter};
use storefront_relay::delivery::MockDelivery;
use storefront_relay::ledger::LedgerStore;
use storefront_relay::reconcile::Reconciler;
use storefront_relay::registry::InvoiceRegistry;
use storefront_relay::types::{Currency, Processor, PurchaseIntent, PurchaseKind};
use uuid::Uuid;

/// A fresh on-disk database per test. In-memory SQLite hands every pooled
/// connection its own database, so a file it is.
pub async fn temp_pool() -> anyhow::Result<SqlitePool> {
    let path = std::env::temp_dir().join(format!("storefront-relay-test-{}.db", Uuid::new_v4()));
    let url = format!("sqlite:{}", path.display());
    Ok(storefront_relay::init_pool(&url).await?)
}

pub struct Harness {
    pub pool: SqlitePool,
    pub registry: InvoiceRegistry,
    pub ledger: LedgerStore,
    pub reconciler: Arc<Reconciler>,
    pub adapters: Arc<AdapterSet>,
    /// Registered as `crypto_invoice`; does not deliver on payment.
    pub adapter: Arc<MockAdapter>,
    /// Registered as `peer_wallet`; delivers on payment.
    pub delivering_adapter: Arc<MockAdapter>,
    pub delivery: Arc<MockDelivery>,
}

pub async fn harness() -> anyhow::Result<Harness> {
    let pool = temp_pool().await?;
    let adapter = Arc::new(MockAdapter::new(Processor::CryptoInvoice));
    let delivering_adapter = Arc::new(MockAdapter::delivering(Processor::PeerWallet));
    let delivery = Arc::new(MockDelivery::new());

    let adapters = Arc::new(
        AdapterSet::new()
            .register(adapter.clone())
            .register(delivering_adapter.clone()),
    );
    let registry = InvoiceRegistry::new(pool.clone());
    let ledger = LedgerStore::new(pool.clone());
    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        ledger.clone(),
        adapters.clone(),
        delivery.clone(),
    ));

    Ok(Harness {
        pool,
        registry,
        ledger,
        reconciler,
        adapters,
        adapter,
        delivering_adapter,
        delivery,
    })
}

pub fn topup_intent(user: &str, amount: i64) -> PurchaseIntent {
    PurchaseIntent::new(
        PurchaseKind::BalanceTopup,
        amount,
        Currency::Rub,
        None,
        user.to_string(),
    )
    .expect("valid topup intent")
}

pub fn stars_intent(user: &str, recipient: &str, amount: i64) -> PurchaseIntent {
    PurchaseIntent::new(
        PurchaseKind::Stars,
        amount,
        Currency::Rub,
        Some(recipient.to_string()),
        user.to_string(),
    )
    .expect("valid stars intent")
}
