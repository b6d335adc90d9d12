//! The client session agent: the storefront-side half of the protocol.
//!
//! It carries no financial authority. It creates purchase intents, persists
//! a pending-invoice pointer so a purchase survives the app being closed
//! mid-payment, re-issues reconciliation checks on resume, and keeps a
//! read-through balance cache the server value always overwrites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::session::{INIT_DATA_HEADER, SessionContext, USER_ID_HEADER};
use crate::types::{
    Currency, MintedInvoice, PendingPayment, Processor, PurchaseIntent, PurchaseKind,
    ReconcileOutcome,
};

/// How long an unconfirmed pointer is kept before it is treated as abandoned.
pub fn pointer_retention() -> TimeDelta {
    TimeDelta::hours(24)
}

/// What the agent needs from the relay backend.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn mint(
        &self,
        session: &SessionContext,
        processor: Processor,
        intent: &PurchaseIntent,
    ) -> Result<MintedInvoice, StoreError>;

    async fn check(
        &self,
        processor: Processor,
        invoice_id: &str,
    ) -> Result<ReconcileOutcome, StoreError>;

    async fn balance(
        &self,
        session: &SessionContext,
        currency: Currency,
    ) -> Result<i64, StoreError>;
}

/// Durable client-local storage for the pending-payment pointer. The value
/// is stored serialized, the way a web storage slot holds a string; a slot
/// that fails to parse reads as empty.
pub trait PointerStore: Send + Sync {
    fn load(&self) -> Option<PendingPayment>;
    fn save(&self, pending: &PendingPayment);
    fn clear(&self);
}

impl<P: PointerStore + ?Sized> PointerStore for &P {
    fn load(&self) -> Option<PendingPayment> {
        (**self).load()
    }

    fn save(&self, pending: &PendingPayment) {
        (**self).save(pending)
    }

    fn clear(&self) {
        (**self).clear()
    }
}

#[derive(Default)]
pub struct MemoryPointerStore {
    slot: Mutex<Option<String>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointerStore for MemoryPointerStore {
    fn load(&self) -> Option<PendingPayment> {
        let slot = self.slot.lock().expect("pointer lock");
        slot.as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    fn save(&self, pending: &PendingPayment) {
        match serde_json::to_string(pending) {
            Ok(raw) => *self.slot.lock().expect("pointer lock") = Some(raw),
            Err(e) => warn!(error = %e, "failed to serialize pending payment"),
        }
    }

    fn clear(&self) {
        *self.slot.lock().expect("pointer lock") = None;
    }
}

pub struct SessionAgent<R: RelayClient, P: PointerStore> {
    session: SessionContext,
    relay: R,
    pointers: P,
    cached_balances: Mutex<HashMap<Currency, i64>>,
}

impl<R: RelayClient, P: PointerStore> SessionAgent<R, P> {
    /// Built once at startup from the authentication source; the session
    /// context never mutates afterwards.
    pub fn new(session: SessionContext, relay: R, pointers: P) -> Self {
        Self {
            session,
            relay,
            pointers,
            cached_balances: Mutex::new(HashMap::new()),
        }
    }

    /// Creates an intent, mints an invoice for it and persists the pointer
    /// before handing the pay URL to the user; if they leave for an
    /// external wallet app and never come back today, resume still works.
    pub async fn begin_purchase(
        &self,
        kind: PurchaseKind,
        amount: i64,
        currency: Currency,
        recipient: Option<String>,
        processor: Processor,
    ) -> Result<PendingPayment, StoreError> {
        let intent = PurchaseIntent::new(
            kind,
            amount,
            currency,
            recipient,
            self.session.user_id.clone(),
        )?;
        let minted = self.relay.mint(&self.session, processor, &intent).await?;
        let pending = PendingPayment {
            processor,
            invoice_id: minted.invoice_id,
            intent,
            owner_user_id: self.session.user_id.clone(),
            created_at: Utc::now(),
        };
        self.pointers.save(&pending);
        Ok(pending)
    }

    /// On app foregrounding or page reload: picks the persisted pointer
    /// back up and re-issues a reconciliation check.
    ///
    /// The pointer is discarded without a check when it belongs to a
    /// different user than the active session (shared-device case) or when
    /// it is older than the retention window (abandoned payment). A
    /// fulfilled outcome also clears it.
    pub async fn resume(&self) -> Result<Option<ReconcileOutcome>, StoreError> {
        let Some(pending) = self.pointers.load() else {
            return Ok(None);
        };

        if pending.owner_user_id != self.session.user_id {
            debug!("pending payment belongs to another user; discarding");
            self.pointers.clear();
            return Ok(None);
        }
        if Utc::now() - pending.created_at > pointer_retention() {
            debug!(invoice_id = %pending.invoice_id, "pending payment expired; discarding");
            self.pointers.clear();
            return Ok(None);
        }

        let outcome = self
            .relay
            .check(pending.processor, &pending.invoice_id)
            .await?;
        if outcome.fulfilled {
            self.pointers.clear();
        }
        Ok(Some(outcome))
    }

    pub fn pending(&self) -> Option<PendingPayment> {
        self.pointers.load()
    }

    /// The last server-confirmed balance, for instant paint. Never used to
    /// decide anything; the server overwrites it on every refresh.
    pub fn cached_balance(&self, currency: Currency) -> Option<i64> {
        self.cached_balances
            .lock()
            .expect("balance lock")
            .get(&currency)
            .copied()
    }

    /// Fetches the authoritative balance and overwrites the cache with it.
    pub async fn refresh_balance(&self, currency: Currency) -> Result<i64, StoreError> {
        let balance = self.relay.balance(&self.session, currency).await?;
        self.cached_balances
            .lock()
            .expect("balance lock")
            .insert(currency, balance);
        Ok(balance)
    }
}

/// `RelayClient` over HTTP against the relay's API.
pub struct HttpRelayClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRelayClient {
    pub fn new(client: Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    async fn parse_data(resp: reqwest::Response) -> Result<Value, StoreError> {
        if !resp.status().is_success() {
            return Err(StoreError::Processor(format!(
                "relay returned HTTP {}",
                resp.status()
            )));
        }
        let mut envelope: Value = resp.json().await?;
        Ok(envelope["data"].take())
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn mint(
        &self,
        session: &SessionContext,
        processor: Processor,
        intent: &PurchaseIntent,
    ) -> Result<MintedInvoice, StoreError> {
        let resp = self
            .client
            .post(format!("{}/api/purchases", self.base_url))
            .header(USER_ID_HEADER, &session.user_id)
            .header(INIT_DATA_HEADER, &session.init_data)
            .timeout(self.timeout)
            .json(&json!({
                "processor": processor,
                "kind": intent.kind,
                "amount": intent.amount,
                "currency": intent.currency,
                "recipient": intent.recipient,
            }))
            .send()
            .await?;

        let data = Self::parse_data(resp).await?;
        Ok(MintedInvoice {
            invoice_id: data["invoice_id"]
                .as_str()
                .ok_or_else(|| StoreError::Processor("mint response missing invoice_id".into()))?
                .to_string(),
            pay_url: data["pay_url"].as_str().map(str::to_string),
            expires_at: data["expires_at"]
                .as_str()
                .and_then(|s| s.parse().ok()),
        })
    }

    async fn check(
        &self,
        processor: Processor,
        invoice_id: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        let resp = self
            .client
            .post(format!("{}/api/payment/check", self.base_url))
            .timeout(self.timeout)
            .json(&json!({ "processor": processor, "invoice_id": invoice_id }))
            .send()
            .await?;

        let data = Self::parse_data(resp).await?;
        serde_json::from_value(data)
            .map_err(|e| StoreError::Processor(format!("malformed check response: {e}")))
    }

    async fn balance(
        &self,
        session: &SessionContext,
        currency: Currency,
    ) -> Result<i64, StoreError> {
        let resp = self
            .client
            .get(format!("{}/api/balance", self.base_url))
            .header(USER_ID_HEADER, &session.user_id)
            .header(INIT_DATA_HEADER, &session.init_data)
            .query(&[("currency", currency.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;

        let data = Self::parse_data(resp).await?;
        let balance = data["balances"]
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row["currency"] == currency.as_str())
            })
            .and_then(|row| row["balance"].as_i64());
        Ok(balance.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutcomeDetail;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ScriptedRelay {
        outcome: ReconcileOutcome,
        balance: i64,
        checks: AtomicU64,
    }

    impl ScriptedRelay {
        fn new(outcome: ReconcileOutcome, balance: i64) -> Self {
            Self {
                outcome,
                balance,
                checks: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl RelayClient for &ScriptedRelay {
        async fn mint(
            &self,
            _session: &SessionContext,
            processor: Processor,
            _intent: &PurchaseIntent,
        ) -> Result<MintedInvoice, StoreError> {
            Ok(MintedInvoice {
                invoice_id: format!("{}-inv-1", processor.as_str()),
                pay_url: None,
                expires_at: None,
            })
        }

        async fn check(
            &self,
            _processor: Processor,
            _invoice_id: &str,
        ) -> Result<ReconcileOutcome, StoreError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }

        async fn balance(
            &self,
            _session: &SessionContext,
            _currency: Currency,
        ) -> Result<i64, StoreError> {
            Ok(self.balance)
        }
    }

    fn session(user: &str) -> SessionContext {
        SessionContext::new(user, "init-data")
    }

    #[tokio::test]
    async fn begin_purchase_persists_the_pointer() {
        let relay = ScriptedRelay::new(ReconcileOutcome::not_paid(), 0);
        let agent = SessionAgent::new(session("u1"), &relay, MemoryPointerStore::new());

        let pending = agent
            .begin_purchase(
                PurchaseKind::BalanceTopup,
                50_000,
                Currency::Rub,
                None,
                Processor::CryptoInvoice,
            )
            .await
            .unwrap();

        let stored = agent.pending().unwrap();
        assert_eq!(stored.invoice_id, pending.invoice_id);
        assert_eq!(stored.owner_user_id, "u1");
    }

    #[tokio::test]
    async fn resume_reissues_the_check_and_clears_on_fulfillment() {
        let relay = ScriptedRelay::new(
            ReconcileOutcome::fulfilled(OutcomeDetail::Credited),
            50_000,
        );
        let agent = SessionAgent::new(session("u1"), &relay, MemoryPointerStore::new());
        agent
            .begin_purchase(
                PurchaseKind::BalanceTopup,
                50_000,
                Currency::Rub,
                None,
                Processor::CryptoInvoice,
            )
            .await
            .unwrap();

        let outcome = agent.resume().await.unwrap().unwrap();
        assert!(outcome.fulfilled);
        assert_eq!(relay.checks.load(Ordering::SeqCst), 1);
        assert!(agent.pending().is_none());
    }

    #[tokio::test]
    async fn resume_discards_another_users_pointer_without_checking() {
        let relay = ScriptedRelay::new(ReconcileOutcome::not_paid(), 0);
        let store = MemoryPointerStore::new();

        let owner_agent = SessionAgent::new(session("u1"), &relay, &store);
        // Pointer written by u1 on a shared device…
        store.save(
            &owner_agent
                .begin_purchase(
                    PurchaseKind::BalanceTopup,
                    50_000,
                    Currency::Rub,
                    None,
                    Processor::CryptoInvoice,
                )
                .await
                .unwrap(),
        );

        // …must not surface for u2.
        let other_agent = SessionAgent::new(session("u2"), &relay, &store);
        relay.checks.store(0, Ordering::SeqCst);
        assert!(other_agent.resume().await.unwrap().is_none());
        assert_eq!(relay.checks.load(Ordering::SeqCst), 0);
        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn resume_discards_pointers_past_retention() {
        let relay = ScriptedRelay::new(ReconcileOutcome::not_paid(), 0);
        let store = MemoryPointerStore::new();
        let agent = SessionAgent::new(session("u1"), &relay, &store);

        let mut pending = agent
            .begin_purchase(
                PurchaseKind::BalanceTopup,
                50_000,
                Currency::Rub,
                None,
                Processor::CryptoInvoice,
            )
            .await
            .unwrap();
        pending.created_at = Utc::now() - TimeDelta::hours(25);
        store.save(&pending);

        relay.checks.store(0, Ordering::SeqCst);
        assert!(agent.resume().await.unwrap().is_none());
        assert_eq!(relay.checks.load(Ordering::SeqCst), 0);
        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn balance_cache_is_overwritten_by_the_server_value() {
        let relay = ScriptedRelay::new(ReconcileOutcome::not_paid(), 12_345);
        let agent = SessionAgent::new(session("u1"), &relay, MemoryPointerStore::new());

        assert_eq!(agent.cached_balance(Currency::Rub), None);
        let fresh = agent.refresh_balance(Currency::Rub).await.unwrap();
        assert_eq!(fresh, 12_345);
        assert_eq!(agent.cached_balance(Currency::Rub), Some(12_345));
    }
}
