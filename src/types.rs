use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// A currency supported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Currency {
    Rub,
    Usdt,
    Ton,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Rub => "RUB",
            Currency::Usdt => "USDT",
            Currency::Ton => "TON",
        }
    }
}

impl FromStr for Currency {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUB" => Ok(Currency::Rub),
            "USDT" => Ok(Currency::Usdt),
            "TON" => Ok(Currency::Ton),
            other => Err(StoreError::InvalidCurrency(other.to_string())),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user is buying. Each kind carries its own required-field schema,
/// enforced once at intent creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PurchaseKind {
    Stars,
    Premium,
    SteamTopup,
    BalanceTopup,
    SpinTicket,
}

impl PurchaseKind {
    /// Stars and Premium are gifted to a username; Steam topups go to a login.
    pub fn requires_recipient(&self) -> bool {
        matches!(
            self,
            PurchaseKind::Stars | PurchaseKind::Premium | PurchaseKind::SteamTopup
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseKind::Stars => "stars",
            PurchaseKind::Premium => "premium",
            PurchaseKind::SteamTopup => "steam_topup",
            PurchaseKind::BalanceTopup => "balance_topup",
            PurchaseKind::SpinTicket => "spin_ticket",
        }
    }
}

/// A payment processor the relay can mint invoices against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Processor {
    CryptoInvoice,
    PeerWallet,
    CardGateway,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::CryptoInvoice => "crypto_invoice",
            Processor::PeerWallet => "peer_wallet",
            Processor::CardGateway => "card_gateway",
        }
    }
}

impl FromStr for Processor {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crypto_invoice" => Ok(Processor::CryptoInvoice),
            "peer_wallet" => Ok(Processor::PeerWallet),
            "card_gateway" => Ok(Processor::CardGateway),
            other => Err(StoreError::UnknownProcessor(other.to_string())),
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice lifecycle. `Fulfilled`, `Expired` and `Failed` are terminal;
/// nothing re-enters `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InvoiceState {
    Pending,
    Paid,
    Fulfilled,
    Expired,
    Failed,
}

impl InvoiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceState::Fulfilled | InvoiceState::Expired | InvoiceState::Failed
        )
    }

    /// The legal edges of the invoice state machine. A paid invoice that
    /// fails during fulfillment stays `Paid` and is retried; it never
    /// reverts to `Pending`.
    pub fn edge_allowed(from: InvoiceState, to: InvoiceState) -> bool {
        matches!(
            (from, to),
            (InvoiceState::Pending, InvoiceState::Paid)
                | (InvoiceState::Paid, InvoiceState::Fulfilled)
                | (InvoiceState::Pending, InvoiceState::Expired)
                | (InvoiceState::Pending, InvoiceState::Failed)
        )
    }
}

/// What the user wants to buy, fixed before any money moves.
///
/// Immutable once submitted to a processor adapter for minting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseIntent {
    pub intent_id: Uuid,
    pub kind: PurchaseKind,
    /// Minor units (kopecks / cents).
    pub amount: i64,
    pub currency: Currency,
    pub recipient: Option<String>,
    /// Opaque identifier supplied by the session layer.
    pub owner_user_id: String,
}

impl PurchaseIntent {
    /// Builds an intent, validating the kind's required-field schema once,
    /// here, instead of at every use site.
    pub fn new(
        kind: PurchaseKind,
        amount: i64,
        currency: Currency,
        recipient: Option<String>,
        owner_user_id: String,
    ) -> Result<Self, StoreError> {
        if amount <= 0 {
            return Err(StoreError::InvalidIntent("amount must be positive".into()));
        }
        if owner_user_id.is_empty() {
            return Err(StoreError::InvalidIntent("owner_user_id is required".into()));
        }
        let recipient = recipient
            .map(|r| r.trim().trim_start_matches('@').to_string())
            .filter(|r| !r.is_empty());
        if kind.requires_recipient() && recipient.is_none() {
            return Err(StoreError::InvalidIntent(format!(
                "{} purchases require a recipient",
                kind.as_str()
            )));
        }
        if !kind.requires_recipient() && recipient.is_some() {
            return Err(StoreError::InvalidIntent(format!(
                "{} purchases do not take a recipient",
                kind.as_str()
            )));
        }
        Ok(PurchaseIntent {
            intent_id: Uuid::new_v4(),
            kind,
            amount,
            currency,
            recipient,
            owner_user_id,
        })
    }
}

/// A processor-side payment request, correlated 1:1 with a purchase intent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    /// Processor-assigned identifier, opaque to the relay.
    pub invoice_id: String,
    pub processor: Processor,
    pub state: InvoiceState,
    pub intent_id: String,
    pub kind: PurchaseKind,
    pub amount: i64,
    pub currency: Currency,
    pub recipient: Option<String>,
    pub owner_user_id: String,
    pub pay_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a ledger entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LedgerReason {
    Topup,
    SpinWin,
    SpinCost,
    PurchaseDebit,
    AdminAdjustment,
}

impl LedgerReason {
    /// Reasons a caller may attach to a credit. `Topup` is absent on
    /// purpose: those entries are written by payment reconciliation only.
    pub fn allows_credit(&self) -> bool {
        matches!(self, LedgerReason::SpinWin | LedgerReason::AdminAdjustment)
    }

    pub fn allows_debit(&self) -> bool {
        matches!(
            self,
            LedgerReason::SpinCost | LedgerReason::PurchaseDebit | LedgerReason::AdminAdjustment
        )
    }
}

impl FromStr for LedgerReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topup" => Ok(LedgerReason::Topup),
            "spin_win" => Ok(LedgerReason::SpinWin),
            "spin_cost" => Ok(LedgerReason::SpinCost),
            "purchase_debit" => Ok(LedgerReason::PurchaseDebit),
            "admin_adjustment" => Ok(LedgerReason::AdminAdjustment),
            other => Err(StoreError::InvalidIntent(format!("unknown reason: {other}"))),
        }
    }
}

/// An atomic balance mutation. The sum of a user's entries per currency is
/// that user's balance; nothing else is authoritative.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub user_id: String,
    pub currency: Currency,
    pub delta: i64,
    pub reason: LedgerReason,
    pub invoice_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What an adapter returns after minting an invoice with its processor.
#[derive(Debug, Clone)]
pub struct MintedInvoice {
    pub invoice_id: String,
    pub pay_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Point-in-time poll result from a processor. Read-only on their side.
#[derive(Debug, Clone)]
pub struct PaidStatus {
    pub paid: bool,
    pub raw_status: String,
}

/// A normalized inbound processor notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub invoice_id: String,
    pub paid: bool,
}

/// Detail a reconciliation attempt reports back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeDetail {
    NotPaid,
    Credited,
    Delivered,
    DeliveredByProcessor,
    AlreadyFulfilled,
    PendingDelivery,
    Expired,
    Failed,
}

/// The result of `reconcile`: what the client renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub paid: bool,
    pub fulfilled: bool,
    pub outcome_detail: OutcomeDetail,
    pub delivered_by_processor: bool,
}

impl ReconcileOutcome {
    pub fn not_paid() -> Self {
        ReconcileOutcome {
            paid: false,
            fulfilled: false,
            outcome_detail: OutcomeDetail::NotPaid,
            delivered_by_processor: false,
        }
    }

    pub fn fulfilled(detail: OutcomeDetail) -> Self {
        ReconcileOutcome {
            paid: true,
            fulfilled: true,
            outcome_detail: detail,
            delivered_by_processor: detail == OutcomeDetail::DeliveredByProcessor,
        }
    }

    pub fn terminal(detail: OutcomeDetail) -> Self {
        ReconcileOutcome {
            paid: false,
            fulfilled: false,
            outcome_detail: detail,
            delivered_by_processor: false,
        }
    }

    pub fn pending_delivery() -> Self {
        ReconcileOutcome {
            paid: true,
            fulfilled: false,
            outcome_detail: OutcomeDetail::PendingDelivery,
            delivered_by_processor: false,
        }
    }
}

/// The client-local pointer persisted while the user is off paying in an
/// external wallet app. Retention is 24 hours, scoped to the owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayment {
    pub processor: Processor,
    pub invoice_id: String,
    pub intent: PurchaseIntent,
    pub owner_user_id: String,
    pub created_at: DateTime<Utc>,
}
