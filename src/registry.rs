//! Maps processor-issued invoice identifiers to purchase intents and their
//! fulfillment state.
//!
//! State transitions are compare-and-set: an `UPDATE` guarded by the expected
//! current state, never a blind overwrite. A transition to the state already
//! in place is an idempotent success, so racing callers converge instead of
//! erroring.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::adapters::ProcessorAdapter;
use crate::error::StoreError;
use crate::types::{Invoice, InvoiceState, PurchaseIntent};

const INVOICE_COLUMNS: &str = "invoice_id, processor, state, intent_id, kind, amount, currency, \
                               recipient, owner_user_id, pay_url, created_at, expires_at";

#[derive(Clone)]
pub struct InvoiceRegistry {
    pool: SqlitePool,
}

impl InvoiceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mints an invoice with the processor and persists it in `pending`.
    ///
    /// Minting happens before the insert and outside any transaction; the
    /// registry must not hold the database across a network call.
    pub async fn create(
        &self,
        intent: &PurchaseIntent,
        adapter: &dyn ProcessorAdapter,
    ) -> Result<Invoice, StoreError> {
        let minted = adapter.mint_invoice(intent).await?;
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO invoices
               (invoice_id, processor, state, intent_id, kind, amount, currency,
                recipient, owner_user_id, pay_url, created_at, expires_at)
               VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(&minted.invoice_id)
        .bind(adapter.processor())
        .bind(intent.intent_id.to_string())
        .bind(intent.kind)
        .bind(intent.amount)
        .bind(intent.currency)
        .bind(intent.recipient.as_deref())
        .bind(&intent.owner_user_id)
        .bind(minted.pay_url.as_deref())
        .bind(now)
        .bind(minted.expires_at)
        .execute(&self.pool)
        .await?;

        self.fetch(&minted.invoice_id)
            .await?
            .ok_or_else(|| StoreError::UnknownInvoice(minted.invoice_id.clone()))
    }

    /// Looks an invoice up, lazily expiring it when its processor-defined
    /// deadline has passed. Expiry happens on access, not via a sweep; an
    /// expired invoice has no further side effects.
    pub async fn get(&self, invoice_id: &str) -> Result<Invoice, StoreError> {
        let invoice = self
            .fetch(invoice_id)
            .await?
            .ok_or_else(|| StoreError::UnknownInvoice(invoice_id.to_string()))?;

        if invoice.state == InvoiceState::Pending
            && invoice.expires_at.is_some_and(|t| t <= Utc::now())
        {
            return match self.transition(invoice_id, InvoiceState::Expired).await {
                Ok(expired) => Ok(expired),
                // Lost the race to a concurrent payment confirmation.
                Err(StoreError::InvalidTransition { .. }) => self
                    .fetch(invoice_id)
                    .await?
                    .ok_or_else(|| StoreError::UnknownInvoice(invoice_id.to_string())),
                Err(e) => Err(e),
            };
        }

        Ok(invoice)
    }

    /// CAS transition along a legal state-machine edge.
    ///
    /// Safe to call concurrently for the same invoice: the winner applies
    /// the edge, any loser that requested the now-current state gets an
    /// idempotent success, and anything else gets `InvalidTransition`
    /// carrying the state actually observed.
    pub async fn transition(
        &self,
        invoice_id: &str,
        target: InvoiceState,
    ) -> Result<Invoice, StoreError> {
        // Every target in the machine has exactly one legal source.
        let source = match target {
            InvoiceState::Paid => InvoiceState::Pending,
            InvoiceState::Fulfilled => InvoiceState::Paid,
            InvoiceState::Expired | InvoiceState::Failed => InvoiceState::Pending,
            InvoiceState::Pending => {
                let current = self.get_state(invoice_id).await?;
                return Err(StoreError::InvalidTransition {
                    invoice_id: invoice_id.to_string(),
                    from: current,
                    to: target,
                });
            }
        };

        let res = sqlx::query(r#"UPDATE invoices SET state = ?2 WHERE invoice_id = ?1 AND state = ?3"#)
            .bind(invoice_id)
            .bind(target)
            .bind(source)
            .execute(&self.pool)
            .await?;

        let current = self
            .fetch(invoice_id)
            .await?
            .ok_or_else(|| StoreError::UnknownInvoice(invoice_id.to_string()))?;

        if res.rows_affected() == 1 || current.state == target {
            return Ok(current);
        }

        Err(StoreError::InvalidTransition {
            invoice_id: invoice_id.to_string(),
            from: current.state,
            to: target,
        })
    }

    /// Invoices owned by one user, newest first.
    pub async fn history(&self, owner_user_id: &str) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE owner_user_id = ?1 ORDER BY created_at DESC"
        ))
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn fetch(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = ?1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_state(&self, invoice_id: &str) -> Result<InvoiceState, StoreError> {
        let state: Option<InvoiceState> =
            sqlx::query_scalar(r#"SELECT state FROM invoices WHERE invoice_id = ?1"#)
                .bind(invoice_id)
                .fetch_optional(&self.pool)
                .await?;
        state.ok_or_else(|| StoreError::UnknownInvoice(invoice_id.to_string()))
    }
}
