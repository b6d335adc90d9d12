//! The reconciliation engine: confirms payment and performs exactly-once
//! fulfillment for an invoice.
//!
//! Two independent triggers invoke it concurrently, inbound webhooks and
//! client polls, possibly from several devices at once. Correctness does not
//! come from serializing them: every transition is a compare-and-set keyed by
//! `invoice_id`, and the ledger credit is guarded by a per-invoice unique
//! index, so parallel attempts converge on one `fulfilled` invoice and one
//! ledger entry.

use std::sync::Arc;

use tracing::{info, warn};

use crate::adapters::AdapterSet;
use crate::error::StoreError;
use crate::ledger::LedgerStore;
use crate::registry::InvoiceRegistry;
use crate::types::{
    Invoice, InvoiceState, LedgerReason, OutcomeDetail, PurchaseKind, ReconcileOutcome,
};

pub struct Reconciler {
    registry: InvoiceRegistry,
    ledger: LedgerStore,
    adapters: Arc<AdapterSet>,
    delivery: Arc<dyn crate::delivery::DeliveryService>,
}

impl Reconciler {
    pub fn new(
        registry: InvoiceRegistry,
        ledger: LedgerStore,
        adapters: Arc<AdapterSet>,
        delivery: Arc<dyn crate::delivery::DeliveryService>,
    ) -> Self {
        Self {
            registry,
            ledger,
            adapters,
            delivery,
        }
    }

    /// Client-poll entry point: consults the processor when the invoice is
    /// still pending. Processor transport failures degrade to "not yet
    /// paid" and the client keeps polling; they are never surfaced raw.
    pub async fn reconcile(&self, invoice_id: &str) -> Result<ReconcileOutcome, StoreError> {
        let invoice = self.registry.get(invoice_id).await?;

        match invoice.state {
            InvoiceState::Fulfilled => {
                Ok(ReconcileOutcome::fulfilled(OutcomeDetail::AlreadyFulfilled))
            }
            InvoiceState::Expired => Ok(ReconcileOutcome::terminal(OutcomeDetail::Expired)),
            InvoiceState::Failed => Ok(ReconcileOutcome::terminal(OutcomeDetail::Failed)),
            InvoiceState::Paid => self.fulfill(invoice).await,
            InvoiceState::Pending => {
                let adapter = self.adapters.get(invoice.processor)?;
                let status = match adapter.check_paid(invoice_id).await {
                    Ok(status) => status,
                    Err(StoreError::Processor(e)) => {
                        warn!(invoice_id, error = %e, "check_paid failed; not yet paid");
                        return Ok(ReconcileOutcome::not_paid());
                    }
                    Err(StoreError::Http(e)) => {
                        warn!(invoice_id, error = %e, "check_paid transport error; not yet paid");
                        return Ok(ReconcileOutcome::not_paid());
                    }
                    Err(e) => return Err(e),
                };
                if !status.paid {
                    return Ok(ReconcileOutcome::not_paid());
                }
                self.mark_paid_and_fulfill(invoice_id).await
            }
        }
    }

    /// Webhook entry point: the processor already asserted payment (behind
    /// its authenticity check), so the poll is skipped.
    pub async fn reconcile_paid_signal(
        &self,
        invoice_id: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        let invoice = self.registry.get(invoice_id).await?;

        match invoice.state {
            InvoiceState::Fulfilled => {
                Ok(ReconcileOutcome::fulfilled(OutcomeDetail::AlreadyFulfilled))
            }
            // A stale paid signal after expiry/failure has no side effect.
            InvoiceState::Expired => Ok(ReconcileOutcome::terminal(OutcomeDetail::Expired)),
            InvoiceState::Failed => Ok(ReconcileOutcome::terminal(OutcomeDetail::Failed)),
            InvoiceState::Paid => self.fulfill(invoice).await,
            InvoiceState::Pending => self.mark_paid_and_fulfill(invoice_id).await,
        }
    }

    /// `pending -> paid`, then fulfillment. When a webhook and a poll race,
    /// whichever gets here first wins the transition; the loser observes
    /// `paid` (idempotent CAS) or `fulfilled` and converges.
    async fn mark_paid_and_fulfill(&self, invoice_id: &str) -> Result<ReconcileOutcome, StoreError> {
        let invoice = match self.registry.transition(invoice_id, InvoiceState::Paid).await {
            Ok(invoice) => invoice,
            Err(StoreError::InvalidTransition {
                from: InvoiceState::Fulfilled,
                ..
            }) => return Ok(ReconcileOutcome::fulfilled(OutcomeDetail::AlreadyFulfilled)),
            Err(StoreError::InvalidTransition {
                from: InvoiceState::Expired,
                ..
            }) => return Ok(ReconcileOutcome::terminal(OutcomeDetail::Expired)),
            Err(StoreError::InvalidTransition {
                from: InvoiceState::Failed,
                ..
            }) => return Ok(ReconcileOutcome::terminal(OutcomeDetail::Failed)),
            Err(e) => return Err(e),
        };
        self.fulfill(invoice).await
    }

    /// Fulfillment for a `paid` invoice: ledger credit for balance topups,
    /// the delivery collaborator for everything else. On delivery failure
    /// the invoice stays `paid` and the caller retries later; the ledger
    /// guard makes the retry safe.
    async fn fulfill(&self, invoice: Invoice) -> Result<ReconcileOutcome, StoreError> {
        let adapter = self.adapters.get(invoice.processor)?;

        if adapter.delivers_on_payment() {
            self.finish(&invoice.invoice_id).await?;
            info!(invoice_id = %invoice.invoice_id, "fulfilled; delivered by processor");
            return Ok(ReconcileOutcome::fulfilled(
                OutcomeDetail::DeliveredByProcessor,
            ));
        }

        match invoice.kind {
            PurchaseKind::BalanceTopup => {
                let credit = self
                    .ledger
                    .apply_entry(
                        &invoice.owner_user_id,
                        invoice.currency,
                        invoice.amount,
                        LedgerReason::Topup,
                        Some(&invoice.invoice_id),
                    )
                    .await;
                match credit {
                    Ok(_) => {}
                    // A concurrent reconciliation got the credit in first;
                    // converge on its result.
                    Err(StoreError::DuplicateInvoiceCredit(id)) => {
                        warn!(invoice_id = %id, "invoice already credited; converging");
                    }
                    Err(e) => return Err(e),
                }
                self.finish(&invoice.invoice_id).await?;
                info!(
                    invoice_id = %invoice.invoice_id,
                    user_id = %invoice.owner_user_id,
                    amount = invoice.amount,
                    currency = %invoice.currency,
                    "balance topup fulfilled"
                );
                Ok(ReconcileOutcome::fulfilled(OutcomeDetail::Credited))
            }
            _ => match self.delivery.deliver(&invoice).await {
                Ok(()) => {
                    self.finish(&invoice.invoice_id).await?;
                    info!(
                        invoice_id = %invoice.invoice_id,
                        kind = invoice.kind.as_str(),
                        "delivery acknowledged; invoice fulfilled"
                    );
                    Ok(ReconcileOutcome::fulfilled(OutcomeDetail::Delivered))
                }
                Err(e) => {
                    warn!(
                        invoice_id = %invoice.invoice_id,
                        error = %e,
                        "delivery failed; invoice stays paid for retry"
                    );
                    Ok(ReconcileOutcome::pending_delivery())
                }
            },
        }
    }

    /// `paid -> fulfilled`. A racer that already finished is a success.
    async fn finish(&self, invoice_id: &str) -> Result<(), StoreError> {
        match self
            .registry
            .transition(invoice_id, InvoiceState::Fulfilled)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidTransition {
                from: InvoiceState::Fulfilled,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
