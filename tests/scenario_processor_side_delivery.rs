mod common;

use storefront_relay::types::{InvoiceState, OutcomeDetail};

/// The peer wallet hands the asset over inside its own payment flow. Once
/// paid, the relay only records the fact: no ledger credit, no delivery call.
#[tokio::test]
async fn processor_delivered_purchase_skips_ledger_and_delivery() -> anyhow::Result<()> {
    let h = common::harness().await?;
    let intent = common::topup_intent("user-1", 20_000);
    let invoice = h
        .registry
        .create(&intent, h.delivering_adapter.as_ref())
        .await?;
    h.delivering_adapter.set_paid(&invoice.invoice_id);

    let outcome = h.reconciler.reconcile(&invoice.invoice_id).await?;
    assert!(outcome.fulfilled);
    assert!(outcome.delivered_by_processor);
    assert_eq!(outcome.outcome_detail, OutcomeDetail::DeliveredByProcessor);

    assert_eq!(
        h.registry.get(&invoice.invoice_id).await?.state,
        InvoiceState::Fulfilled
    );
    assert!(h.ledger.entries_for_invoice(&invoice.invoice_id).await?.is_empty());
    assert!(h.delivery.delivered().is_empty());
    Ok(())
}
