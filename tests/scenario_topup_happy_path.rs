mod common;

use storefront_relay::types::{InvoiceState, OutcomeDetail};

/// 500 RUB paid through the crypto processor lands as exactly 50_000 minor
/// units of stored balance, and the invoice ends up fulfilled.
#[tokio::test]
async fn paid_topup_credits_balance_once() -> anyhow::Result<()> {
    let h = common::harness().await?;
    let intent = common::topup_intent("user-1", 50_000);

    let invoice = h.registry.create(&intent, h.adapter.as_ref()).await?;
    assert_eq!(invoice.state, InvoiceState::Pending);
    assert!(invoice.pay_url.is_some());

    // Not paid yet: the poll consults the processor and changes nothing.
    let outcome = h.reconciler.reconcile(&invoice.invoice_id).await?;
    assert!(!outcome.paid);
    assert!(!outcome.fulfilled);
    assert_eq!(h.adapter.check_calls(), 1);
    assert_eq!(
        h.ledger
            .current_balance("user-1", storefront_relay::types::Currency::Rub)
            .await?,
        0
    );

    // Payment arrives on the processor side.
    h.adapter.set_paid(&invoice.invoice_id);

    let outcome = h.reconciler.reconcile(&invoice.invoice_id).await?;
    assert!(outcome.paid);
    assert!(outcome.fulfilled);
    assert_eq!(outcome.outcome_detail, OutcomeDetail::Credited);

    let stored = h.registry.get(&invoice.invoice_id).await?;
    assert_eq!(stored.state, InvoiceState::Fulfilled);
    assert_eq!(
        h.ledger
            .current_balance("user-1", storefront_relay::types::Currency::Rub)
            .await?,
        50_000
    );
    assert_eq!(
        h.ledger.entries_for_invoice(&invoice.invoice_id).await?.len(),
        1
    );
    Ok(())
}

/// A later poll on a fulfilled invoice reports the fact without touching the
/// processor or the ledger again.
#[tokio::test]
async fn repeated_poll_after_fulfillment_is_a_read() -> anyhow::Result<()> {
    let h = common::harness().await?;
    let intent = common::topup_intent("user-2", 10_000);
    let invoice = h.registry.create(&intent, h.adapter.as_ref()).await?;

    h.adapter.set_paid(&invoice.invoice_id);
    h.reconciler.reconcile(&invoice.invoice_id).await?;
    let polls_so_far = h.adapter.check_calls();

    let outcome = h.reconciler.reconcile(&invoice.invoice_id).await?;
    assert!(outcome.fulfilled);
    assert_eq!(outcome.outcome_detail, OutcomeDetail::AlreadyFulfilled);
    assert_eq!(h.adapter.check_calls(), polls_so_far);
    assert_eq!(
        h.ledger.entries_for_invoice(&invoice.invoice_id).await?.len(),
        1
    );
    Ok(())
}
