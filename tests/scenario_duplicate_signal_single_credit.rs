mod common;

use storefront_relay::types::{Currency, InvoiceState, OutcomeDetail};

/// Processors redeliver webhooks. The second paid signal for the same
/// invoice must observe the first one's result, not credit again.
#[tokio::test]
async fn replayed_paid_signal_does_not_credit_twice() -> anyhow::Result<()> {
    let h = common::harness().await?;
    let intent = common::topup_intent("user-1", 25_000);
    let invoice = h.registry.create(&intent, h.adapter.as_ref()).await?;

    let first = h.reconciler.reconcile_paid_signal(&invoice.invoice_id).await?;
    assert!(first.fulfilled);
    assert_eq!(first.outcome_detail, OutcomeDetail::Credited);

    let second = h.reconciler.reconcile_paid_signal(&invoice.invoice_id).await?;
    assert!(second.fulfilled);
    assert_eq!(second.outcome_detail, OutcomeDetail::AlreadyFulfilled);

    assert_eq!(h.ledger.current_balance("user-1", Currency::Rub).await?, 25_000);
    assert_eq!(
        h.ledger.entries_for_invoice(&invoice.invoice_id).await?.len(),
        1
    );
    Ok(())
}

/// Webhook and client poll race on the same invoice: both return success to
/// their callers, the ledger records one entry.
#[tokio::test]
async fn webhook_and_poll_converge_on_one_credit() -> anyhow::Result<()> {
    let h = common::harness().await?;
    let intent = common::topup_intent("user-2", 40_000);
    let invoice = h.registry.create(&intent, h.adapter.as_ref()).await?;
    h.adapter.set_paid(&invoice.invoice_id);

    let id = invoice.invoice_id.clone();
    let webhook = {
        let reconciler = h.reconciler.clone();
        let id = id.clone();
        tokio::spawn(async move { reconciler.reconcile_paid_signal(&id).await })
    };
    let poll = {
        let reconciler = h.reconciler.clone();
        let id = id.clone();
        tokio::spawn(async move { reconciler.reconcile(&id).await })
    };

    let webhook = webhook.await??;
    let poll = poll.await??;
    assert!(webhook.paid && webhook.fulfilled);
    assert!(poll.paid && poll.fulfilled);

    assert_eq!(h.registry.get(&id).await?.state, InvoiceState::Fulfilled);
    assert_eq!(h.ledger.current_balance("user-2", Currency::Rub).await?, 40_000);
    assert_eq!(h.ledger.entries_for_invoice(&id).await?.len(), 1);
    Ok(())
}
