//! Payment Flow Tests: one send from amount selection to settlement
//!
//! These tests verify:
//! 1. Unregistered recipients never reach quoting or execution
//! 2. Quick and custom (fiat) amounts produce a quote
//! 3. Execution failures leave the balance and execution slot intact
//! 4. Expired quotes are re-quoted; fee changes need a second confirm
//! 5. At most one payment executes per session
//! 6. Close is refused while executing and discards otherwise
//! 7. Locking the session mid-flow fails the attempt

use beezap::{
    AmountInput, AttemptState, BackendError, ConfirmOutcome, FeeSchedule, FixedPriceSource, FlowError, KdfParams,
    ManualClock, MemorySecretStore, PayableHandle, PaymentError, PaymentFlowOrchestrator, PriceConverter, SandboxBackend,
    WalletConfig, WalletSessionManager,
};
use std::sync::Arc;
use std::time::Duration;

const PASSWORD: &str = "correct horse battery staple";
const ALICE: &str = "alice@example.com";

struct Harness {
    backend: SandboxBackend,
    clock: ManualClock,
    prices: Arc<PriceConverter>,
    session: Arc<WalletSessionManager>,
}

async fn harness_with_prices(source: FixedPriceSource) -> Harness {
    let clock = ManualClock::new();
    let backend = SandboxBackend::builder()
        .clock(Arc::new(clock.clone()))
        .quote_ttl(Duration::from_secs(30))
        .opening_balance(10_000)
        .build();
    backend.register_recipient(ALICE);

    let config = WalletConfig::new("payment-tests").with_kdf(KdfParams::light());
    let session = Arc::new(WalletSessionManager::new(
        config,
        Arc::new(MemorySecretStore::new()),
        Arc::new(backend.clone()),
        Arc::new(clock.clone()),
    ));
    session.create(PASSWORD).await.expect("create wallet");
    assert_eq!(session.session().balance(), Some(10_000));

    let prices = Arc::new(PriceConverter::new(Arc::new(source), Duration::from_secs(1), Duration::from_secs(300)));
    Harness { backend, clock, prices, session }
}

async fn harness() -> Harness {
    harness_with_prices(FixedPriceSource::with_rate(50_000.0, "USD")).await
}

impl Harness {
    async fn open(&self, recipient: &str) -> Arc<PaymentFlowOrchestrator> {
        Arc::new(PaymentFlowOrchestrator::open(self.session.clone(), self.prices.clone(), recipient).await)
    }

    /// Open an attempt to Alice and bring it to `AwaitingConfirmation`.
    async fn quoted(&self, amount: u64) -> Arc<PaymentFlowOrchestrator> {
        let flow = self.open(ALICE).await;
        assert_eq!(flow.select_quick_amount(amount).await.unwrap(), AttemptState::AwaitingConfirmation);
        flow
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Test: unknown recipient ends the attempt before any quote or execution
#[tokio::test]
async fn unregistered_recipient_never_quotes() {
    let h = harness().await;
    let flow = h.open("bob@example.com").await;
    assert_eq!(flow.state(), AttemptState::RecipientHasNoWallet);

    let err = flow.select_quick_amount(1_000).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidState { .. }));
    assert_eq!(h.backend.calls().prepare_quote, 0);
    assert_eq!(h.backend.calls().execute, 0);
    assert!(flow.close().is_ok());
}

/// Test: an unparseable address never reaches the backend
#[tokio::test]
async fn malformed_address_has_no_wallet() {
    let h = harness().await;
    let flow = h.open("not an address").await;
    assert_eq!(flow.state(), AttemptState::RecipientHasNoWallet);
    assert_eq!(h.backend.calls().resolve, 0);
}

/// Test: quick amount → quote → confirm → settled
#[tokio::test]
async fn quick_amount_settles() {
    let h = harness().await;
    let flow = h.open(ALICE).await;
    assert_eq!(flow.state(), AttemptState::SelectingAmount);
    assert!(flow.attempt().payable.is_some());
    assert_eq!(flow.quick_amounts(), vec![21, 100, 1_000, 5_000, 10_000]);

    flow.select_quick_amount(1_000).await.unwrap();
    let attempt = flow.attempt();
    assert_eq!(attempt.state, AttemptState::AwaitingConfirmation);
    assert_eq!(attempt.amount, Some(1_000));
    assert_eq!(attempt.fee(), Some(5));

    let receipt = match flow.confirm().await.unwrap() {
        ConfirmOutcome::Settled(receipt) => receipt,
        other => panic!("expected settlement, got {other:?}"),
    };
    assert_eq!((receipt.amount, receipt.fee), (1_000, 5));
    assert_eq!(flow.state(), AttemptState::Settled);
    assert_eq!(flow.attempt().receipt, Some(receipt));

    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(8_995));
    assert!(h.session.execution_slot_available());
}

/// Test: a failed execution keeps the balance and frees the slot
#[tokio::test]
async fn execution_failure_is_reported() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;
    h.backend.fail_next_execute(BackendError::Network("connection reset".into()));

    let outcome = flow.confirm().await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Failed(PaymentError::ExecutionFailed(_))));
    assert_eq!(flow.state(), AttemptState::Failed);
    assert!(matches!(flow.attempt().error, Some(PaymentError::ExecutionFailed(_))));

    assert!(h.session.execution_slot_available());
    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(10_000));
    assert!(matches!(flow.confirm().await.unwrap_err(), FlowError::InvalidState { .. }));
}

/// Test: an expired quote with the same fee is refreshed transparently
#[tokio::test]
async fn expired_quote_is_requoted() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;
    let first = flow.attempt().quote.unwrap();

    h.clock.advance(Duration::from_secs(31));
    let outcome = flow.confirm().await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Settled(_)));
    assert_eq!(h.backend.calls().prepare_quote, 2);
    assert_ne!(flow.attempt().quote.unwrap().id, first.id);
}

/// Test: a changed fee on re-quote needs a second confirm
#[tokio::test]
async fn changed_fee_requires_reconfirmation() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;

    h.backend.set_fees(FeeSchedule { base: 10, ppm: 5_000 });
    h.clock.advance(Duration::from_secs(31));

    match flow.confirm().await.unwrap() {
        ConfirmOutcome::Requoted { previous_fee, quote } => {
            assert_eq!(previous_fee, 5);
            assert_eq!(quote.fee, 15);
        }
        other => panic!("expected requote, got {other:?}"),
    }
    assert_eq!(flow.state(), AttemptState::AwaitingConfirmation);
    assert_eq!(h.backend.calls().execute, 0);

    let outcome = flow.confirm().await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Settled(ref r) if r.fee == 15));
    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(8_985));
}

/// Test: two confirms never execute at the same time
#[tokio::test]
async fn one_execution_per_session() {
    let h = harness().await;
    let first = h.quoted(1_000).await;
    let second = h.quoted(2_000).await;

    h.backend.hold_executions();
    let a = tokio::spawn({
        let flow = first.clone();
        async move { flow.confirm().await }
    });
    wait_until("first execution", || h.backend.in_flight_executions() == 1).await;

    let b = tokio::spawn({
        let flow = second.clone();
        async move { flow.confirm().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.state(), AttemptState::AwaitingConfirmation);
    assert_eq!(h.backend.calls().execute, 1);

    h.backend.release_executions();
    assert!(matches!(a.await.unwrap().unwrap(), ConfirmOutcome::Settled(_)));
    assert!(matches!(b.await.unwrap().unwrap(), ConfirmOutcome::Settled(_)));
    assert_eq!(h.backend.max_concurrent_executions(), 1);
    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(10_000 - 1_005 - 2_010));
}

/// Test: a quote that expires while waiting for the slot is re-quoted before executing
#[tokio::test]
async fn quote_expiring_behind_another_execution_is_requoted() {
    let h = harness().await;
    let first = h.quoted(1_000).await;
    let second = h.quoted(2_000).await;
    let stale = second.attempt().quote.unwrap();

    h.backend.hold_executions();
    let a = tokio::spawn({
        let flow = first.clone();
        async move { flow.confirm().await }
    });
    wait_until("first execution", || h.backend.in_flight_executions() == 1).await;
    let b = tokio::spawn({
        let flow = second.clone();
        async move { flow.confirm().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.clock.advance(Duration::from_secs(31));
    h.backend.release_executions();
    assert!(matches!(a.await.unwrap().unwrap(), ConfirmOutcome::Failed(_)));
    assert!(matches!(b.await.unwrap().unwrap(), ConfirmOutcome::Settled(_)));

    assert_eq!(h.backend.calls().prepare_quote, 3);
    assert_ne!(second.attempt().quote.unwrap().id, stale.id);
    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(10_000 - 2_010));
}

/// Test: close is refused while executing and allowed once settled
#[tokio::test]
async fn close_refused_while_executing() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;

    h.backend.hold_executions();
    let task = tokio::spawn({
        let flow = flow.clone();
        async move { flow.confirm().await }
    });
    wait_until("execution", || h.backend.in_flight_executions() == 1).await;
    assert_eq!(flow.state(), AttemptState::Executing);
    assert_eq!(flow.close().unwrap_err(), FlowError::ExecutionInFlight);

    h.backend.release_executions();
    assert!(matches!(task.await.unwrap().unwrap(), ConfirmOutcome::Settled(_)));
    assert!(flow.close().is_ok());
    assert!(flow.is_discarded());
}

/// Test: closing while waiting for the execution slot discards the attempt
#[tokio::test]
async fn close_while_waiting_for_slot() {
    let h = harness().await;
    let first = h.quoted(1_000).await;
    let second = h.quoted(2_000).await;

    h.backend.hold_executions();
    let a = tokio::spawn({
        let flow = first.clone();
        async move { flow.confirm().await }
    });
    wait_until("first execution", || h.backend.in_flight_executions() == 1).await;
    let b = tokio::spawn({
        let flow = second.clone();
        async move { flow.confirm().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    second.close().unwrap();
    assert_eq!(b.await.unwrap().unwrap_err(), FlowError::Discarded);

    h.backend.release_executions();
    assert!(matches!(a.await.unwrap().unwrap(), ConfirmOutcome::Settled(_)));
    assert_eq!(h.backend.calls().execute, 1);
    assert!(h.session.execution_slot_available());
}

/// Test: a discarded attempt accepts no further actions
#[tokio::test]
async fn discarded_attempt_is_inert() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;
    flow.close().unwrap();

    assert_eq!(flow.confirm().await.unwrap_err(), FlowError::Discarded);
    assert_eq!(h.backend.calls().execute, 0);
    assert_eq!(h.session.refresh_balance().await.unwrap(), Some(10_000));
}

/// Test: fiat entry converts through the price quote
#[tokio::test]
async fn fiat_amount_is_converted() {
    let h = harness().await;
    let flow = h.open(ALICE).await;
    flow.choose_custom().unwrap();
    assert_eq!(flow.state(), AttemptState::EnteringCustomAmount);

    flow.enter_custom_amount(AmountInput::Fiat(1.0)).await.unwrap();
    assert_eq!(flow.attempt().amount, Some(2_000));
    let shown = flow.display_value(2_000).await.value().expect("price available");
    assert!((shown - 1.0).abs() < 1e-9);
}

/// Test: fiat entry without a price is refused, sats still work
#[tokio::test]
async fn fiat_without_price_is_unavailable() {
    let h = harness_with_prices(FixedPriceSource::new(None)).await;
    let flow = h.open(ALICE).await;
    flow.choose_custom().unwrap();

    assert_eq!(flow.enter_custom_amount(AmountInput::Fiat(5.0)).await.unwrap_err(), FlowError::PriceUnavailable);
    assert_eq!(flow.state(), AttemptState::EnteringCustomAmount);
    assert_eq!(flow.display_value(1_000).await.value(), None);

    flow.enter_custom_amount(AmountInput::Native(1_500)).await.unwrap();
    assert_eq!(flow.state(), AttemptState::AwaitingConfirmation);
}

/// Test: zero and non-positive amounts never reach the backend
#[tokio::test]
async fn zero_amount_rejected() {
    let h = harness().await;
    let flow = h.open(ALICE).await;
    assert!(matches!(flow.select_quick_amount(0).await.unwrap_err(), FlowError::InvalidAmount(_)));

    flow.choose_custom().unwrap();
    assert!(matches!(flow.enter_custom_amount(AmountInput::Native(0)).await.unwrap_err(), FlowError::InvalidAmount(_)));
    assert!(matches!(flow.enter_custom_amount(AmountInput::Fiat(-2.0)).await.unwrap_err(), FlowError::InvalidAmount(_)));
    assert!(matches!(
        flow.enter_custom_amount(AmountInput::Fiat(0.000_000_001)).await.unwrap_err(),
        FlowError::InvalidAmount(_)
    ));
    assert_eq!(flow.state(), AttemptState::EnteringCustomAmount);
    assert_eq!(h.backend.calls().prepare_quote, 0);
}

/// Test: amounts outside the recipient's range fail without a quote
#[tokio::test]
async fn amount_out_of_bounds() {
    let h = harness().await;
    h.backend.register_payable(PayableHandle {
        address: "tiny@example.com".into(),
        reference: "sandbox:tiny".into(),
        min_sendable: 10,
        max_sendable: 500,
        comment_allowed: 0,
        description: None,
    });
    let flow = h.open("tiny@example.com").await;

    assert_eq!(flow.select_quick_amount(1_000).await.unwrap(), AttemptState::Failed);
    assert_eq!(flow.attempt().error, Some(PaymentError::AmountOutOfBounds { amount: 1_000, min: 10, max: 500 }));
    assert_eq!(h.backend.calls().prepare_quote, 0);
}

/// Test: comments are cut to what the recipient accepts
#[tokio::test]
async fn comment_is_truncated() {
    let h = harness().await;
    h.backend.register_payable(PayableHandle {
        address: "short@example.com".into(),
        reference: "sandbox:short".into(),
        min_sendable: 1,
        max_sendable: 10_000,
        comment_allowed: 5,
        description: None,
    });
    let flow = h.open("short@example.com").await;
    assert_eq!(flow.set_comment("hello world").unwrap().as_deref(), Some("hello"));

    flow.select_quick_amount(100).await.unwrap();
    assert_eq!(flow.attempt().quote.unwrap().comment.as_deref(), Some("hello"));
    assert!(matches!(flow.set_comment("later").unwrap_err(), FlowError::InvalidState { .. }));
}

/// Test: quoting on a locked session fails the attempt
#[tokio::test]
async fn locked_session_cannot_quote() {
    let h = harness().await;
    let flow = h.open(ALICE).await;
    h.session.lock().await;

    assert_eq!(flow.select_quick_amount(1_000).await.unwrap(), AttemptState::Failed);
    assert_eq!(flow.attempt().error, Some(PaymentError::SessionNotConnected));
    assert_eq!(h.backend.calls().prepare_quote, 0);
}

/// Test: opening while locked defers resolution to quoting
#[tokio::test]
async fn resolution_deferred_until_unlock() {
    let h = harness().await;
    h.session.lock().await;
    let flow = h.open(ALICE).await;
    assert_eq!(flow.state(), AttemptState::SelectingAmount);
    assert!(flow.attempt().payable.is_none());

    h.session.unlock(PASSWORD).await.unwrap();
    flow.select_quick_amount(1_000).await.unwrap();
    assert!(flow.attempt().payable.is_some());
    assert_eq!(flow.state(), AttemptState::AwaitingConfirmation);
}

/// Test: locking during execution ends the attempt as not connected
#[tokio::test]
async fn lock_during_execution() {
    let h = harness().await;
    let flow = h.quoted(1_000).await;

    h.backend.hold_executions();
    let task = tokio::spawn({
        let flow = flow.clone();
        async move { flow.confirm().await }
    });
    wait_until("execution", || h.backend.in_flight_executions() == 1).await;
    h.session.lock().await;
    h.backend.release_executions();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, ConfirmOutcome::Failed(PaymentError::SessionNotConnected));
    assert_eq!(flow.state(), AttemptState::Failed);
    assert!(h.session.execution_slot_available());

    h.session.unlock(PASSWORD).await.unwrap();
    assert_eq!(h.session.session().balance(), Some(10_000));
}

/// Test: watch() reports each step of the attempt
#[tokio::test]
async fn watch_follows_attempt() {
    let h = harness().await;
    let flow = h.open(ALICE).await;
    let mut rx = flow.watch();
    assert_eq!(*rx.borrow_and_update(), AttemptState::SelectingAmount);

    flow.select_quick_amount(100).await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), AttemptState::AwaitingConfirmation);

    flow.confirm().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), AttemptState::Settled);
}
