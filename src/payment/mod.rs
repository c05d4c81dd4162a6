//! PaymentFlowOrchestrator - drives one send from amount selection to settlement.
//!
//! ```text
//! SelectingAmount ──quick──▶ Quoting ──▶ AwaitingConfirmation ──confirm──▶ Executing ──▶ Settled
//!       │                      │  ▲              │                              │
//!       └─custom─▶ EnteringCustomAmount          └── expired quote: re-quote    └──▶ Failed
//!       │                      │
//!       └──────────────────────┴──▶ RecipientHasNoWallet / Failed
//! ```
//!
//! One orchestrator per attempt. User actions are serialized; `close` is not,
//! so a slow quote can still be dismissed. Closing while `Executing` is
//! refused because a sent payment cannot be recalled.
//!
//! The session's execution slot is taken only for the `execute` call itself,
//! and waiting for it can be cut short by `close`.

mod attempt;
mod input;

pub use attempt::{AttemptState, PaymentAttempt};
pub use input::{truncate_comment, AmountInput};

use crate::address::PaymentAddress;
use crate::backend::{Quote, Resolution, SettlementReceipt};
use crate::error::{FlowError, PaymentError};
use crate::price::{DisplayValue, PriceConverter};
use crate::session::WalletSessionManager;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of a `confirm` that was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Settled(SettlementReceipt),
    Failed(PaymentError),
    /// The quote had expired and the fresh one carries a different fee. The
    /// attempt is back in `AwaitingConfirmation`; confirm again to accept it.
    Requoted { previous_fee: u64, quote: Quote },
}

enum Requote {
    Unchanged(Quote),
    Stop(ConfirmOutcome),
}

struct Flow {
    attempt: PaymentAttempt,
    discarded: bool,
}

pub struct PaymentFlowOrchestrator {
    session: Arc<WalletSessionManager>,
    prices: Arc<PriceConverter>,
    flow: Mutex<Flow>,
    state_tx: watch::Sender<AttemptState>,
    cancel: watch::Sender<bool>,
    actions: tokio::sync::Mutex<()>,
}

impl PaymentFlowOrchestrator {
    /// Start an attempt for `recipient`. Address problems known up front end
    /// the attempt in `RecipientHasNoWallet` immediately. If the session is
    /// not connected yet, resolution waits for quoting.
    pub async fn open(session: Arc<WalletSessionManager>, prices: Arc<PriceConverter>, recipient: &str) -> Self {
        let attempt = PaymentAttempt::new(recipient.trim().to_string());
        let (state_tx, _) = watch::channel(attempt.state);
        let (cancel, _) = watch::channel(false);
        let orchestrator = Self {
            session,
            prices,
            flow: Mutex::new(Flow { attempt, discarded: false }),
            state_tx,
            cancel,
            actions: tokio::sync::Mutex::new(()),
        };
        orchestrator.check_recipient().await;
        orchestrator
    }

    async fn check_recipient(&self) {
        let recipient = self.flow().attempt.recipient_address.clone();
        let address = match PaymentAddress::parse(&recipient) {
            Ok(address) => address,
            Err(e) => {
                info!(error = %e, "recipient has no payment address");
                let _ = self.advance(AttemptState::RecipientHasNoWallet, |_| {});
                return;
            }
        };
        let live = match self.session.live_backend().await {
            Ok(live) => live,
            Err(e) => {
                debug!(error = %e, "recipient resolution deferred until quoting");
                return;
            }
        };
        match live.session().resolve_address(address.as_str()).await {
            Ok(Resolution::Payable(payable)) => {
                debug!(address = %payable.address, "recipient resolved");
                self.flow().attempt.payable = Some(payable);
            }
            Ok(Resolution::NotFound) | Ok(Resolution::Invalid(_)) => {
                info!(address = %address, "recipient is not registered");
                let _ = self.advance(AttemptState::RecipientHasNoWallet, |_| {});
            }
            Err(e) => debug!(error = %e, "recipient resolution deferred until quoting"),
        }
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    pub fn attempt(&self) -> PaymentAttempt { self.flow().attempt.clone() }

    pub fn state(&self) -> AttemptState { self.flow().attempt.state }

    pub fn watch(&self) -> watch::Receiver<AttemptState> { self.state_tx.subscribe() }

    pub fn is_discarded(&self) -> bool { self.flow().discarded }

    pub fn quick_amounts(&self) -> Vec<u64> { self.session.config().quick_amounts.clone() }

    /// Fiat rendering of `amount`, or `Unavailable` with no price quote.
    pub async fn display_value(&self, amount: u64) -> DisplayValue { self.prices.to_display_unit(amount).await }

    // ---------------------------------------------------------------------
    // User actions
    // ---------------------------------------------------------------------

    pub async fn select_quick_amount(&self, amount: u64) -> Result<AttemptState, FlowError> {
        let _action = self.actions.lock().await;
        {
            let mut flow = self.flow();
            ensure(&flow, "select an amount", &[AttemptState::SelectingAmount])?;
            if amount == 0 {
                return Err(FlowError::InvalidAmount("amount must be at least 1 sat".into()));
            }
            flow.attempt.amount = Some(amount);
            self.transition(&mut flow, AttemptState::Quoting)?;
        }
        self.quote().await
    }

    pub fn choose_custom(&self) -> Result<(), FlowError> {
        let mut flow = self.flow();
        ensure(&flow, "enter a custom amount", &[AttemptState::SelectingAmount])?;
        self.transition(&mut flow, AttemptState::EnteringCustomAmount)
    }

    pub async fn enter_custom_amount(&self, input: AmountInput) -> Result<AttemptState, FlowError> {
        let _action = self.actions.lock().await;
        ensure(&self.flow(), "confirm an amount", &[AttemptState::EnteringCustomAmount])?;

        let amount = match input {
            AmountInput::Native(sats) => sats,
            AmountInput::Fiat(value) => {
                if !value.is_finite() || value <= 0.0 {
                    return Err(FlowError::InvalidAmount(format!("{value} is not a positive amount")));
                }
                self.prices.to_native_unit(value).await.ok_or(FlowError::PriceUnavailable)?
            }
        };
        if amount == 0 {
            return Err(FlowError::InvalidAmount("amount must be at least 1 sat".into()));
        }

        {
            let mut flow = self.flow();
            ensure(&flow, "confirm an amount", &[AttemptState::EnteringCustomAmount])?;
            flow.attempt.amount = Some(amount);
            self.transition(&mut flow, AttemptState::Quoting)?;
        }
        self.quote().await
    }

    /// Attach a comment before quoting. Returns the comment as it will be
    /// sent, truncated to what the recipient accepts when that is known.
    pub fn set_comment(&self, comment: &str) -> Result<Option<String>, FlowError> {
        let mut flow = self.flow();
        ensure(&flow, "edit the comment", &[AttemptState::SelectingAmount, AttemptState::EnteringCustomAmount])?;
        let effective = match &flow.attempt.payable {
            Some(payable) => truncate_comment(comment, payable.comment_allowed),
            None => truncate_comment(comment, usize::MAX),
        };
        flow.attempt.comment = effective.clone();
        Ok(effective)
    }

    /// Execute against the current quote, re-quoting first if it expired.
    pub async fn confirm(&self) -> Result<ConfirmOutcome, FlowError> {
        let _action = self.actions.lock().await;
        let quote = {
            let flow = self.flow();
            ensure(&flow, "confirm", &[AttemptState::AwaitingConfirmation])?;
            match flow.attempt.quote.clone() {
                Some(quote) => quote,
                None => return Err(invalid("confirm", flow.attempt.state)),
            }
        };

        let slot = tokio::select! {
            slot = self.session.acquire_execution_slot() => match slot {
                Ok(slot) => slot,
                Err(_) => return self.fail_with(PaymentError::ExecutionFailed("execution slot closed".into())),
            },
            _ = wait_cancelled(self.cancel.subscribe()) => return Err(FlowError::Discarded),
        };

        // Expiry is judged only once the slot is held.
        let quote = if quote.is_expired(self.session.clock().now()) {
            match self.requote(&quote).await? {
                Requote::Unchanged(fresh) => fresh,
                Requote::Stop(outcome) => return Ok(outcome),
            }
        } else {
            quote
        };

        let live = match self.session.live_backend().await {
            Ok(live) => live,
            Err(e) => {
                info!(error = %e, "session not connected at confirm");
                return self.fail_with(PaymentError::SessionNotConnected);
            }
        };
        self.advance(AttemptState::Executing, |_| {})?;
        info!(amount_sat = quote.amount, fee_sat = quote.fee, quote = %quote.id, "executing payment");

        let result = live.session().execute(&quote).await;
        let still_live = self.session.is_live(live.epoch());

        let outcome = match result {
            Ok(receipt) => {
                if !still_live {
                    warn!(payment_id = %receipt.payment_id, "payment settled after the session ended");
                }
                info!(payment_id = %receipt.payment_id, amount_sat = receipt.amount, "payment settled");
                let stored = receipt.clone();
                self.advance(AttemptState::Settled, move |attempt| attempt.receipt = Some(stored))?;
                ConfirmOutcome::Settled(receipt)
            }
            Err(e) => {
                let error = if still_live { PaymentError::from(e) } else { PaymentError::SessionNotConnected };
                warn!(error = %error, "payment failed");
                let stored = error.clone();
                self.advance(AttemptState::Failed, move |attempt| attempt.error = Some(stored))?;
                ConfirmOutcome::Failed(error)
            }
        };
        drop(slot);
        Ok(outcome)
    }

    /// Dismiss the attempt. Refused only while `Executing`.
    pub fn close(&self) -> Result<(), FlowError> {
        let mut flow = self.flow();
        if flow.attempt.state == AttemptState::Executing {
            return Err(FlowError::ExecutionInFlight);
        }
        if !flow.discarded {
            flow.discarded = true;
            self.cancel.send_replace(true);
            debug!(state = flow.attempt.state.as_str(), "payment attempt discarded");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn flow(&self) -> MutexGuard<'_, Flow> {
        self.flow.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&self, flow: &mut Flow, next: AttemptState) -> Result<(), FlowError> {
        let current = flow.attempt.state;
        if !current.can_transition_to(next) {
            return Err(invalid("move to that step", current));
        }
        flow.attempt.state = next;
        self.state_tx.send_replace(next);
        debug!(from = current.as_str(), to = next.as_str(), "payment attempt transition");
        Ok(())
    }

    /// Transition unless the attempt was discarded meanwhile.
    fn advance(&self, next: AttemptState, edit: impl FnOnce(&mut PaymentAttempt)) -> Result<AttemptState, FlowError> {
        let mut flow = self.flow();
        if flow.discarded {
            return Err(FlowError::Discarded);
        }
        self.transition(&mut flow, next)?;
        edit(&mut flow.attempt);
        Ok(next)
    }

    fn fail(&self, error: PaymentError) -> Result<AttemptState, FlowError> {
        self.advance(AttemptState::Failed, move |attempt| attempt.error = Some(error))
    }

    fn fail_with(&self, error: PaymentError) -> Result<ConfirmOutcome, FlowError> {
        self.fail(error.clone())?;
        Ok(ConfirmOutcome::Failed(error))
    }

    /// Resolve if needed, check bounds, and obtain a quote. Entered in `Quoting`.
    async fn quote(&self) -> Result<AttemptState, FlowError> {
        let live = match self.session.live_backend().await {
            Ok(live) => live,
            Err(e) => {
                info!(error = %e, "cannot quote without a live session");
                return self.fail(PaymentError::SessionNotConnected);
            }
        };

        let (recipient, known, amount, comment) = {
            let flow = self.flow();
            let attempt = &flow.attempt;
            (attempt.recipient_address.clone(), attempt.payable.clone(), attempt.amount, attempt.comment.clone())
        };
        let Some(amount) = amount else {
            return Err(invalid("quote", AttemptState::Quoting));
        };

        let payable = match known {
            Some(payable) => payable,
            None => match live.session().resolve_address(&recipient).await {
                Ok(Resolution::Payable(payable)) => {
                    let stored = payable.clone();
                    let mut flow = self.flow();
                    if flow.discarded {
                        return Err(FlowError::Discarded);
                    }
                    flow.attempt.payable = Some(stored);
                    payable
                }
                Ok(Resolution::NotFound) | Ok(Resolution::Invalid(_)) => {
                    info!(address = %recipient, "recipient is not registered");
                    return self.advance(AttemptState::RecipientHasNoWallet, |_| {});
                }
                Err(e) => return self.fail(e.into()),
            },
        };

        if !payable.accepts(amount) {
            return self.fail(PaymentError::AmountOutOfBounds {
                amount,
                min: payable.min_sendable,
                max: payable.max_sendable,
            });
        }
        let comment = comment.and_then(|c| truncate_comment(&c, payable.comment_allowed));

        let quoted = live.session().prepare_quote(&payable, amount, comment.as_deref()).await;
        if !self.session.is_current(live.epoch()) {
            return self.fail(PaymentError::SessionNotConnected);
        }
        match quoted {
            Ok(quote) => {
                info!(amount_sat = quote.amount, fee_sat = quote.fee, "quote ready");
                self.advance(AttemptState::AwaitingConfirmation, move |attempt| {
                    attempt.comment = comment;
                    attempt.quote = Some(quote);
                })
            }
            Err(e) => {
                warn!(error = %e, "quote failed");
                self.fail(e.into())
            }
        }
    }

    async fn requote(&self, stale: &Quote) -> Result<Requote, FlowError> {
        info!(quote = %stale.id, fee_sat = stale.fee, "quote expired; re-quoting");
        self.advance(AttemptState::Quoting, |_| {})?;
        let live = match self.session.live_backend().await {
            Ok(live) => live,
            Err(_) => return self.fail_with(PaymentError::SessionNotConnected).map(Requote::Stop),
        };
        match live.session().prepare_quote(&stale.payable, stale.amount, stale.comment.as_deref()).await {
            Ok(fresh) => {
                let previous_fee = stale.fee;
                let unchanged = fresh.fee == previous_fee;
                let stored = fresh.clone();
                self.advance(AttemptState::AwaitingConfirmation, move |attempt| attempt.quote = Some(stored))?;
                if unchanged {
                    Ok(Requote::Unchanged(fresh))
                } else {
                    info!(previous_fee, fee_sat = fresh.fee, "fee changed on re-quote");
                    Ok(Requote::Stop(ConfirmOutcome::Requoted { previous_fee, quote: fresh }))
                }
            }
            Err(e) => self.fail_with(e.into()).map(Requote::Stop),
        }
    }
}

fn ensure(flow: &Flow, action: &'static str, allowed: &[AttemptState]) -> Result<(), FlowError> {
    if flow.discarded {
        return Err(FlowError::Discarded);
    }
    if !allowed.contains(&flow.attempt.state) {
        return Err(invalid(action, flow.attempt.state));
    }
    Ok(())
}

fn invalid(action: &'static str, state: AttemptState) -> FlowError {
    FlowError::InvalidState { action, state: state.as_str() }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
