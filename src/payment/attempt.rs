//! PaymentAttempt and its state machine.

use crate::backend::{PayableHandle, Quote, SettlementReceipt};
use crate::error::PaymentError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    SelectingAmount,
    EnteringCustomAmount,
    Quoting,
    AwaitingConfirmation,
    Executing,
    Settled,
    Failed,
    RecipientHasNoWallet,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::SelectingAmount => "selecting_amount",
            AttemptState::EnteringCustomAmount => "entering_custom_amount",
            AttemptState::Quoting => "quoting",
            AttemptState::AwaitingConfirmation => "awaiting_confirmation",
            AttemptState::Executing => "executing",
            AttemptState::Settled => "settled",
            AttemptState::Failed => "failed",
            AttemptState::RecipientHasNoWallet => "recipient_has_no_wallet",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Settled | AttemptState::Failed | AttemptState::RecipientHasNoWallet)
    }

    /// Allowed edges. Discarding is not a transition; it ends the attempt
    /// from any non-executing state.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (SelectingAmount, Quoting)
                | (SelectingAmount, EnteringCustomAmount)
                | (SelectingAmount, RecipientHasNoWallet)
                | (EnteringCustomAmount, Quoting)
                | (Quoting, AwaitingConfirmation)
                | (Quoting, Failed)
                | (Quoting, RecipientHasNoWallet)
                | (AwaitingConfirmation, Quoting)
                | (AwaitingConfirmation, Executing)
                | (AwaitingConfirmation, Failed)
                | (Executing, Settled)
                | (Executing, Failed)
        )
    }
}

/// One user-initiated send. Owned by a single orchestrator; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAttempt {
    pub state: AttemptState,
    pub recipient_address: String,
    /// Set once `Quoting` begins; always >= 1.
    pub amount: Option<u64>,
    pub payable: Option<PayableHandle>,
    pub quote: Option<Quote>,
    pub comment: Option<String>,
    /// Set only in `Failed`.
    pub error: Option<PaymentError>,
    pub receipt: Option<SettlementReceipt>,
}

impl PaymentAttempt {
    pub(crate) fn new(recipient_address: String) -> Self {
        Self {
            state: AttemptState::SelectingAmount,
            recipient_address,
            amount: None,
            payable: None,
            quote: None,
            comment: None,
            error: None,
            receipt: None,
        }
    }

    /// Fee of the current quote.
    pub fn fee(&self) -> Option<u64> { self.quote.as_ref().map(|q| q.fee) }
}
