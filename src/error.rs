//! Error types for every component surface.

use thiserror::Error;

/// SecretStore failures. Carries no secret material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(String),

    #[error("store data: {0}")]
    Data(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures while sealing or unsealing the seed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("wrong password")]
    WrongPassword,

    #[error("corrupt backup: {0}")]
    CorruptBackup(String),

    #[error("seal failed: {0}")]
    Seal(String),
}

/// Errors reported by a PaymentBackend implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend session not connected")]
    NotConnected,

    #[error("backend unreachable: {0}")]
    Network(String),

    #[error("quote expired")]
    QuoteExpired,

    #[error("amount {amount} outside sendable range {min}..={max}")]
    AmountOutOfRange { amount: u64, min: u64, max: u64 },

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("rejected by backend: {0}")]
    Rejected(String),
}

/// `unlock` / `retry_connection` failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnlockError {
    #[error("no wallet has been created")]
    NoWallet,

    #[error("wrong password")]
    WrongPassword,

    #[error("corrupt backup: {0}")]
    CorruptBackup(String),

    #[error("decrypted secret expired; unlock again")]
    SecretExpired,

    #[error("backend connection failed: {0}")]
    Connection(BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SealError> for UnlockError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::WrongPassword => UnlockError::WrongPassword,
            SealError::CorruptBackup(msg) | SealError::Seal(msg) => UnlockError::CorruptBackup(msg),
        }
    }
}

/// `create` failures. Creation fails closed: no partial state survives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    #[error("a wallet already exists; delete it before creating another")]
    WalletExists,

    #[error("mnemonic generation failed: {0}")]
    Mnemonic(String),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `restore` failures. The local store is untouched whenever one is returned
/// before the write step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestoreError {
    #[error("wrong password")]
    WrongPassword,

    #[error("corrupt backup: {0}")]
    CorruptBackup(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SealError> for RestoreError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::WrongPassword => RestoreError::WrongPassword,
            SealError::CorruptBackup(msg) | SealError::Seal(msg) => RestoreError::CorruptBackup(msg),
        }
    }
}

/// Raised when a live backend handle is requested but none can be granted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("wallet session not connected")]
    NotConnected,

    #[error("wallet secret expired; unlock again")]
    SecretExpired,
}

/// Why a payment attempt ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("wallet session not connected")]
    SessionNotConnected,

    #[error("recipient has no registered payment address")]
    RecipientUnregistered,

    #[error("quote expired")]
    QuoteExpired,

    #[error("payment failed: {0}")]
    ExecutionFailed(String),

    #[error("amount {amount} outside sendable range {min}..={max}")]
    AmountOutOfBounds { amount: u64, min: u64, max: u64 },
}

impl From<SessionError> for PaymentError {
    fn from(_: SessionError) -> Self { PaymentError::SessionNotConnected }
}

impl From<BackendError> for PaymentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotConnected => PaymentError::SessionNotConnected,
            BackendError::QuoteExpired => PaymentError::QuoteExpired,
            BackendError::AmountOutOfRange { amount, min, max } => PaymentError::AmountOutOfBounds { amount, min, max },
            other => PaymentError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Requests the orchestrator refuses without changing the attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("cannot {action} while attempt is {state}")]
    InvalidState { action: &'static str, state: &'static str },

    #[error("payment is executing; wait for it to settle or fail")]
    ExecutionInFlight,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("fiat conversion unavailable")]
    PriceUnavailable,

    #[error("payment attempt was discarded")]
    Discarded,
}

/// PriceSource failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("price fetch failed: {0}")]
    Fetch(String),

    #[error("price fetch timed out")]
    Timeout,
}

/// Payment address parse failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty payment address")]
    Empty,

    #[error("malformed payment address: {0}")]
    Malformed(String),
}
