//! Beezap: self-custodied zap wallet core. Session, payment flow, settlement sync.
//!
//! # Architecture
//!
//! ```text
//! WalletSessionManager (one per process)
//!   │
//!   ├── SecretStore     sealed seed + non-secret snapshot
//!   ├── PaymentBackend  connect(seed) → BackendSession
//!   └── InMemorySecret  decrypted seed with an expiry
//!
//! EventSynchronizationBus
//!   └── subscribes while Connected → refresh_balance() + Notification
//!
//! PaymentFlowOrchestrator (one per send)
//!   └── resolve → quote → confirm → execute, one execution slot per session
//!
//! PriceConverter
//!   └── PriceSource → cached quote → fiat display values
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use beezap::{WalletConfig, WalletSessionManager, SandboxBackend, MemorySecretStore, SystemClock};
//! use std::sync::Arc;
//!
//! let session = Arc::new(WalletSessionManager::new(
//!     WalletConfig::from_env(),
//!     Arc::new(MemorySecretStore::new()),
//!     Arc::new(SandboxBackend::new()),
//!     Arc::new(SystemClock),
//! ));
//! session.initialize_from_storage().await?;
//! let words = session.create("correct horse").await?;
//! let balance = session.unlock("correct horse").await?;
//! ```
//!
//! # Features
//!
//! - `native` - filesystem store, log subscriber, `beezap` CLI

// =============================================================================
// Shared modules
// =============================================================================
pub mod address;
pub mod auth;
pub mod backend;
pub mod clock;
pub mod error;
pub mod events;
pub mod payment;
pub mod price;
pub mod runtime;
pub mod secret;
pub mod session;
pub mod store;

pub use session::config;

// =============================================================================
// Native-only modules
// =============================================================================
#[cfg(feature = "native")]
pub mod logging;

// =============================================================================
// Re-exports
// =============================================================================
pub use address::PaymentAddress;
pub use backend::sandbox::{FeeSchedule, SandboxBackend};
pub use backend::{
    BackendConfig, BackendSession, Direction, PayableHandle, PaymentBackend, PaymentStatus, Quote, Resolution,
    SettlementEvent, SettlementKind, SettlementReceipt, Subscription,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KdfParams, Network, Renewal, SecretPolicy, WalletConfig};
pub use error::{
    AddressError, BackendError, CreateError, FlowError, PaymentError, PriceError, RestoreError, SealError,
    SessionError, StoreError, UnlockError,
};
pub use events::{EventOutcome, EventSynchronizationBus, Notification};
pub use payment::{AmountInput, AttemptState, ConfirmOutcome, PaymentAttempt, PaymentFlowOrchestrator};
pub use price::{DisplayValue, FixedPriceSource, PriceConverter, PriceQuote, PriceSource, SATS_PER_COIN};
pub use runtime::{install_signal_handlers, Shutdown};
pub use secret::SeedPhrase;
pub use session::{ExecutionSlot, LifecycleState, LiveBackend, WalletSession, WalletSessionManager};
pub use store::{BoundAddress, MemorySecretStore, SecretStore, SessionSnapshot};

#[cfg(feature = "native")]
pub use store::FileSecretStore;
