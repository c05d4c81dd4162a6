//! PaymentBackend - the external settlement SDK, seen through a narrow seam.
//!
//! ```text
//! PaymentBackend::connect(seed, config) ──▶ BackendSession
//!                                              │
//!                                              ├── balance()
//!                                              ├── resolve_address(addr) → Payable | NotFound | Invalid
//!                                              ├── prepare_quote(payable, amount, comment) → Quote
//!                                              ├── execute(quote) → SettlementReceipt
//!                                              ├── subscribe() → Subscription (SettlementEvent stream)
//!                                              └── disconnect()
//! ```
//!
//! Signing, key derivation and transport live behind these traits. The crate
//! ships one implementation, [`sandbox::SandboxBackend`], which settles
//! in-process and is what tests and the CLI run against.

pub mod sandbox;

use crate::error::BackendError;
use crate::secret::SeedPhrase;
use crate::session::config::Network;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection parameters handed to the backend alongside the seed.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub network: Network,
    pub api_key: Option<String>,
}

/// Opaque handle to a resolved, payable recipient plus the constraints the
/// recipient advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayableHandle {
    pub address: String,
    /// Backend-specific reference (callback URL, offer id, ...).
    pub reference: String,
    pub min_sendable: u64,
    pub max_sendable: u64,
    /// Maximum comment length in characters. 0 means comments are not accepted.
    pub comment_allowed: usize,
    #[serde(default)]
    pub description: Option<String>,
}

impl PayableHandle {
    pub fn accepts(&self, amount: u64) -> bool {
        amount >= self.min_sendable && amount <= self.max_sendable
    }
}

/// Outcome of address resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Payable(PayableHandle),
    NotFound,
    Invalid(String),
}

/// Fee commitment for one specific payment. May be time-limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub payable: PayableHandle,
    pub amount: u64,
    pub fee: u64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn total(&self) -> u64 { self.amount.saturating_add(self.fee) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub payment_id: String,
    pub amount: u64,
    pub fee: u64,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementKind {
    /// Backend finished a background sync; balance may have moved.
    Synced,
    Payment {
        payment_id: String,
        direction: Direction,
        amount: u64,
        fee: u64,
        status: PaymentStatus,
    },
}

/// Asynchronous backend notification. `sequence` never decreases for a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub sequence: u64,
    pub kind: SettlementKind,
}

/// Live event stream. Dropping it, or calling `unsubscribe`, ends delivery.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SettlementEvent>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SettlementEvent>) -> Self { Self { rx } }

    /// Next event, or `None` once the backend side is gone.
    pub async fn next(&mut self) -> Option<SettlementEvent> { self.rx.recv().await }

    pub fn unsubscribe(mut self) { self.rx.close(); }
}

#[async_trait]
pub trait PaymentBackend: Send + Sync {
    async fn connect(&self, seed: &SeedPhrase, config: &BackendConfig) -> Result<Arc<dyn BackendSession>, BackendError>;
}

#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn balance(&self) -> Result<u64, BackendError>;
    async fn resolve_address(&self, address: &str) -> Result<Resolution, BackendError>;
    async fn prepare_quote(&self, payable: &PayableHandle, amount: u64, comment: Option<&str>) -> Result<Quote, BackendError>;
    async fn execute(&self, quote: &Quote) -> Result<SettlementReceipt, BackendError>;
    fn subscribe(&self) -> Subscription;
    async fn disconnect(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payable() -> PayableHandle {
        PayableHandle {
            address: "alice@example.com".into(),
            reference: "cb".into(),
            min_sendable: 1,
            max_sendable: 1_000,
            comment_allowed: 10,
            description: None,
        }
    }

    #[test]
    fn quote_expiry_is_inclusive_of_deadline() {
        let now = Utc::now();
        let mut quote = Quote { id: "q".into(), payable: payable(), amount: 10, fee: 1, comment: None, expires_at: None };
        assert!(!quote.is_expired(now));
        quote.expires_at = Some(now);
        assert!(quote.is_expired(now));
        assert!(!quote.is_expired(now - chrono::Duration::seconds(1)));
        assert_eq!(quote.total(), 11);
    }

    #[test]
    fn payable_bounds() {
        let p = payable();
        assert!(!p.accepts(0));
        assert!(p.accepts(1) && p.accepts(1_000));
        assert!(!p.accepts(1_001));
    }

    #[test]
    fn settlement_event_json_shape() {
        let event = SettlementEvent {
            sequence: 7,
            kind: SettlementKind::Payment {
                payment_id: "p1".into(),
                direction: Direction::Incoming,
                amount: 21,
                fee: 0,
                status: PaymentStatus::Completed,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"]["type"], "payment");
        assert_eq!(value["kind"]["direction"], "incoming");
    }
}
