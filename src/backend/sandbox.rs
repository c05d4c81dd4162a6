//! SandboxBackend - in-process settlement for tests, demos and regtest-style runs.
//!
//! Accounts are keyed by the seed fingerprint, so the same words always reopen
//! the same balance. Recipients must be registered up front; anything else
//! resolves to `NotFound`. Every state change is announced as a
//! `SettlementEvent` with a strictly increasing sequence number.
//!
//! Test hooks: `fail_next_connect`, `set_offline`, `fail_next_execute`,
//! `hold_executions`/`release_executions`, `emit`/`emit_raw`, call counters.

use super::{
    BackendConfig, BackendSession, Direction, PayableHandle, PaymentBackend, PaymentStatus, Quote,
    Resolution, SettlementEvent, SettlementKind, SettlementReceipt, Subscription,
};
use crate::address::PaymentAddress;
use crate::clock::{later, Clock, SystemClock};
use crate::error::BackendError;
use crate::secret::SeedPhrase;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Flat + proportional routing fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub base: u64,
    pub ppm: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self { Self { base: 0, ppm: 5_000 } }
}

impl FeeSchedule {
    pub fn fee_for(&self, amount: u64) -> u64 {
        let proportional = (amount as u128 * self.ppm as u128 / 1_000_000) as u64;
        self.base.saturating_add(proportional)
    }
}

/// Snapshot of how often each backend call was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub balance: usize,
    pub resolve: usize,
    pub prepare_quote: usize,
    pub execute: usize,
}

#[derive(Default)]
struct Counters {
    connect: AtomicUsize,
    balance: AtomicUsize,
    resolve: AtomicUsize,
    prepare_quote: AtomicUsize,
    execute: AtomicUsize,
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<String, u64>,
    quotes: HashMap<String, Quote>,
    current_account: Option<String>,
}

struct Subscriber {
    session: u64,
    tx: mpsc::UnboundedSender<SettlementEvent>,
}

struct SandboxState {
    clock: Arc<dyn Clock>,
    fees: Mutex<FeeSchedule>,
    quote_ttl: Option<Duration>,
    opening_balance: u64,
    ledger: Mutex<Ledger>,
    recipients: Mutex<HashMap<String, PayableHandle>>,
    subscribers: Mutex<Vec<Subscriber>>,
    sequence: AtomicU64,
    next_id: AtomicU64,
    offline: AtomicBool,
    fail_next_connect: AtomicBool,
    fail_next_execute: Mutex<Option<BackendError>>,
    hold: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    counters: Counters,
}

impl SandboxState {
    fn next_id(&self) -> u64 { self.next_id.fetch_add(1, Ordering::SeqCst) + 1 }

    fn publish(&self, kind: SettlementKind) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.deliver(SettlementEvent { sequence, kind });
        sequence
    }

    fn deliver(&self, event: SettlementEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| s.tx.send(event.clone()).is_ok());
    }

    fn drop_subscribers(&self, session: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| s.session != session);
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-process `PaymentBackend`. Clones share all state.
#[derive(Clone)]
pub struct SandboxBackend {
    state: Arc<SandboxState>,
}

impl Default for SandboxBackend {
    fn default() -> Self { Self::new() }
}

impl SandboxBackend {
    pub fn new() -> Self { Self::builder().build() }

    pub fn builder() -> SandboxBuilder { SandboxBuilder::default() }

    /// Make `address` resolvable with default limits (1..=10M sats, 144-char comments).
    pub fn register_recipient(&self, address: &str) -> PayableHandle {
        self.register_payable(PayableHandle {
            address: address.to_ascii_lowercase(),
            reference: format!("sandbox:{}", address.to_ascii_lowercase()),
            min_sendable: 1,
            max_sendable: 10_000_000,
            comment_allowed: 144,
            description: None,
        })
    }

    pub fn register_payable(&self, payable: PayableHandle) -> PayableHandle {
        let mut recipients = self.state.recipients.lock().unwrap_or_else(|p| p.into_inner());
        recipients.insert(payable.address.to_ascii_lowercase(), payable.clone());
        payable
    }

    /// Credit the most recently connected account and announce it as incoming.
    pub fn deposit(&self, amount: u64) -> Result<u64, BackendError> {
        {
            let mut ledger = self.state.ledger();
            let account = ledger.current_account.clone().ok_or(BackendError::NotConnected)?;
            let balance = ledger.balances.entry(account).or_insert(0);
            *balance = balance.saturating_add(amount);
        }
        let payment_id = format!("pay-{:08}", self.state.next_id());
        Ok(self.state.publish(SettlementKind::Payment {
            payment_id,
            direction: Direction::Incoming,
            amount,
            fee: 0,
            status: PaymentStatus::Completed,
        }))
    }

    /// Announce an event with the next sequence number.
    pub fn emit(&self, kind: SettlementKind) -> u64 { self.state.publish(kind) }

    /// Deliver an event verbatim, sequence included. Used to replay duplicates.
    pub fn emit_raw(&self, event: SettlementEvent) { self.state.deliver(event) }

    /// Fees for quotes prepared from now on.
    pub fn set_fees(&self, fees: FeeSchedule) {
        *self.state.fees.lock().unwrap_or_else(|p| p.into_inner()) = fees;
    }

    pub fn set_offline(&self, offline: bool) { self.state.offline.store(offline, Ordering::SeqCst); }

    pub fn fail_next_connect(&self) { self.state.fail_next_connect.store(true, Ordering::SeqCst); }

    pub fn fail_next_execute(&self, error: BackendError) {
        *self.state.fail_next_execute.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    /// Park every `execute` call until `release_executions`.
    pub fn hold_executions(&self) { self.state.hold.send_replace(true); }

    pub fn release_executions(&self) { self.state.hold.send_replace(false); }

    pub fn in_flight_executions(&self) -> usize { self.state.in_flight.load(Ordering::SeqCst) }

    /// Highest number of `execute` calls observed running at once.
    pub fn max_concurrent_executions(&self) -> usize { self.state.max_in_flight.load(Ordering::SeqCst) }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.state.counters;
        CallCounts {
            connect: c.connect.load(Ordering::SeqCst),
            balance: c.balance.load(Ordering::SeqCst),
            resolve: c.resolve.load(Ordering::SeqCst),
            prepare_quote: c.prepare_quote.load(Ordering::SeqCst),
            execute: c.execute.load(Ordering::SeqCst),
        }
    }

    pub fn balance_of(&self, seed: &SeedPhrase) -> Option<u64> {
        self.state.ledger().balances.get(&seed.fingerprint()).copied()
    }

    /// Quotes prepared but neither settled nor expired-and-pruned yet.
    pub fn pending_quotes(&self) -> usize { self.state.ledger().quotes.len() }

    pub fn last_sequence(&self) -> u64 { self.state.sequence.load(Ordering::SeqCst) }
}

#[derive(Default)]
pub struct SandboxBuilder {
    clock: Option<Arc<dyn Clock>>,
    fees: FeeSchedule,
    quote_ttl: Option<Duration>,
    opening_balance: u64,
}

impl SandboxBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self { self.clock = Some(clock); self }
    pub fn fees(mut self, fees: FeeSchedule) -> Self { self.fees = fees; self }
    pub fn quote_ttl(mut self, ttl: Duration) -> Self { self.quote_ttl = Some(ttl); self }
    /// Balance credited to an account the first time it connects.
    pub fn opening_balance(mut self, amount: u64) -> Self { self.opening_balance = amount; self }

    pub fn build(self) -> SandboxBackend {
        let (hold, _) = watch::channel(false);
        SandboxBackend {
            state: Arc::new(SandboxState {
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                fees: Mutex::new(self.fees),
                quote_ttl: self.quote_ttl,
                opening_balance: self.opening_balance,
                ledger: Mutex::new(Ledger::default()),
                recipients: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                offline: AtomicBool::new(false),
                fail_next_connect: AtomicBool::new(false),
                fail_next_execute: Mutex::new(None),
                hold,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }
}

#[async_trait]
impl PaymentBackend for SandboxBackend {
    async fn connect(&self, seed: &SeedPhrase, config: &BackendConfig) -> Result<Arc<dyn BackendSession>, BackendError> {
        self.state.counters.connect.fetch_add(1, Ordering::SeqCst);
        if self.state.offline.load(Ordering::SeqCst) || self.state.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Network("sandbox offline".into()));
        }
        let account = seed.fingerprint();
        {
            let mut ledger = self.state.ledger();
            let opening = self.state.opening_balance;
            ledger.balances.entry(account.clone()).or_insert(opening);
            ledger.current_account = Some(account.clone());
        }
        tracing::debug!(network = config.network.as_str(), "sandbox session opened");
        Ok(Arc::new(SandboxSession {
            state: self.state.clone(),
            id: self.state.next_id(),
            account,
            connected: AtomicBool::new(true),
        }))
    }
}

struct SandboxSession {
    state: Arc<SandboxState>,
    id: u64,
    account: String,
    connected: AtomicBool,
}

impl SandboxSession {
    fn ensure_connected(&self) -> Result<(), BackendError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::NotConnected);
        }
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Network("sandbox offline".into()));
        }
        Ok(())
    }

    async fn wait_for_release(&self) {
        let mut rx = self.state.hold.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn settle(&self, quote: &Quote) -> Result<SettlementReceipt, BackendError> {
        let mut ledger = self.state.ledger();
        if quote.is_expired(self.state.clock.now()) {
            return Err(BackendError::QuoteExpired);
        }
        let stored = ledger.quotes.get(&quote.id).cloned().ok_or_else(|| BackendError::Rejected("unknown quote".into()))?;
        if stored.is_expired(self.state.clock.now()) {
            return Err(BackendError::QuoteExpired);
        }
        let balance = ledger.balances.get(&self.account).copied().unwrap_or(0);
        if stored.total() > balance {
            return Err(BackendError::InsufficientFunds { needed: stored.total(), available: balance });
        }
        ledger.balances.insert(self.account.clone(), balance - stored.total());
        ledger.quotes.remove(&stored.id);
        Ok(SettlementReceipt {
            payment_id: format!("pay-{:08}", self.state.next_id()),
            amount: stored.amount,
            fee: stored.fee,
            settled_at: self.state.clock.now(),
        })
    }
}

#[async_trait]
impl BackendSession for SandboxSession {
    async fn balance(&self) -> Result<u64, BackendError> {
        self.state.counters.balance.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        Ok(self.state.ledger().balances.get(&self.account).copied().unwrap_or(0))
    }

    async fn resolve_address(&self, address: &str) -> Result<Resolution, BackendError> {
        self.state.counters.resolve.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        let parsed = match PaymentAddress::parse(address) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(Resolution::Invalid(e.to_string())),
        };
        let recipients = self.state.recipients.lock().unwrap_or_else(|p| p.into_inner());
        Ok(match recipients.get(parsed.as_str()) {
            Some(payable) => Resolution::Payable(payable.clone()),
            None => Resolution::NotFound,
        })
    }

    async fn prepare_quote(&self, payable: &PayableHandle, amount: u64, comment: Option<&str>) -> Result<Quote, BackendError> {
        self.state.counters.prepare_quote.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        if !payable.accepts(amount) {
            return Err(BackendError::AmountOutOfRange { amount, min: payable.min_sendable, max: payable.max_sendable });
        }
        let quote = Quote {
            id: format!("q-{:08}", self.state.next_id()),
            payable: payable.clone(),
            amount,
            fee: self.state.fees.lock().unwrap_or_else(|p| p.into_inner()).fee_for(amount),
            comment: comment.map(str::to_string),
            expires_at: self.state.quote_ttl.map(|ttl| later(self.state.clock.now(), ttl)),
        };
        let now = self.state.clock.now();
        let mut ledger = self.state.ledger();
        ledger.quotes.retain(|_, pending| !pending.is_expired(now));
        ledger.quotes.insert(quote.id.clone(), quote.clone());
        Ok(quote)
    }

    async fn execute(&self, quote: &Quote) -> Result<SettlementReceipt, BackendError> {
        self.state.counters.execute.fetch_add(1, Ordering::SeqCst);
        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(running, Ordering::SeqCst);

        self.wait_for_release().await;
        let injected = self.state.fail_next_execute.lock().unwrap_or_else(|p| p.into_inner()).take();
        let result = match injected {
            Some(err) => Err(err),
            None => self.ensure_connected().and_then(|_| self.settle(quote)),
        };
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Ok(receipt) = &result {
            self.state.publish(SettlementKind::Payment {
                payment_id: receipt.payment_id.clone(),
                direction: Direction::Outgoing,
                amount: receipt.amount,
                fee: receipt.fee,
                status: PaymentStatus::Completed,
            });
        }
        result
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.connected.load(Ordering::SeqCst) {
            let mut subs = self.state.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subs.push(Subscriber { session: self.id, tx });
        }
        Subscription::new(rx)
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.connected.store(false, Ordering::SeqCst);
        self.state.drop_subscribers(self.id);
        Ok(())
    }
}
