//! EventSynchronizationBus - keeps the cached balance in step with settlement events.
//!
//! ```text
//! session.watch() ──▶ Connected(epoch)? ──▶ backend.subscribe()
//!                                              │
//!                     SettlementEvent ◀────────┘
//!                          │
//!                          ├── epoch no longer current  → Stale
//!                          ├── sequence <= last seen    → Duplicate
//!                          └── refresh_balance() + Notification
//! ```
//!
//! The subscription is dropped whenever the session leaves `Connected` or its
//! epoch changes, and taken out again on the next connect. The only state kept
//! across events is the last processed sequence marker.

use crate::backend::{Direction, PaymentStatus, SettlementEvent, SettlementKind, Subscription};
use crate::runtime::Shutdown;
use crate::session::{LiveBackend, WalletSessionManager};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

/// User-facing payment notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub direction: Direction,
    pub status: PaymentStatus,
    pub payment_id: String,
    pub amount: u64,
    pub fee: u64,
    pub sequence: u64,
}

impl Notification {
    pub fn is_incoming(&self) -> bool { self.direction == Direction::Incoming }
}

/// What happened to one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The connection it arrived on is gone.
    Stale,
    /// Sequence marker not newer than the last processed one.
    Duplicate,
    Processed { refreshed: bool, notified: bool },
}

pub struct EventSynchronizationBus {
    session: Arc<WalletSessionManager>,
    last_sequence: Mutex<Option<u64>>,
    notifications: broadcast::Sender<Notification>,
}

/// Why a subscription ended.
enum Ended {
    Shutdown,
    SessionChanged,
    StreamClosed,
}

impl EventSynchronizationBus {
    pub fn new(session: Arc<WalletSessionManager>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { session, last_sequence: Mutex::new(None), notifications }
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> { self.notifications.subscribe() }

    pub fn last_sequence(&self) -> Option<u64> {
        *self.last_sequence.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run in the background until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move { bus.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: Shutdown) {
        let mut state_rx = self.session.watch();
        loop {
            let connected = state_rx.borrow_and_update().is_connected();
            let ended = if connected {
                match self.session.observe_backend().await {
                    Ok(live) => {
                        let subscription = live.session().subscribe();
                        info!(epoch = live.epoch(), "subscribed to settlement events");
                        self.pump(live, subscription, &mut state_rx, &shutdown).await
                    }
                    Err(e) => {
                        debug!(error = %e, "no live backend to subscribe to");
                        Ended::StreamClosed
                    }
                }
            } else {
                Ended::StreamClosed
            };

            match ended {
                Ended::Shutdown => return,
                Ended::SessionChanged => continue,
                Ended::StreamClosed => {}
            }

            tokio::select! {
                _ = shutdown.wait() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(
        &self,
        live: LiveBackend,
        mut subscription: Subscription,
        state_rx: &mut watch::Receiver<crate::session::WalletSession>,
        shutdown: &Shutdown,
    ) -> Ended {
        let epoch = live.epoch();
        let ended = loop {
            tokio::select! {
                _ = shutdown.wait() => break Ended::Shutdown,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break Ended::Shutdown;
                    }
                    let current = {
                        let state = state_rx.borrow();
                        state.is_connected() && state.connection_epoch == epoch
                    };
                    if !current {
                        break Ended::SessionChanged;
                    }
                }
                event = subscription.next() => match event {
                    Some(event) => {
                        self.handle_event(epoch, event).await;
                    }
                    None => {
                        debug!(epoch, "settlement stream closed");
                        break Ended::StreamClosed;
                    }
                },
            }
        };
        subscription.unsubscribe();
        debug!(epoch, "unsubscribed from settlement events");
        ended
    }

    /// Apply one event that arrived on the connection identified by `epoch`.
    pub async fn handle_event(&self, epoch: u64, event: SettlementEvent) -> EventOutcome {
        if !self.session.is_current(epoch) {
            debug!(epoch, sequence = event.sequence, "dropping event from ended session");
            return EventOutcome::Stale;
        }
        {
            let mut last = self.last_sequence.lock().unwrap_or_else(|p| p.into_inner());
            if last.is_some_and(|seen| event.sequence <= seen) {
                debug!(sequence = event.sequence, "duplicate settlement event");
                return EventOutcome::Duplicate;
            }
            *last = Some(event.sequence);
        }

        // A failed refresh is picked up by the next event or manual refresh.
        let refreshed = match self.session.refresh_balance().await {
            Ok(balance) => balance.is_some(),
            Err(e) => {
                warn!(error = %e, sequence = event.sequence, "balance refresh failed");
                false
            }
        };

        let notified = match event.kind {
            SettlementKind::Payment { payment_id, direction, amount, fee, status } => {
                info!(sequence = event.sequence, amount_sat = amount, ?direction, ?status, "payment settled");
                let _ = self.notifications.send(Notification {
                    direction,
                    status,
                    payment_id,
                    amount,
                    fee,
                    sequence: event.sequence,
                });
                true
            }
            SettlementKind::Synced => false,
        };
        EventOutcome::Processed { refreshed, notified }
    }
}
