//! Event Bus Tests: settlement events against a running bus
//!
//! These tests verify:
//! 1. Deposits refresh the cached balance and raise a notification
//! 2. Replayed sequence numbers are processed once
//! 3. The bus drops its subscription on lock and resubscribes on unlock
//! 4. Sync events refresh without notifying
//! 5. Shutdown stops the bus

use beezap::{
    EventOutcome, EventSynchronizationBus, KdfParams, ManualClock, MemorySecretStore, Notification, SandboxBackend,
    SettlementEvent, SettlementKind, Shutdown, WalletConfig, WalletSessionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const PASSWORD: &str = "correct horse battery staple";

struct Harness {
    backend: SandboxBackend,
    session: Arc<WalletSessionManager>,
    bus: Arc<EventSynchronizationBus>,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

async fn running_bus() -> Harness {
    let backend = SandboxBackend::new();
    let session = Arc::new(WalletSessionManager::new(
        WalletConfig::new("bus-tests").with_kdf(KdfParams::light()),
        Arc::new(MemorySecretStore::new()),
        Arc::new(backend.clone()),
        Arc::new(ManualClock::new()),
    ));
    session.create(PASSWORD).await.expect("create wallet");

    let bus = Arc::new(EventSynchronizationBus::new(session.clone()));
    let shutdown = Shutdown::new();
    let task = bus.spawn(shutdown.clone());
    wait_until("subscription", || backend.subscriber_count() == 1).await;
    Harness { backend, session, bus, shutdown, task }
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

async fn next_notification(rx: &mut broadcast::Receiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification in time")
        .expect("notification channel open")
}

/// Test: an incoming deposit updates the balance and notifies
#[tokio::test]
async fn deposit_refreshes_balance() {
    let h = running_bus().await;
    let mut notes = h.bus.notifications();
    assert_eq!(h.session.session().balance(), Some(0));

    let sequence = h.backend.deposit(2_100).unwrap();
    let note = next_notification(&mut notes).await;
    assert!(note.is_incoming());
    assert_eq!((note.amount, note.sequence), (2_100, sequence));

    wait_until("balance refresh", || h.session.session().balance() == Some(2_100)).await;
    assert_eq!(h.bus.last_sequence(), Some(sequence));
}

/// Test: a replayed event neither notifies nor refreshes twice
#[tokio::test]
async fn replayed_event_is_processed_once() {
    let h = running_bus().await;
    let mut notes = h.bus.notifications();

    let sequence = h.backend.deposit(500).unwrap();
    next_notification(&mut notes).await;
    wait_until("balance refresh", || h.session.session().balance() == Some(500)).await;
    let balance_reads = h.backend.calls().balance;

    h.backend.emit_raw(SettlementEvent {
        sequence,
        kind: SettlementKind::Synced,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(notes.try_recv().is_err());
    assert_eq!(h.backend.calls().balance, balance_reads);
    assert_eq!(h.bus.last_sequence(), Some(sequence));
}

/// Test: lock drops the subscription, unlock brings it back
#[tokio::test]
async fn resubscribes_after_unlock() {
    let h = running_bus().await;
    let mut notes = h.bus.notifications();

    h.session.lock().await;
    wait_until("unsubscribe", || h.backend.subscriber_count() == 0).await;

    h.session.unlock(PASSWORD).await.unwrap();
    wait_until("resubscribe", || h.backend.subscriber_count() == 1).await;

    let sequence = h.backend.deposit(42).unwrap();
    assert_eq!(next_notification(&mut notes).await.sequence, sequence);
    wait_until("balance refresh", || h.session.session().balance() == Some(42)).await;
}

/// Test: events from a connection that has ended are stale
#[tokio::test]
async fn old_epoch_is_stale() {
    let h = running_bus().await;
    let epoch = h.session.session().connection_epoch;
    h.session.lock().await;
    h.session.unlock(PASSWORD).await.unwrap();

    let outcome = h.bus.handle_event(epoch, SettlementEvent { sequence: 99, kind: SettlementKind::Synced }).await;
    assert_eq!(outcome, EventOutcome::Stale);
    assert_ne!(h.bus.last_sequence(), Some(99));
}

/// Test: sync events refresh the balance but raise no notification
#[tokio::test]
async fn sync_event_refreshes_quietly() {
    let h = running_bus().await;
    let epoch = h.session.session().connection_epoch;
    let mut notes = h.bus.notifications();

    let outcome = h.bus.handle_event(epoch, SettlementEvent { sequence: 1, kind: SettlementKind::Synced }).await;
    assert_eq!(outcome, EventOutcome::Processed { refreshed: true, notified: false });
    assert!(notes.try_recv().is_err());
}

/// Test: shutdown ends the bus task and its subscription
#[tokio::test]
async fn shutdown_stops_bus() {
    let h = running_bus().await;
    h.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), h.task).await.expect("bus stopped").unwrap();

    // Closed receivers are pruned on the next delivery.
    h.backend.deposit(1).unwrap();
    assert_eq!(h.backend.subscriber_count(), 0);
    assert_eq!(h.bus.last_sequence(), None);
}
