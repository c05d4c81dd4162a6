//! WalletSessionManager - sole owner of the decrypted seed and the backend session.
//!
//! ```text
//!                 create / restore
//!  Uninitialized ─────────────────▶ LockedWithBackup ◀──────────── lock / expiry
//!                                        │ unlock                      ▲
//!                                        ▼                             │
//!                                   Connecting ──▶ Connected ──────────┘
//!                                        │
//!                                        ▼
//!                                 ConnectionFailed ── retry_connection ──▶ Connecting
//! ```
//!
//! Lifecycle operations (unlock, retry, lock, create, restore, delete) are
//! serialized by an async mutex. Observable state lives behind a std mutex that
//! is never held across an await and is published through a `watch` channel.
//!
//! Secret expiry is lazy: the deadline is checked whenever a live backend handle
//! is requested. A `Connected` session whose secret has lapsed keeps showing
//! `Connected` until that next request, which then locks it.

pub mod config;
mod state;

pub use state::{LifecycleState, WalletSession};

use crate::auth;
use crate::backend::{BackendConfig, BackendSession, PaymentBackend};
use crate::clock::Clock;
use crate::error::{BackendError, CreateError, RestoreError, SealError, SessionError, StoreError, UnlockError};
use crate::secret::{InMemorySecret, SeedPhrase};
use crate::store::{BoundAddress, SecretStore, SessionSnapshot};
use config::WalletConfig;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// A backend session granted after the secret deadline was re-checked.
///
/// `epoch` identifies the connection it came from; pass it to
/// [`WalletSessionManager::is_live`] before acting on a result.
#[derive(Clone)]
pub struct LiveBackend {
    session: Arc<dyn BackendSession>,
    epoch: u64,
}

impl LiveBackend {
    pub fn session(&self) -> &dyn BackendSession { self.session.as_ref() }
    pub fn epoch(&self) -> u64 { self.epoch }
}

impl fmt::Debug for LiveBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveBackend").field("epoch", &self.epoch).finish_non_exhaustive()
    }
}

/// The session's single execution permit. Released on drop.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    session: WalletSession,
    snapshot: SessionSnapshot,
    secret: Option<InMemorySecret>,
    handle: Option<Arc<dyn BackendSession>>,
    initialized: bool,
    /// Balance reads started, and the newest one applied.
    balance_reads: u64,
    balance_applied: u64,
}

pub struct WalletSessionManager {
    config: WalletConfig,
    store: Arc<dyn SecretStore>,
    backend: Arc<dyn PaymentBackend>,
    clock: Arc<dyn Clock>,
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<WalletSession>,
    execution: Arc<Semaphore>,
}

impl WalletSessionManager {
    pub fn new(
        config: WalletConfig,
        store: Arc<dyn SecretStore>,
        backend: Arc<dyn PaymentBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = WalletSession::default();
        let (state_tx, _) = watch::channel(session.clone());
        Self {
            config,
            store,
            backend,
            clock,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                session,
                snapshot: SessionSnapshot::default(),
                secret: None,
                handle: None,
                initialized: false,
                balance_reads: 0,
                balance_applied: 0,
            }),
            state_tx,
            execution: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn config(&self) -> &WalletConfig { &self.config }

    pub fn clock(&self) -> Arc<dyn Clock> { self.clock.clone() }

    /// Current state.
    pub fn session(&self) -> WalletSession { self.inner().session.clone() }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<WalletSession> { self.state_tx.subscribe() }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.session.clone());
    }

    // ---------------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------------

    /// Build the session from the persisted snapshot. Never reads the sealed seed.
    pub async fn initialize_from_storage(&self) -> Result<WalletSession, StoreError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        Ok(self.session())
    }

    async fn load_snapshot(&self) -> Result<(), StoreError> {
        if self.inner().initialized {
            return Ok(());
        }
        let snapshot = self.store.snapshot().await?;
        let mut inner = self.inner();
        let epoch = inner.session.connection_epoch;
        inner.session = WalletSession::from_snapshot(&snapshot, epoch);
        inner.snapshot = snapshot;
        inner.initialized = true;
        self.publish(&inner);
        debug!(state = inner.session.lifecycle.as_str(), "session initialized from storage");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Unlock / connect
    // ---------------------------------------------------------------------

    /// Decrypt the stored seed, connect, and return the fresh balance.
    ///
    /// Already connected: the password is still verified, the secret deadline
    /// restarts and the cached balance is returned.
    pub async fn unlock(&self, password: &str) -> Result<u64, UnlockError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        let sealed = self.store.encrypted_seed().await?.ok_or(UnlockError::NoWallet)?;
        let seed = match unseal_blocking(sealed, password).await {
            Ok(seed) => seed,
            Err(e) => {
                warn!(error = %e, "unlock rejected");
                return Err(e.into());
            }
        };

        {
            let mut inner = self.inner();
            let now = self.clock.now();
            let connected = inner.session.is_connected() && inner.handle.is_some();
            inner.secret = Some(InMemorySecret::new(seed, now, &self.config.secret_policy));
            if connected {
                debug!(epoch = inner.session.connection_epoch, "unlock while connected; secret renewed");
                return Ok(inner.session.cached_balance.unwrap_or(0));
            }
        }
        self.connect_locked().await
    }

    /// Reconnect after `ConnectionFailed` using the retained secret.
    pub async fn retry_connection(&self) -> Result<u64, UnlockError> {
        let _guard = self.lifecycle.lock().await;
        {
            let mut inner = self.inner();
            match inner.session.lifecycle {
                LifecycleState::Connected => return Ok(inner.session.cached_balance.unwrap_or(0)),
                LifecycleState::ConnectionFailed => {}
                LifecycleState::Uninitialized => return Err(UnlockError::NoWallet),
                _ => return Err(UnlockError::SecretExpired),
            }
            let now = self.clock.now();
            if !inner.secret.as_ref().is_some_and(|s| s.is_live(now)) {
                info!("retained secret expired before retry");
                inner.secret = None;
                inner.session.lifecycle = LifecycleState::at_rest(inner.snapshot.has_backup);
                inner.session.connection_epoch += 1;
                self.publish(&inner);
                return Err(UnlockError::SecretExpired);
            }
        }
        self.connect_locked().await
    }

    /// Open a backend session with the held secret. Caller holds the lifecycle lock.
    async fn connect_locked(&self) -> Result<u64, UnlockError> {
        let seed = {
            let mut inner = self.inner();
            let seed = inner
                .secret
                .as_ref()
                .and_then(|s| s.material(self.clock.now()))
                .ok_or(UnlockError::SecretExpired)?;
            inner.session.lifecycle = LifecycleState::Connecting;
            inner.session.cached_balance = None;
            self.publish(&inner);
            seed
        };

        let backend_config = BackendConfig { network: self.config.network, api_key: self.config.api_key.clone() };
        let result = match self.backend.connect(&seed, &backend_config).await {
            Ok(handle) => match handle.balance().await {
                Ok(balance) => Ok((handle, balance)),
                Err(e) => {
                    let _ = handle.disconnect().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        drop(seed);

        let mut inner = self.inner();
        match result {
            Ok((handle, balance)) => {
                inner.handle = Some(handle);
                inner.session.connection_epoch += 1;
                inner.session.lifecycle = LifecycleState::Connected;
                inner.session.cached_balance = Some(balance);
                self.publish(&inner);
                info!(epoch = inner.session.connection_epoch, amount_sat = balance, "wallet connected");
                Ok(balance)
            }
            Err(e) => {
                inner.session.lifecycle = LifecycleState::ConnectionFailed;
                self.publish(&inner);
                warn!(error = %e, "backend connection failed; secret retained for retry");
                Err(UnlockError::Connection(e))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lock / teardown
    // ---------------------------------------------------------------------

    /// Drop the secret and the backend session. Safe in any state.
    pub async fn lock(&self) {
        let _guard = self.lifecycle.lock().await;
        let handle = {
            let mut inner = self.inner();
            self.teardown(&mut inner)
        };
        disconnect(handle).await;
        info!("wallet locked");
    }

    /// Discard secret and handle, mark balance unknown, bump the epoch.
    fn teardown(&self, inner: &mut Inner) -> Option<Arc<dyn BackendSession>> {
        inner.secret = None;
        let handle = inner.handle.take();
        inner.session.lifecycle = LifecycleState::at_rest(inner.snapshot.has_backup);
        inner.session.cached_balance = None;
        inner.session.connection_epoch += 1;
        self.publish(inner);
        handle
    }

    // ---------------------------------------------------------------------
    // Create / restore / delete
    // ---------------------------------------------------------------------

    /// Generate, seal, persist and connect a new wallet. Returns the recovery words.
    ///
    /// Nothing is kept in memory if persisting fails. A connection failure after
    /// persisting leaves the session in `ConnectionFailed` and still returns the
    /// words, since the wallet now exists.
    pub async fn create(&self, password: &str) -> Result<SeedPhrase, CreateError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        let has_backup = self.inner().snapshot.has_backup;
        if has_backup || self.store.encrypted_seed().await?.is_some() {
            return Err(CreateError::WalletExists);
        }

        let password = Zeroizing::new(password.to_string());
        let kdf = self.config.kdf;
        let (seed, sealed) = tokio::task::spawn_blocking(move || -> Result<_, CreateError> {
            let seed = auth::generate_mnemonic().map_err(|e| CreateError::Mnemonic(e.to_string()))?;
            let sealed = auth::seal_seed(&seed, &password, &kdf)?;
            Ok((seed, sealed))
        })
        .await
        .map_err(|e| CreateError::Seal(SealError::Seal(format!("seal task: {e}"))))??;

        let snapshot = SessionSnapshot { has_backup: true, ..Default::default() };
        self.store.save_encrypted_seed(&sealed).await?;
        if let Err(e) = self.store.save_snapshot(&snapshot).await {
            if let Err(cleanup) = self.store.clear_all().await {
                warn!(error = %cleanup, "could not roll back partially created wallet");
            }
            return Err(e.into());
        }

        {
            let mut inner = self.inner();
            let epoch = inner.session.connection_epoch;
            inner.session = WalletSession::from_snapshot(&snapshot, epoch);
            inner.snapshot = snapshot;
            let retained = SeedPhrase::new(seed.expose().to_string());
            inner.secret = Some(InMemorySecret::new(retained, self.clock.now(), &self.config.secret_policy));
            self.publish(&inner);
        }
        info!(words = seed.word_count(), "wallet created");

        if let Err(e) = self.connect_locked().await {
            warn!(error = %e, "wallet created but not connected");
        }
        Ok(seed)
    }

    /// Replace the local wallet with a sealed backup, verified first.
    ///
    /// The store is written only after the backup decrypts to a valid mnemonic.
    /// Ends in `LockedWithBackup`; `backup_confirmed` is reset.
    pub async fn restore(&self, encrypted_backup: &[u8], password: &str) -> Result<(), RestoreError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        let verified = unseal_blocking(encrypted_backup.to_vec(), password).await?;
        drop(verified);

        let previous_seed = self.store.encrypted_seed().await?;
        let previous_snapshot = self.inner().snapshot.clone();
        let snapshot = SessionSnapshot { has_backup: true, ..Default::default() };
        self.store.save_encrypted_seed(encrypted_backup).await?;
        if let Err(e) = self.store.save_snapshot(&snapshot).await {
            self.roll_back_restore(previous_seed, &previous_snapshot).await;
            return Err(e.into());
        }

        let handle = {
            let mut inner = self.inner();
            inner.snapshot = snapshot;
            inner.session.backup_confirmed = false;
            inner.session.last_backup_at = None;
            inner.session.bound_address = None;
            self.teardown(&mut inner)
        };
        disconnect(handle).await;
        info!("wallet restored from backup");
        Ok(())
    }

    /// Put back the seed and snapshot that a failed restore overwrote.
    async fn roll_back_restore(&self, seed: Option<Vec<u8>>, snapshot: &SessionSnapshot) {
        let restored = match seed {
            Some(sealed) => self.store.save_encrypted_seed(&sealed).await,
            None => self.store.clear_all().await,
        };
        if let Err(e) = restored {
            warn!(error = %e, "could not restore previous sealed seed after failed restore");
        }
        if let Err(e) = self.store.save_snapshot(snapshot).await {
            debug!(error = %e, "previous snapshot not rewritten");
        }
    }

    /// Lock and purge everything persisted.
    pub async fn delete_wallet(&self) -> Result<(), StoreError> {
        let _guard = self.lifecycle.lock().await;
        let handle = {
            let mut inner = self.inner();
            self.teardown(&mut inner)
        };
        disconnect(handle).await;
        self.store.clear_all().await?;

        let mut inner = self.inner();
        let epoch = inner.session.connection_epoch;
        inner.snapshot = SessionSnapshot::default();
        inner.session = WalletSession::from_snapshot(&inner.snapshot, epoch);
        inner.initialized = true;
        self.publish(&inner);
        info!("wallet deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Backup + address metadata
    // ---------------------------------------------------------------------

    /// Sealed seed for off-device backup, recording when it was taken.
    /// `None` if no wallet exists.
    pub async fn export_backup(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        let Some(sealed) = self.store.encrypted_seed().await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        self.update_snapshot(|snapshot| snapshot.last_backup_at = Some(now)).await?;
        Ok(Some(sealed))
    }

    /// Record the user's explicit acknowledgment that the backup is safe.
    pub async fn confirm_backup(&self) -> Result<(), StoreError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        self.update_snapshot(|snapshot| snapshot.backup_confirmed = true).await
    }

    pub async fn bind_address(&self, address: BoundAddress) -> Result<(), StoreError> {
        let _guard = self.lifecycle.lock().await;
        self.load_snapshot().await?;
        self.update_snapshot(move |snapshot| snapshot.bound_address = Some(address)).await
    }

    /// Persist a modified snapshot, then mirror it into the session.
    async fn update_snapshot(&self, edit: impl FnOnce(&mut SessionSnapshot)) -> Result<(), StoreError> {
        let mut snapshot = self.inner().snapshot.clone();
        edit(&mut snapshot);
        self.store.save_snapshot(&snapshot).await?;

        let mut inner = self.inner();
        inner.session.backup_confirmed = snapshot.backup_confirmed;
        inner.session.last_backup_at = snapshot.last_backup_at;
        inner.session.bound_address = snapshot.bound_address.clone();
        inner.snapshot = snapshot;
        self.publish(&inner);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Live backend access
    // ---------------------------------------------------------------------

    /// Run `op` against the backend, after re-checking the secret deadline.
    ///
    /// Counts as activity for `RenewOnActivity`. An expired secret is discarded
    /// and the session locked before `SecretExpired` is returned.
    pub async fn with_live_backend<T, F, Fut>(&self, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(LiveBackend) -> Fut,
        Fut: Future<Output = T>,
    {
        let live = self.live_backend().await?;
        Ok(op(live).await)
    }

    /// Grant a live handle without running anything yet. Same checks as
    /// [`with_live_backend`](Self::with_live_backend).
    pub async fn live_backend(&self) -> Result<LiveBackend, SessionError> {
        self.acquire_live(true).await
    }

    async fn acquire_live(&self, renew: bool) -> Result<LiveBackend, SessionError> {
        let expired = {
            let mut inner = self.inner();
            if !inner.session.is_connected() {
                return Err(SessionError::NotConnected);
            }
            let now = self.clock.now();
            if inner.secret.as_ref().is_some_and(|s| s.is_live(now)) {
                if renew {
                    if let Some(secret) = inner.secret.as_mut() {
                        secret.touch(now, &self.config.secret_policy);
                    }
                }
                let epoch = inner.session.connection_epoch;
                return match inner.handle.clone() {
                    Some(session) => Ok(LiveBackend { session, epoch }),
                    None => Err(SessionError::NotConnected),
                };
            }
            info!(epoch = inner.session.connection_epoch, "secret expired; locking session");
            self.teardown(&mut inner)
        };
        disconnect(expired).await;
        Err(SessionError::SecretExpired)
    }

    /// Like [`live_backend`](Self::live_backend) but not counted as activity.
    /// Used by background observers that must not keep the secret alive.
    pub async fn observe_backend(&self) -> Result<LiveBackend, SessionError> {
        self.acquire_live(false).await
    }

    /// Whether the connection identified by `epoch` is still the current one.
    /// Does not look at the secret deadline.
    pub fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner();
        inner.session.is_connected() && inner.session.connection_epoch == epoch
    }

    /// Whether results obtained under `epoch` may still be applied.
    pub fn is_live(&self, epoch: u64) -> bool {
        let inner = self.inner();
        inner.session.is_connected()
            && inner.session.connection_epoch == epoch
            && inner.secret.as_ref().is_some_and(|s| s.is_live(self.clock.now()))
    }

    /// Re-read the balance. A no-op returning `Ok(None)` when not connected.
    ///
    /// Safe to call concurrently. A read is applied only if the connection it
    /// came from is still current and no later-started read was applied first;
    /// a superseded read returns the balance that replaced it. Does not count
    /// as activity for secret renewal.
    pub async fn refresh_balance(&self) -> Result<Option<u64>, BackendError> {
        let live = match self.acquire_live(false).await {
            Ok(live) => live,
            Err(_) => return Ok(None),
        };
        let ticket = {
            let mut inner = self.inner();
            inner.balance_reads += 1;
            inner.balance_reads
        };
        let balance = live.session().balance().await?;

        let mut inner = self.inner();
        if inner.session.is_connected() && inner.session.connection_epoch == live.epoch() {
            if ticket < inner.balance_applied {
                debug!(ticket, applied = inner.balance_applied, "discarding superseded balance read");
                return Ok(inner.session.cached_balance);
            }
            inner.balance_applied = ticket;
            inner.session.cached_balance = Some(balance);
            self.publish(&inner);
            debug!(epoch = live.epoch(), amount_sat = balance, "balance refreshed");
            Ok(Some(balance))
        } else {
            debug!(epoch = live.epoch(), "discarding balance from torn-down session");
            Ok(None)
        }
    }

    // ---------------------------------------------------------------------
    // Execution slot
    // ---------------------------------------------------------------------

    /// Wait for the single execution slot.
    pub async fn acquire_execution_slot(&self) -> Result<ExecutionSlot, AcquireError> {
        let permit = self.execution.clone().acquire_owned().await?;
        Ok(ExecutionSlot { _permit: permit })
    }

    pub fn try_acquire_execution_slot(&self) -> Option<ExecutionSlot> {
        self.execution.clone().try_acquire_owned().ok().map(|permit| ExecutionSlot { _permit: permit })
    }

    pub fn execution_slot_available(&self) -> bool { self.execution.available_permits() > 0 }
}

async fn disconnect(handle: Option<Arc<dyn BackendSession>>) {
    if let Some(handle) = handle {
        if let Err(e) = handle.disconnect().await {
            warn!(error = %e, "backend disconnect failed");
        }
    }
}

/// Argon2 is CPU-bound; keep it off the async workers.
async fn unseal_blocking(sealed: Vec<u8>, password: &str) -> Result<SeedPhrase, SealError> {
    let password = Zeroizing::new(password.to_string());
    tokio::task::spawn_blocking(move || auth::unseal_seed(&sealed, &password))
        .await
        .map_err(|e| SealError::Seal(format!("unseal task: {e}")))?
}
