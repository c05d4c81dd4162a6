//! SecretStore - persistence boundary for the sealed seed and session snapshot.
//!
//! Implementations only ever see opaque sealed bytes; decryption happens in
//! the session manager. The snapshot is non-secret and is what the session is
//! rebuilt from at process start.

#[cfg(feature = "native")]
mod file;

#[cfg(feature = "native")]
pub use file::FileSecretStore;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Registered payment address metadata. Not secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Non-secret session state persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// A sealed seed has been written to the store.
    pub has_backup: bool,
    /// The user explicitly acknowledged saving their recovery words.
    #[serde(default)]
    pub backup_confirmed: bool,
    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bound_address: Option<BoundAddress>,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn encrypted_seed(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn save_encrypted_seed(&self, sealed: &[u8]) -> Result<(), StoreError>;
    async fn snapshot(&self) -> Result<SessionSnapshot, StoreError>;
    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;
    async fn clear_all(&self) -> Result<(), StoreError>;
}

/// In-memory store. Used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    seed: Mutex<Option<Vec<u8>>>,
    snapshot: Mutex<SessionSnapshot>,
    fail_writes: AtomicBool,
    fail_snapshot_writes: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self { Self::default() }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    /// Make only snapshot writes fail. Seed writes still succeed.
    pub fn fail_snapshot_writes(&self, fail: bool) { self.fail_snapshot_writes.store(fail, Ordering::SeqCst); }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn encrypted_seed(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.seed.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn save_encrypted_seed(&self, sealed: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.seed.lock().unwrap_or_else(|p| p.into_inner()) = Some(sealed.to_vec());
        Ok(())
    }

    async fn snapshot(&self) -> Result<SessionSnapshot, StoreError> {
        Ok(self.snapshot.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        if self.fail_snapshot_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("snapshot writes disabled".into()));
        }
        *self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.seed.lock().unwrap_or_else(|p| p.into_inner()) = None;
        *self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = SessionSnapshot::default();
        Ok(())
    }
}
