//! WalletSession - the observable, non-secret view of wallet state.

use crate::store::{BoundAddress, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No sealed seed exists.
    Uninitialized,
    /// A sealed seed exists; no decrypted secret in memory.
    LockedWithBackup,
    Connecting,
    Connected,
    /// Decrypted, but the backend could not be reached. Secret kept for retry.
    ConnectionFailed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::LockedWithBackup => "locked_with_backup",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::ConnectionFailed => "connection_failed",
        }
    }

    /// Resting state when no secret is held.
    pub(crate) fn at_rest(has_backup: bool) -> Self {
        if has_backup { LifecycleState::LockedWithBackup } else { LifecycleState::Uninitialized }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSession {
    pub lifecycle: LifecycleState,
    /// Smallest value unit. `None` whenever not `Connected`.
    pub cached_balance: Option<u64>,
    pub backup_confirmed: bool,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub bound_address: Option<BoundAddress>,
    /// Bumped on every connect, lock and expiry.
    pub connection_epoch: u64,
}

impl Default for WalletSession {
    fn default() -> Self { Self::from_snapshot(&SessionSnapshot::default(), 0) }
}

impl WalletSession {
    pub(crate) fn from_snapshot(snapshot: &SessionSnapshot, epoch: u64) -> Self {
        Self {
            lifecycle: LifecycleState::at_rest(snapshot.has_backup),
            cached_balance: None,
            backup_confirmed: snapshot.backup_confirmed,
            last_backup_at: snapshot.last_backup_at,
            bound_address: snapshot.bound_address.clone(),
            connection_epoch: epoch,
        }
    }

    pub fn is_connected(&self) -> bool { self.lifecycle == LifecycleState::Connected }

    /// Balance only while it is authoritative.
    pub fn balance(&self) -> Option<u64> {
        if self.is_connected() { self.cached_balance } else { None }
    }
}
