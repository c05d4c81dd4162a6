//! Config Tests: environment overlay and on-disk layout
//!
//! These tests verify:
//! 1. BEEZAP_* variables override defaults
//! 2. Bad values are ignored, not fatal
//! 3. The data directory follows BEEZAP_ROOT and the app name

use beezap::{Network, Renewal, WalletConfig};
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const VARS: &[&str] = &[
    "BEEZAP_APP",
    "BEEZAP_NETWORK",
    "BEEZAP_API_KEY",
    "BEEZAP_SECRET_TTL_SECS",
    "BEEZAP_SECRET_RENEWAL",
    "BEEZAP_ROOT",
];

fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    let guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    for var in VARS {
        std::env::remove_var(var);
    }
    guard
}

/// Test: environment overrides every supported field
#[test]
fn env_overrides_defaults() {
    let _guard = lock_env();
    std::env::set_var("BEEZAP_APP", "zaps");
    std::env::set_var("BEEZAP_NETWORK", "regtest");
    std::env::set_var("BEEZAP_API_KEY", "k-123");
    std::env::set_var("BEEZAP_SECRET_TTL_SECS", "120");
    std::env::set_var("BEEZAP_SECRET_RENEWAL", "fixed");

    let config = WalletConfig::from_env();
    assert_eq!(config.app, "zaps");
    assert_eq!(config.network, Network::Regtest);
    assert_eq!(config.api_key.as_deref(), Some("k-123"));
    assert_eq!(config.secret_policy.ttl, Duration::from_secs(120));
    assert_eq!(config.secret_policy.renewal, Renewal::Fixed);
}

/// Test: unparseable values leave the defaults in place
#[test]
fn invalid_env_is_ignored() {
    let _guard = lock_env();
    std::env::set_var("BEEZAP_NETWORK", "signet");
    std::env::set_var("BEEZAP_SECRET_TTL_SECS", "0");
    std::env::set_var("BEEZAP_SECRET_RENEWAL", "sometimes");

    let config = WalletConfig::from_env();
    let defaults = WalletConfig::default();
    assert_eq!(config.network, defaults.network);
    assert_eq!(config.secret_policy, defaults.secret_policy);
    assert_eq!(config.app, "beezap");
}

/// Test: data dir is <root>/<app>/data unless set explicitly
#[test]
fn data_dir_layout() {
    let _guard = lock_env();
    let dir = TempDir::new().expect("tempdir");
    std::env::set_var("BEEZAP_ROOT", dir.path());

    let config = WalletConfig::new("zaps");
    assert_eq!(config.resolved_data_dir(), dir.path().join("zaps").join("data"));

    let pinned = WalletConfig::new("zaps").with_data_dir(dir.path().join("elsewhere"));
    assert_eq!(pinned.resolved_data_dir(), dir.path().join("elsewhere"));
}
