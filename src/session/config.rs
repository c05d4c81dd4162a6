//! Wallet Configuration - passed from higher layers

use std::path::PathBuf;
use std::time::Duration;

/// Settlement network the backend session is opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Some(Network::Mainnet),
            "regtest" | "local" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// How the in-memory secret's lifetime reacts to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Renewal {
    /// Countdown starts at unlock and is never extended.
    Fixed,
    /// Every sanctioned backend use pushes `expires_at` out by a full TTL.
    #[default]
    RenewOnActivity,
}

impl Renewal {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" | "countdown" => Some(Renewal::Fixed),
            "activity" | "renew" | "renew-on-activity" => Some(Renewal::RenewOnActivity),
            _ => None,
        }
    }
}

/// Lifetime policy for the decrypted seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPolicy {
    pub ttl: Duration,
    pub renewal: Renewal,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(15 * 60), renewal: Renewal::default() }
    }
}

impl SecretPolicy {
    pub fn fixed(ttl: Duration) -> Self { Self { ttl, renewal: Renewal::Fixed } }
    pub fn renew_on_activity(ttl: Duration) -> Self { Self { ttl, renewal: Renewal::RenewOnActivity } }
}

/// Argon2id cost parameters used when sealing a new seed.
///
/// Parameters travel inside each sealed blob, so changing them only affects
/// blobs sealed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KdfParams {
    #[serde(rename = "m")]
    pub memory_kib: u32,
    #[serde(rename = "t")]
    pub iterations: u32,
    #[serde(rename = "p")]
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self { Self { memory_kib: 19 * 1024, iterations: 2, parallelism: 1 } }
}

impl KdfParams {
    /// Minimum-cost parameters. Only for tests and throwaway sandboxes.
    pub fn light() -> Self { Self { memory_kib: 64, iterations: 1, parallelism: 1 } }

    /// Largest costs accepted when sealing or unsealing: 1 GiB, 10 passes, 8 lanes.
    pub const MAX_MEMORY_KIB: u32 = 1024 * 1024;
    pub const MAX_ITERATIONS: u32 = 10;
    pub const MAX_PARALLELISM: u32 = 8;

    /// Whether these costs are within the accepted bounds.
    pub fn within_limits(&self) -> bool {
        self.memory_kib <= Self::MAX_MEMORY_KIB
            && (1..=Self::MAX_ITERATIONS).contains(&self.iterations)
            && (1..=Self::MAX_PARALLELISM).contains(&self.parallelism)
    }
}

/// Wallet configuration. Higher layers construct this.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub app: String,
    pub network: Network,
    pub api_key: Option<String>,
    pub secret_policy: SecretPolicy,
    pub kdf: KdfParams,
    pub quick_amounts: Vec<u64>,
    pub price_refresh: Duration,
    pub price_fetch_timeout: Duration,
    pub data_dir: Option<PathBuf>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            app: "beezap".into(),
            network: Network::default(),
            api_key: None,
            secret_policy: SecretPolicy::default(),
            kdf: KdfParams::default(),
            quick_amounts: vec![21, 100, 1_000, 5_000, 10_000],
            price_refresh: Duration::from_secs(5 * 60),
            price_fetch_timeout: Duration::from_secs(3),
            data_dir: None,
        }
    }
}

impl WalletConfig {
    pub fn new(app: impl Into<String>) -> Self {
        Self { app: app.into(), ..Default::default() }
    }
    pub fn with_network(mut self, network: Network) -> Self { self.network = network; self }
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self { self.api_key = Some(key.into()); self }
    pub fn with_secret_policy(mut self, policy: SecretPolicy) -> Self { self.secret_policy = policy; self }
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self { self.kdf = kdf; self }
    pub fn with_quick_amounts(mut self, amounts: Vec<u64>) -> Self { self.quick_amounts = amounts; self }
    pub fn with_price_refresh(mut self, every: Duration) -> Self { self.price_refresh = every; self }
    pub fn with_price_fetch_timeout(mut self, timeout: Duration) -> Self { self.price_fetch_timeout = timeout; self }
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self { self.data_dir = Some(path.into()); self }

    /// Overlay `BEEZAP_*` environment variables on the defaults.
    ///
    /// Unparseable values are ignored with a warning rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(app) = std::env::var("BEEZAP_APP") {
            if !app.trim().is_empty() { config.app = app.trim().to_string(); }
        }
        if let Ok(value) = std::env::var("BEEZAP_NETWORK") {
            match Network::from_str(&value) {
                Some(network) => config.network = network,
                None => tracing::warn!(value = %value, "ignoring unknown BEEZAP_NETWORK"),
            }
        }
        if let Ok(key) = std::env::var("BEEZAP_API_KEY") {
            if !key.is_empty() { config.api_key = Some(key); }
        }
        if let Ok(value) = std::env::var("BEEZAP_SECRET_TTL_SECS") {
            match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.secret_policy.ttl = Duration::from_secs(secs),
                _ => tracing::warn!(value = %value, "ignoring invalid BEEZAP_SECRET_TTL_SECS"),
            }
        }
        if let Ok(value) = std::env::var("BEEZAP_SECRET_RENEWAL") {
            match Renewal::from_str(&value) {
                Some(renewal) => config.secret_policy.renewal = renewal,
                None => tracing::warn!(value = %value, "ignoring unknown BEEZAP_SECRET_RENEWAL"),
            }
        }
        config
    }

    /// Directory holding the sealed seed and session snapshot.
    #[cfg(feature = "native")]
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let root = std::env::var("BEEZAP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")));
        root.join(&self.app).join("data")
    }
}
