//! Secret material held in memory.
//!
//! `SeedPhrase` is the only type that carries decrypted seed words. It zeroizes
//! on drop, cannot be cloned, and prints as `[redacted]`. `InMemorySecret`
//! adds the expiry that gates every signing-capable use.

use crate::clock::later;
use crate::session::config::{Renewal, SecretPolicy};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// BIP39 seed words. Zeroized on drop.
pub struct SeedPhrase(Zeroizing<String>);

impl SeedPhrase {
    pub(crate) fn new(words: String) -> Self { Self(Zeroizing::new(words)) }

    /// Borrow the words. Callers must not copy them into long-lived state.
    pub fn expose(&self) -> &str { self.0.as_str() }

    pub fn word_count(&self) -> usize { self.0.split_whitespace().count() }

    /// Stable, non-reversible identifier for the seed (first 8 bytes of blake3).
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(self.0.as_bytes()).as_bytes()[..8])
    }
}

impl fmt::Debug for SeedPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("SeedPhrase([redacted])") }
}

/// Decrypted seed with an enforced lifetime.
///
/// Owned exclusively by the session manager. Once `now >= expires_at` the
/// material is unusable and the owner must discard it. The `Arc` only lets a
/// backend connect borrow the words across an await; the words are zeroized
/// when the last reference drops.
pub(crate) struct InMemorySecret {
    material: Arc<SeedPhrase>,
    expires_at: DateTime<Utc>,
}

impl InMemorySecret {
    pub(crate) fn new(material: SeedPhrase, now: DateTime<Utc>, policy: &SecretPolicy) -> Self {
        Self { material: Arc::new(material), expires_at: later(now, policy.ttl) }
    }

    pub(crate) fn expires_at(&self) -> DateTime<Utc> { self.expires_at }

    pub(crate) fn is_live(&self, now: DateTime<Utc>) -> bool { now < self.expires_at }

    /// Material for a signing-capable call, or `None` once expired.
    pub(crate) fn material(&self, now: DateTime<Utc>) -> Option<Arc<SeedPhrase>> {
        self.is_live(now).then(|| self.material.clone())
    }

    /// Record activity. Extends the deadline only under `RenewOnActivity`, and
    /// never revives an expired secret.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>, policy: &SecretPolicy) {
        if policy.renewal == Renewal::RenewOnActivity && self.is_live(now) {
            self.expires_at = later(now, policy.ttl);
        }
    }
}

impl fmt::Debug for InMemorySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySecret")
            .field("material", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
