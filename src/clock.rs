//! Clock - wall time injected into every component that checks expiry.
//!
//! Secret TTLs and quote expiry are checked against `Clock::now()` instead of
//! calling `Utc::now()` directly, so tests can move time with `ManualClock`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self { Self::new() }
}

impl ManualClock {
    pub fn new() -> Self { Self::at(Utc::now()) }

    pub fn at(start: DateTime<Utc>) -> Self { Self { now: Arc::new(Mutex::new(start)) } }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = later(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock().unwrap_or_else(|p| p.into_inner()) }
}

/// std -> chrono duration, saturating at chrono's maximum.
pub fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

/// `from + by`, saturating at the latest representable instant.
pub fn later(from: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    from.checked_add_signed(to_chrono(by)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
