//! PriceConverter - fiat display values from a periodically refreshed quote.
//!
//! Native amounts are integer sats. Fiat values are `f64` and only ever used
//! for display or as user input that is immediately rounded back to sats.
//! When no quote has ever been fetched the converter says `Unavailable`
//! rather than pretending the value is zero.

use crate::error::PriceError;
use crate::runtime::Shutdown;
use crate::session::config::WalletConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SATS_PER_COIN: u64 = 100_000_000;

/// Fiat price of one whole coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub rate: f64,
    pub currency: String,
    pub as_of: DateTime<Utc>,
}

impl PriceQuote {
    fn is_usable(&self) -> bool { self.rate.is_finite() && self.rate > 0.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayValue {
    Available { value: f64, currency: String },
    Unavailable,
}

impl DisplayValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            DisplayValue::Available { value, .. } => Some(*value),
            DisplayValue::Unavailable => None,
        }
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest quote, or `None` if the source has nothing yet.
    async fn latest_quote(&self) -> Result<Option<PriceQuote>, PriceError>;
}

/// Source with a settable quote. Backs tests and the offline CLI.
#[derive(Default)]
pub struct FixedPriceSource {
    quote: Mutex<Option<PriceQuote>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FixedPriceSource {
    pub fn new(quote: Option<PriceQuote>) -> Self {
        Self { quote: Mutex::new(quote), ..Default::default() }
    }

    pub fn with_rate(rate: f64, currency: &str) -> Self {
        Self::new(Some(PriceQuote { rate, currency: currency.into(), as_of: Utc::now() }))
    }

    pub fn set_quote(&self, quote: Option<PriceQuote>) {
        *self.quote.lock().unwrap_or_else(|p| p.into_inner()) = quote;
    }

    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }

    /// Delay every answer, to exercise fetch timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl PriceSource for FixedPriceSource {
    async fn latest_quote(&self) -> Result<Option<PriceQuote>, PriceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PriceError::Fetch("source offline".into()));
        }
        Ok(self.quote.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

pub struct PriceConverter {
    source: Arc<dyn PriceSource>,
    cached: RwLock<Option<PriceQuote>>,
    fetch_timeout: Duration,
    refresh_every: Duration,
}

impl PriceConverter {
    pub fn new(source: Arc<dyn PriceSource>, fetch_timeout: Duration, refresh_every: Duration) -> Self {
        Self { source, cached: RwLock::new(None), fetch_timeout, refresh_every }
    }

    pub fn from_config(source: Arc<dyn PriceSource>, config: &WalletConfig) -> Self {
        Self::new(source, config.price_fetch_timeout, config.price_refresh)
    }

    /// Last quote successfully fetched, if any.
    pub fn last_known(&self) -> Option<PriceQuote> {
        self.cached.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Fetch from the source, bounded by the fetch timeout. A usable quote
    /// replaces the cache; failures leave the cache as it was.
    pub async fn refresh(&self) -> Result<Option<PriceQuote>, PriceError> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.latest_quote())
            .await
            .map_err(|_| PriceError::Timeout)??;
        match fetched {
            Some(quote) if quote.is_usable() => {
                debug!(rate = quote.rate, currency = %quote.currency, "price quote refreshed");
                *self.cached.write().unwrap_or_else(|p| p.into_inner()) = Some(quote.clone());
                Ok(Some(quote))
            }
            Some(quote) => {
                warn!(rate = quote.rate, "ignoring unusable price quote");
                Ok(self.last_known())
            }
            None => Ok(self.last_known()),
        }
    }

    /// Cached quote, or one bounded fetch attempt if nothing is cached yet.
    async fn current(&self) -> Option<PriceQuote> {
        if let Some(quote) = self.last_known() {
            return Some(quote);
        }
        match self.refresh().await {
            Ok(quote) => quote,
            Err(e) => {
                debug!(error = %e, "price unavailable");
                None
            }
        }
    }

    pub async fn to_display_unit(&self, amount: u64) -> DisplayValue {
        match self.current().await {
            Some(quote) => DisplayValue::Available {
                value: amount as f64 / SATS_PER_COIN as f64 * quote.rate,
                currency: quote.currency,
            },
            None => DisplayValue::Unavailable,
        }
    }

    /// Nearest whole sat for a fiat value. `None` when no quote is available.
    /// Non-positive or non-finite input converts to 0.
    pub async fn to_native_unit(&self, value: f64) -> Option<u64> {
        let quote = self.current().await?;
        if !value.is_finite() || value <= 0.0 {
            return Some(0);
        }
        let sats = (value / quote.rate * SATS_PER_COIN as f64).round();
        Some(if sats >= u64::MAX as f64 { u64::MAX } else { sats as u64 })
    }

    /// Refresh every `refresh_every` until shutdown.
    pub fn spawn_refresher(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let converter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(converter.refresh_every);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = converter.refresh().await {
                            warn!(error = %e, "price refresh failed; keeping last known quote");
                        }
                    }
                }
            }
            debug!("price refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(source: Arc<FixedPriceSource>) -> PriceConverter {
        PriceConverter::new(source, Duration::from_millis(200), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn unavailable_without_quote() {
        let source = Arc::new(FixedPriceSource::new(None));
        let prices = converter(source);
        assert_eq!(prices.to_display_unit(1_000).await, DisplayValue::Unavailable);
        assert_eq!(prices.to_native_unit(1.0).await, None);
    }

    #[tokio::test]
    async fn round_trip_within_one_sat() {
        let source = Arc::new(FixedPriceSource::with_rate(64_321.17, "USD"));
        let prices = converter(source);
        for x in [1u64, 21, 999, 1_000, 123_457, 2_100_000_000_000] {
            let fiat = prices.to_display_unit(x).await.value().unwrap();
            let back = prices.to_native_unit(fiat).await.unwrap();
            assert!(back.abs_diff(x) <= 1, "{x} -> {fiat} -> {back}");
        }
    }

    #[tokio::test]
    async fn keeps_last_known_on_failure() {
        let source = Arc::new(FixedPriceSource::with_rate(50_000.0, "EUR"));
        let prices = converter(source.clone());
        prices.refresh().await.unwrap();
        source.set_failing(true);
        assert!(prices.refresh().await.is_err());
        assert_eq!(prices.to_display_unit(SATS_PER_COIN).await.value(), Some(50_000.0));
        assert_eq!(prices.to_native_unit(-5.0).await, Some(0));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = Arc::new(FixedPriceSource::with_rate(50_000.0, "EUR"));
        source.set_delay(Some(Duration::from_secs(5)));
        let prices = converter(source);
        assert_eq!(prices.refresh().await, Err(PriceError::Timeout));
        assert_eq!(prices.to_display_unit(100).await, DisplayValue::Unavailable);
    }
}
