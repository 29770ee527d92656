//! Rate-limit governor: sliding-window admission gate for a wrapped provider.
//!
//! This is the `waitForSlot` / sliding-window-admission half of the
//! rate-limit governor contract; [`crate::blacklist`] implements the
//! cooldown-on-capacity-error half.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pp_core::connector::{
    AvailabilityContext, BackfillProvider, FigiResolverProvider, Provider, StreamSinks,
    StreamingProvider, SymbolSearchProvider,
};
use pp_core::{
    AdjustedBar, Capabilities, DateRange, Granularity, HistoricalBar, Middleware, ProviderId,
    ProviderPlaneError, SubscriptionId,
};
use pp_types::{QuotaConfig, QuotaState};

struct Window {
    timestamps: VecDeque<Instant>,
    last_admitted: Option<Instant>,
}

/// Wrapper that enforces a sliding-window request quota on its inner provider.
///
/// Every call waits for a slot via [`QuotaGatedProvider::wait_for_slot`] before
/// reaching the inner provider: if the window still has room and the minimum
/// inter-request delay has elapsed, it admits immediately; otherwise it sleeps
/// until a slot frees up.
pub struct QuotaGatedProvider {
    inner: Arc<dyn Provider>,
    config: QuotaConfig,
    window: Mutex<Window>,
}

impl QuotaGatedProvider {
    /// Wrap `inner` with a sliding-window admission gate configured by `config`.
    #[must_use]
    pub fn new(inner: Arc<dyn Provider>, config: QuotaConfig) -> Self {
        Self {
            inner,
            config,
            window: Mutex::new(Window {
                timestamps: VecDeque::new(),
                last_admitted: None,
            }),
        }
    }

    /// Access the inner provider.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    fn evict_expired(&self, window: &mut Window, now: Instant) {
        while let Some(&oldest) = window.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Non-blocking: whether the window is currently at capacity.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        let mut window = self.window.lock().expect("mutex poisoned");
        let now = Instant::now();
        self.evict_expired(&mut window, now);
        window.timestamps.len() as u64 >= self.config.limit
    }

    /// Non-blocking: whether the window has consumed at least `fraction` of its budget.
    #[must_use]
    pub fn is_approaching_limit(&self, fraction: f64) -> bool {
        let mut window = self.window.lock().expect("mutex poisoned");
        let now = Instant::now();
        self.evict_expired(&mut window, now);
        let used = window.timestamps.len() as f64;
        let limit = self.config.limit.max(1) as f64;
        used / limit >= fraction
    }

    /// Snapshot the current quota budget state.
    #[must_use]
    pub fn state(&self) -> QuotaState {
        let mut window = self.window.lock().expect("mutex poisoned");
        let now = Instant::now();
        self.evict_expired(&mut window, now);
        let remaining = self.config.limit.saturating_sub(window.timestamps.len() as u64);
        let reset_in = window.timestamps.front().map_or(Duration::ZERO, |oldest| {
            self.config
                .window
                .saturating_sub(now.saturating_duration_since(*oldest))
        });
        QuotaState {
            limit: self.config.limit,
            remaining,
            reset_in,
            cooldown_remaining: None,
        }
    }

    /// Suspend until a slot is admitted under the sliding window and the
    /// minimum inter-request delay, then record the admission.
    pub async fn wait_for_slot(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().expect("mutex poisoned");
                let now = Instant::now();
                self.evict_expired(&mut window, now);

                let delay_remaining = window.last_admitted.and_then(|last| {
                    let since = now.saturating_duration_since(last);
                    (since < self.config.min_inter_request_delay)
                        .then(|| self.config.min_inter_request_delay - since)
                });

                if delay_remaining.is_none() && (window.timestamps.len() as u64) < self.config.limit
                {
                    window.timestamps.push_back(now);
                    window.last_admitted = Some(now);
                    None
                } else if let Some(d) = delay_remaining {
                    Some(d)
                } else {
                    let oldest = *window.timestamps.front().expect("at capacity implies non-empty");
                    Some(
                        self.config
                            .window
                            .saturating_sub(now.saturating_duration_since(oldest)),
                    )
                }
            };

            match wait {
                None => return,
                Some(d) if d.is_zero() => continue,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Builder-facing middleware descriptor for [`QuotaGatedProvider`].
pub struct QuotaMiddleware {
    /// Sliding-window budget and minimum inter-request delay.
    pub config: QuotaConfig,
}

impl QuotaMiddleware {
    /// Construct a descriptor with the given quota configuration.
    #[must_use]
    pub const fn new(config: QuotaConfig) -> Self {
        Self { config }
    }
}

impl Middleware for QuotaMiddleware {
    fn apply(self: Box<Self>, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(QuotaGatedProvider::new(inner, self.config))
    }

    fn name(&self) -> &'static str {
        "QuotaGatedProvider"
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({
            "limit": self.config.limit,
            "window_ms": self.config.window.as_millis(),
            "min_inter_request_delay_ms": self.config.min_inter_request_delay.as_millis(),
            "cooldown_on_429_ms": self.config.cooldown_on_429.as_millis(),
        })
    }
}

#[async_trait]
impl Provider for QuotaGatedProvider {
    fn id(&self) -> ProviderId {
        self.inner.id()
    }

    fn capabilities(&self) -> &Capabilities {
        self.inner.capabilities()
    }

    fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
        self.inner.as_streaming_provider().map(|_| self as _)
    }

    fn as_backfill_provider(&self) -> Option<&dyn BackfillProvider> {
        self.inner.as_backfill_provider().map(|_| self as _)
    }

    fn as_symbol_search_provider(&self) -> Option<&dyn SymbolSearchProvider> {
        self.inner.as_symbol_search_provider().map(|_| self as _)
    }

    fn as_figi_resolver_provider(&self) -> Option<&dyn FigiResolverProvider> {
        self.inner.as_figi_resolver_provider().map(|_| self as _)
    }

    async fn is_available(&self, ctx: AvailabilityContext<'_>) -> bool {
        !self.is_rate_limited() && self.inner.is_available(ctx).await
    }

    async fn dispose(&self) -> Result<(), ProviderPlaneError> {
        self.inner.dispose().await
    }
}

#[async_trait]
impl StreamingProvider for QuotaGatedProvider {
    async fn connect(&self, sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.connect(sinks).await
    }

    async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.disconnect().await
    }

    async fn subscribe_trades(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.subscribe_trades(symbol).await
    }

    async fn unsubscribe_trades(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_trades(symbol).await
    }

    async fn subscribe_quotes(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.subscribe_quotes(symbol).await
    }

    async fn unsubscribe_quotes(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_quotes(symbol).await
    }

    async fn subscribe_depth(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.subscribe_depth(symbol).await
    }

    async fn unsubscribe_depth(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_depth(symbol).await
    }
}

#[async_trait]
impl BackfillProvider for QuotaGatedProvider {
    async fn fetch_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_backfill_provider().expect("checked by accessor");
        inner.fetch_bars(symbol, range, granularity).await
    }

    async fn fetch_adjusted_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<AdjustedBar>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self.inner.as_backfill_provider().expect("checked by accessor");
        inner.fetch_adjusted_bars(symbol, range, granularity).await
    }
}

#[async_trait]
impl SymbolSearchProvider for QuotaGatedProvider {
    async fn search(
        &self,
        query: &str,
    ) -> Result<Vec<pp_core::connector::SymbolSearchResult>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_symbol_search_provider()
            .expect("checked by accessor");
        inner.search(query).await
    }
}

#[async_trait]
impl FigiResolverProvider for QuotaGatedProvider {
    async fn lookup_by_ticker(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        market_sector: Option<&str>,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        inner.lookup_by_ticker(ticker, exchange, market_sector).await
    }

    async fn lookup_by_isin(
        &self,
        isin: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        inner.lookup_by_isin(isin).await
    }

    async fn lookup_by_cusip(
        &self,
        cusip: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        inner.lookup_by_cusip(cusip).await
    }

    async fn lookup_by_sedol(
        &self,
        sedol: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        inner.lookup_by_sedol(sedol).await
    }

    async fn lookup_tickers_batch(
        &self,
        tickers: &[pp_core::connector::TickerLookup],
    ) -> Result<Vec<Vec<pp_core::connector::FigiMapping>>, ProviderPlaneError> {
        self.wait_for_slot().await;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        inner.lookup_tickers_batch(tickers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_core::{CapabilityMask, PrimaryKind, RateLimitProfile};

    struct CountingStreaming {
        calls: std::sync::atomic::AtomicU64,
    }

    struct Counting {
        caps: Capabilities,
        streaming: CountingStreaming,
    }

    #[async_trait]
    impl StreamingProvider for CountingStreaming {
        async fn connect(&self, _sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn subscribe_trades(&self, _symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(SubscriptionId(100_000 + n))
        }
        async fn unsubscribe_trades(&self, _symbol: &str) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Provider for Counting {
        fn id(&self) -> ProviderId {
            ProviderId::new("counting")
        }
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }
        fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
            Some(&self.streaming)
        }
    }

    fn counting() -> Counting {
        Counting {
            caps: Capabilities {
                primary_kind: PrimaryKind::Streaming,
                mask: CapabilityMask::STREAM_TRADES,
                max_depth_levels: None,
                supports_adjusted: false,
                supports_intraday: false,
                supports_historical_trades: false,
                supports_historical_quotes: false,
                supports_auctions: false,
                markets: vec![],
                rate_limit: RateLimitProfile {
                    max_requests: 2,
                    window_ms: 200,
                    min_inter_request_delay_ms: 0,
                },
            },
            streaming: CountingStreaming {
                calls: std::sync::atomic::AtomicU64::new(0),
            },
        }
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_waits_for_window_to_clear() {
        let config = QuotaConfig {
            limit: 2,
            window: Duration::from_millis(100),
            min_inter_request_delay: Duration::from_millis(0),
            cooldown_on_429: Duration::from_secs(60),
            strategy: pp_types::QuotaConsumptionStrategy::Unit,
        };
        let wrapped = QuotaGatedProvider::new(Arc::new(counting()), config);
        let streaming = wrapped.as_streaming_provider().unwrap();

        streaming.subscribe_trades("AAPL").await.unwrap();
        streaming.subscribe_trades("AAPL").await.unwrap();
        assert!(wrapped.is_rate_limited());

        let start = Instant::now();
        streaming.subscribe_trades("AAPL").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn enforces_minimum_inter_request_delay() {
        let config = QuotaConfig {
            limit: 1000,
            window: Duration::from_secs(60),
            min_inter_request_delay: Duration::from_millis(80),
            cooldown_on_429: Duration::from_secs(60),
            strategy: pp_types::QuotaConsumptionStrategy::Unit,
        };
        let wrapped = QuotaGatedProvider::new(Arc::new(counting()), config);
        let streaming = wrapped.as_streaming_provider().unwrap();

        streaming.subscribe_trades("AAPL").await.unwrap();
        let start = Instant::now();
        streaming.subscribe_trades("AAPL").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
