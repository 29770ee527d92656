//! Cooldown-blacklist middleware: after a provider signals rate-limit
//! exhaustion, gate every further call to it until the cooldown expires.
//!
//! This is the `recordRateLimitHit` / temporary-cooldown half of the
//! rate-limit governor contract; [`crate::quota`] implements the
//! sliding-window admission half.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pp_core::connector::{
    AvailabilityContext, BackfillProvider, FigiResolverProvider, Provider, StreamSinks,
    StreamingProvider, SymbolSearchProvider,
};
use pp_core::{
    AdjustedBar, Capabilities, DateRange, Granularity, HistoricalBar, Middleware,
    ProviderId, ProviderPlaneError, SubscriptionId,
};

/// Middleware that blacklists its inner provider for a period upon quota exhaustion.
pub struct BlacklistedProvider {
    inner: Arc<dyn Provider>,
    state: Mutex<Option<Instant>>,
    default_duration: Duration,
}

impl BlacklistedProvider {
    /// Wrap `inner`, blacklisting it for `default_duration` whenever its calls
    /// return [`ProviderPlaneError::Capacity`] without a specific `retry_after`.
    #[must_use]
    pub fn new(inner: Arc<dyn Provider>, default_duration: Duration) -> Self {
        Self {
            inner,
            state: Mutex::new(None),
            default_duration,
        }
    }

    fn remaining_ms(&self) -> Option<u64> {
        let mut guard = self.state.lock().expect("mutex poisoned");
        let now = Instant::now();
        if let Some(until) = *guard {
            if now < until {
                let remaining = until.saturating_duration_since(now);
                return Some(remaining.as_millis().try_into().unwrap_or(u64::MAX).max(1));
            }
            *guard = None;
        }
        None
    }

    fn blacklist_until(&self, until: Instant) {
        *self.state.lock().expect("mutex poisoned") = Some(until);
    }

    fn guard(&self) -> Result<(), ProviderPlaneError> {
        if let Some(ms) = self.remaining_ms() {
            return Err(ProviderPlaneError::temporarily_blacklisted(
                self.inner.id().as_str(),
                ms,
            ));
        }
        Ok(())
    }

    fn observe<T>(&self, result: Result<T, ProviderPlaneError>) -> Result<T, ProviderPlaneError> {
        if let Err(ProviderPlaneError::Capacity { retry_after, .. }) = &result {
            let duration = retry_after.unwrap_or(self.default_duration);
            self.blacklist_until(Instant::now() + duration);
        }
        result
    }
}

/// Builder-facing middleware descriptor for [`BlacklistedProvider`].
pub struct BlacklistMiddleware {
    /// Cooldown applied when a capacity error carries no explicit `retry_after`.
    pub duration: Duration,
}

impl BlacklistMiddleware {
    /// Construct a descriptor with the given default cooldown.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Middleware for BlacklistMiddleware {
    fn apply(self: Box<Self>, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(BlacklistedProvider::new(inner, self.duration))
    }

    fn name(&self) -> &'static str {
        "BlacklistedProvider"
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({ "default_duration_ms": self.duration.as_millis() })
    }
}

#[async_trait]
impl Provider for BlacklistedProvider {
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
        self.remaining_ms().is_none() && self.inner.is_available(ctx).await
    }

    async fn dispose(&self) -> Result<(), ProviderPlaneError> {
        self.inner.dispose().await
    }
}

#[async_trait]
impl StreamingProvider for BlacklistedProvider {
    async fn connect(&self, sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        self.observe(inner.connect(sinks).await)
    }

    async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.disconnect().await
    }

    async fn subscribe_trades(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        self.observe(inner.subscribe_trades(symbol).await)
    }

    async fn unsubscribe_trades(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_trades(symbol).await
    }

    async fn subscribe_quotes(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        self.observe(inner.subscribe_quotes(symbol).await)
    }

    async fn unsubscribe_quotes(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_quotes(symbol).await
    }

    async fn subscribe_depth(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        self.observe(inner.subscribe_depth(symbol).await)
    }

    async fn unsubscribe_depth(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let inner = self.inner.as_streaming_provider().expect("checked by accessor");
        inner.unsubscribe_depth(symbol).await
    }
}

#[async_trait]
impl BackfillProvider for BlacklistedProvider {
    async fn fetch_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_backfill_provider().expect("checked by accessor");
        self.observe(inner.fetch_bars(symbol, range, granularity).await)
    }

    async fn fetch_adjusted_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<AdjustedBar>, ProviderPlaneError> {
        self.guard()?;
        let inner = self.inner.as_backfill_provider().expect("checked by accessor");
        self.observe(inner.fetch_adjusted_bars(symbol, range, granularity).await)
    }
}

#[async_trait]
impl SymbolSearchProvider for BlacklistedProvider {
    async fn search(
        &self,
        query: &str,
    ) -> Result<Vec<pp_core::connector::SymbolSearchResult>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_symbol_search_provider()
            .expect("checked by accessor");
        self.observe(inner.search(query).await)
    }
}

#[async_trait]
impl FigiResolverProvider for BlacklistedProvider {
    async fn lookup_by_ticker(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        market_sector: Option<&str>,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        self.observe(inner.lookup_by_ticker(ticker, exchange, market_sector).await)
    }

    async fn lookup_by_isin(
        &self,
        isin: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        self.observe(inner.lookup_by_isin(isin).await)
    }

    async fn lookup_by_cusip(
        &self,
        cusip: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        self.observe(inner.lookup_by_cusip(cusip).await)
    }

    async fn lookup_by_sedol(
        &self,
        sedol: &str,
    ) -> Result<Vec<pp_core::connector::FigiMapping>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        self.observe(inner.lookup_by_sedol(sedol).await)
    }

    async fn lookup_tickers_batch(
        &self,
        tickers: &[pp_core::connector::TickerLookup],
    ) -> Result<Vec<Vec<pp_core::connector::FigiMapping>>, ProviderPlaneError> {
        self.guard()?;
        let inner = self
            .inner
            .as_figi_resolver_provider()
            .expect("checked by accessor");
        self.observe(inner.lookup_tickers_batch(tickers).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_core::connector::AvailabilityContext;
    use pp_core::{CapabilityMask, PrimaryKind, RateLimitProfile};

    struct FlakyStreaming {
        fail_next: std::sync::atomic::AtomicBool,
    }

    struct Flaky {
        caps: Capabilities,
        streaming: FlakyStreaming,
    }

    #[async_trait]
    impl StreamingProvider for FlakyStreaming {
        async fn connect(&self, _sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn subscribe_trades(&self, _symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                Err(ProviderPlaneError::capacity("flaky", Some(Duration::from_millis(50))))
            } else {
                Ok(SubscriptionId(100_000))
            }
        }
        async fn unsubscribe_trades(&self, _symbol: &str) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Provider for Flaky {
        fn id(&self) -> ProviderId {
            ProviderId::new("flaky")
        }
        fn capabilities(&self) -> &Capabilities {
            &self.caps
        }
        fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
            Some(&self.streaming)
        }
    }

    fn flaky() -> Flaky {
        Flaky {
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
                    max_requests: 100,
                    window_ms: 1000,
                    min_inter_request_delay_ms: 0,
                },
            },
            streaming: FlakyStreaming {
                fail_next: std::sync::atomic::AtomicBool::new(true),
            },
        }
    }

    #[tokio::test]
    async fn capacity_error_installs_cooldown_and_is_enforced() {
        let wrapped = BlacklistedProvider::new(Arc::new(flaky()), Duration::from_secs(1));
        let err = wrapped
            .as_streaming_provider()
            .unwrap()
            .subscribe_trades("AAPL")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderPlaneError::Capacity { .. }));

        let err2 = wrapped
            .as_streaming_provider()
            .unwrap()
            .subscribe_trades("AAPL")
            .await
            .unwrap_err();
        assert!(matches!(err2, ProviderPlaneError::TemporarilyBlacklisted { .. }));
        assert!(!wrapped.is_available(AvailabilityContext::default()).await);
    }
}
