//! The `Provider` trait: a single capability-polymorphic abstraction over
//! every vendor integration in the provider plane.
//!
//! Rather than testing a connector's concrete type, callers query it by
//! capability: `provider.as_streaming_provider()`,
//! `provider.as_backfill_provider()`, and so on each return `None` when the
//! underlying vendor doesn't implement that facet. This collapses what would
//! otherwise be three separate registries (streaming clients, backfill
//! clients, symbol-search clients) into one.

use async_trait::async_trait;

use crate::error::ProviderPlaneError;
use crate::types::{
    AdjustedBar, Capabilities, DateRange, Granularity, HistoricalBar, ProviderId, SubscriptionId,
};

/// Receives normalized trade prints. Implementations must be non-blocking.
pub trait TradeSink: Send + Sync {
    /// Handle one trade event.
    fn on_trade(&self, event: crate::types::TradeUpdate);
}

/// Receives normalized quote updates. Implementations must be non-blocking.
pub trait QuoteSink: Send + Sync {
    /// Handle one quote event.
    fn on_quote(&self, event: crate::types::QuoteUpdate);
}

/// Receives normalized depth updates. Implementations must be non-blocking.
pub trait DepthSink: Send + Sync {
    /// Handle one depth event.
    fn on_depth(&self, event: crate::types::DepthUpdate);
}

/// Receives validated historical bars produced by a completed backfill
/// request. Implementations must be non-blocking.
pub trait BarSink: Send + Sync {
    /// Handle a batch of unadjusted bars for `symbol`, already passed through
    /// bar validation.
    fn on_bars(&self, symbol: &str, bars: Vec<HistoricalBar>);

    /// Handle a batch of adjusted bars for `symbol`. Default drops them,
    /// since not every sink distinguishes adjusted from unadjusted series.
    fn on_adjusted_bars(&self, symbol: &str, bars: Vec<AdjustedBar>) {
        let _ = (symbol, bars);
    }
}

/// The set of sinks a streaming provider publishes normalized events to.
#[derive(Clone)]
pub struct StreamSinks {
    /// Trade sink.
    pub trades: std::sync::Arc<dyn TradeSink>,
    /// Quote sink.
    pub quotes: std::sync::Arc<dyn QuoteSink>,
    /// Depth sink.
    pub depth: std::sync::Arc<dyn DepthSink>,
}

/// One row of a symbol-search result.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SymbolSearchResult {
    /// Vendor-native symbol.
    pub symbol: String,
    /// Display name, when available.
    pub name: Option<String>,
    /// Exchange code, when available.
    pub exchange: Option<String>,
    /// Vendor-reported security type (equity, etf, ...).
    pub security_type: Option<String>,
}

/// A single OpenFIGI-style identifier mapping.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FigiMapping {
    /// Primary FIGI.
    pub figi: String,
    /// Composite FIGI, when distinct from `figi`.
    pub composite_figi: Option<String>,
    /// Security type as reported by the mapping service.
    pub security_type: Option<String>,
    /// Market sector description.
    pub market_sector: Option<String>,
    /// Ticker the mapping was resolved for.
    pub ticker: Option<String>,
    /// Security name.
    pub name: Option<String>,
    /// Exchange code.
    pub exchange_code: Option<String>,
}

/// A resolved identifier to pass into batch FIGI lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerLookup {
    /// Ticker symbol.
    pub ticker: String,
    /// Exchange code, if known.
    pub exchange: Option<String>,
    /// Market sector description, if known.
    pub market_sector: Option<String>,
}

/// Per-vendor streaming access: connect/disconnect and subscription control.
///
/// See the streaming-client state machine in [`crate::streaming`] for the
/// lifecycle that implementations are expected to drive.
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// Open the transport and authenticate, wiring future events to `sinks`.
    async fn connect(&self, sinks: StreamSinks) -> Result<(), ProviderPlaneError>;

    /// Close the transport. Idempotent.
    async fn disconnect(&self) -> Result<(), ProviderPlaneError>;

    /// Subscribe to trade prints for `symbol`; returns the (possibly
    /// pre-existing) subscription id.
    async fn subscribe_trades(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError>;

    /// Remove a trade subscription for `symbol`.
    async fn unsubscribe_trades(&self, symbol: &str) -> Result<(), ProviderPlaneError>;

    /// Subscribe to top-of-book quotes for `symbol`, if the vendor supports it.
    async fn subscribe_quotes(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        let _ = symbol;
        Err(ProviderPlaneError::unsupported(
            crate::types::Capability::StreamQuotes,
        ))
    }

    /// Remove a quote subscription for `symbol`.
    async fn unsubscribe_quotes(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let _ = symbol;
        Err(ProviderPlaneError::unsupported(
            crate::types::Capability::StreamQuotes,
        ))
    }

    /// Subscribe to order-book depth for `symbol`, if the vendor supports it.
    async fn subscribe_depth(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        let _ = symbol;
        Err(ProviderPlaneError::unsupported(
            crate::types::Capability::StreamDepth,
        ))
    }

    /// Remove a depth subscription for `symbol`.
    async fn unsubscribe_depth(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        let _ = symbol;
        Err(ProviderPlaneError::unsupported(
            crate::types::Capability::StreamDepth,
        ))
    }
}

/// Historical bar retrieval, with optional split/dividend adjustment.
#[async_trait]
pub trait BackfillProvider: Send + Sync {
    /// Fetch unadjusted bars for `symbol` over `range` at `granularity`.
    async fn fetch_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, ProviderPlaneError>;

    /// Fetch split/dividend-adjusted bars, when supported.
    async fn fetch_adjusted_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<AdjustedBar>, ProviderPlaneError> {
        let _ = (symbol, range, granularity);
        Err(ProviderPlaneError::unsupported(
            crate::types::Capability::BackfillAdjusted,
        ))
    }
}

/// Free-text symbol/instrument search.
#[async_trait]
pub trait SymbolSearchProvider: Send + Sync {
    /// Search for symbols matching `query`.
    async fn search(&self, query: &str) -> Result<Vec<SymbolSearchResult>, ProviderPlaneError>;
}

/// OpenFIGI-style identifier resolution.
#[async_trait]
pub trait FigiResolverProvider: Send + Sync {
    /// Resolve a ticker (optionally scoped by exchange/market sector) to FIGI mappings.
    async fn lookup_by_ticker(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        market_sector: Option<&str>,
    ) -> Result<Vec<FigiMapping>, ProviderPlaneError>;

    /// Resolve an ISIN to FIGI mappings.
    async fn lookup_by_isin(&self, isin: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError>;

    /// Resolve a CUSIP to FIGI mappings.
    async fn lookup_by_cusip(&self, cusip: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError>;

    /// Resolve a SEDOL to FIGI mappings.
    async fn lookup_by_sedol(&self, sedol: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError>;

    /// Resolve a batch of tickers (at most 100 per call) in one round trip.
    async fn lookup_tickers_batch(
        &self,
        tickers: &[TickerLookup],
    ) -> Result<Vec<Vec<FigiMapping>>, ProviderPlaneError>;
}

/// A lightweight view of why a provider might be unavailable for a given
/// request, passed to [`Provider::is_available`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityContext<'a> {
    /// Symbol the caller wants to act on, if request-scoped.
    pub symbol: Option<&'a str>,
}

/// Single capability-polymorphic abstraction over every vendor integration.
///
/// Implementations hold whatever per-vendor transport/credential state they
/// need and expose it only through the `as_*_provider` accessors their
/// `Capabilities` advertise.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, unique across the registry.
    fn id(&self) -> ProviderId;

    /// Static description of what this provider can do.
    fn capabilities(&self) -> &Capabilities;

    /// Streaming facet, if this provider implements one.
    fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
        None
    }

    /// Backfill facet, if this provider implements one.
    fn as_backfill_provider(&self) -> Option<&dyn BackfillProvider> {
        None
    }

    /// Symbol-search facet, if this provider implements one.
    fn as_symbol_search_provider(&self) -> Option<&dyn SymbolSearchProvider> {
        None
    }

    /// FIGI-resolver facet, if this provider implements one.
    fn as_figi_resolver_provider(&self) -> Option<&dyn FigiResolverProvider> {
        None
    }

    /// Whether this provider can currently serve `ctx`. Used by the registry's
    /// `getBest*` selection; errors are treated as "not available".
    async fn is_available(&self, _ctx: AvailabilityContext<'_>) -> bool {
        true
    }

    /// Release any held resources (connections, background tasks). Disposal
    /// errors are swallowed by the registry so other providers still dispose.
    async fn dispose(&self) -> Result<(), ProviderPlaneError> {
        Ok(())
    }
}
