use core::fmt;
use serde::{Deserialize, Serialize};

/// Capability labels used for registry queries, routing, errors, and telemetry.
///
/// These map one-to-one with the operations a provider may support and allow
/// consistent `Display` formatting and exhaustive handling as new capabilities
/// are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Capability {
    /// Real-time trade tape streaming.
    StreamTrades,
    /// Real-time top-of-book quote streaming.
    StreamQuotes,
    /// Real-time L2 depth streaming.
    StreamDepth,
    /// Historical OHLCV bar backfill.
    Backfill,
    /// Historical bars adjusted for splits/dividends.
    BackfillAdjusted,
    /// Ticker/company free-text search.
    SymbolSearch,
    /// FIGI/ISIN/CUSIP identifier resolution.
    FigiResolve,
}

impl Capability {
    /// Stable, kebab-case identifier for logs/errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StreamTrades => "stream-trades",
            Self::StreamQuotes => "stream-quotes",
            Self::StreamDepth => "stream-depth",
            Self::Backfill => "backfill",
            Self::BackfillAdjusted => "backfill-adjusted",
            Self::SymbolSearch => "symbol-search",
            Self::FigiResolve => "figi-resolve",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Compact bitset form of [`Capability`] carried on [`Capabilities`] records,
    /// so `getByCapability` predicates can test support without an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityMask: u16 {
        /// See [`Capability::StreamTrades`].
        const STREAM_TRADES = 1 << 0;
        /// See [`Capability::StreamQuotes`].
        const STREAM_QUOTES = 1 << 1;
        /// See [`Capability::StreamDepth`].
        const STREAM_DEPTH = 1 << 2;
        /// See [`Capability::Backfill`].
        const BACKFILL = 1 << 3;
        /// See [`Capability::BackfillAdjusted`].
        const BACKFILL_ADJUSTED = 1 << 4;
        /// See [`Capability::SymbolSearch`].
        const SYMBOL_SEARCH = 1 << 5;
        /// See [`Capability::FigiResolve`].
        const FIGI_RESOLVE = 1 << 6;
    }
}

impl CapabilityMask {
    /// Returns true if the mask includes `cap`.
    #[must_use]
    pub const fn supports(self, cap: Capability) -> bool {
        self.contains(Self::from_capability(cap))
    }

    /// Maps a single [`Capability`] to its bit.
    #[must_use]
    pub const fn from_capability(cap: Capability) -> Self {
        match cap {
            Capability::StreamTrades => Self::STREAM_TRADES,
            Capability::StreamQuotes => Self::STREAM_QUOTES,
            Capability::StreamDepth => Self::STREAM_DEPTH,
            Capability::Backfill => Self::BACKFILL,
            Capability::BackfillAdjusted => Self::BACKFILL_ADJUSTED,
            Capability::SymbolSearch => Self::SYMBOL_SEARCH,
            Capability::FigiResolve => Self::FIGI_RESOLVE,
        }
    }
}

/// The primary role a provider plays, used as a coarse tie-breaker when
/// several providers support an overlapping set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PrimaryKind {
    /// Primarily a streaming vendor.
    Streaming,
    /// Primarily a historical-backfill vendor.
    Backfill,
    /// Primarily a symbol-search / reference-data vendor.
    SymbolSearch,
    /// Offers both streaming and backfill at meaningful quality.
    Hybrid,
}

/// Declared rate-limit envelope for a provider, consumed by the registry and
/// scheduler when choosing among otherwise-equal providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitProfile {
    /// Maximum requests allowed per `window_ms`.
    pub max_requests: u32,
    /// Window duration in milliseconds.
    pub window_ms: u64,
    /// Minimum delay between admitted requests, in milliseconds.
    pub min_inter_request_delay_ms: u64,
}

/// What a provider can do. Built once at registration time and never
/// mutated; `mask` is the fast-path query surface for `getByCapability`,
/// the remaining fields carry descriptive detail used to break ties between
/// providers that both advertise a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Primary role.
    pub primary_kind: PrimaryKind,
    /// Supported capability bitset.
    pub mask: CapabilityMask,
    /// Maximum depth levels offered by `StreamDepth`, if supported.
    pub max_depth_levels: Option<u16>,
    /// Supports split/dividend-adjusted historical bars.
    pub supports_adjusted: bool,
    /// Supports historical intraday (sub-daily) granularity.
    pub supports_intraday: bool,
    /// Supports historical trade-level (tick) backfill.
    pub supports_historical_trades: bool,
    /// Supports historical quote-level backfill.
    pub supports_historical_quotes: bool,
    /// Supports auction print data.
    pub supports_auctions: bool,
    /// Market codes this provider covers (e.g. "US", "UK").
    pub markets: Vec<String>,
    /// Declared rate-limit envelope.
    pub rate_limit: RateLimitProfile,
}

impl Capabilities {
    /// True if `mask` includes `cap`.
    #[must_use]
    pub const fn supports(&self, cap: Capability) -> bool {
        self.mask.supports(cap)
    }
}
