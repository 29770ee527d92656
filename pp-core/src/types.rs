//! Shared data model for the provider plane: registry records, subscriptions,
//! normalized market-data events, historical bars, and backfill/failover state.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use pp_types::{Capabilities, Capability, CapabilityMask, PrimaryKind, ProviderKey, RateLimitProfile};

/// Stable identifier for a registered provider (e.g. `"alpaca"`, `"polygon"`).
pub type ProviderId = ProviderKey;

/// A provider entry owned exclusively by the registry.
///
/// The concrete connector instance lives alongside this record in the
/// registry's internal map; `RegisteredProvider` itself carries only the
/// metadata needed for selection and introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredProvider {
    /// Stable provider identifier.
    pub id: ProviderId,
    /// What this provider can do.
    pub capabilities: Capabilities,
    /// Selection priority; lower is preferred.
    pub priority: i32,
    /// Whether the provider currently participates in selection.
    pub enabled: bool,
}

macro_rules! monotonic_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

monotonic_id!(SubscriptionId);
monotonic_id!(JobId);
monotonic_id!(RequestId);
monotonic_id!(RuleId);

/// The kind of data a subscription streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Trade prints.
    Trade,
    /// Top-of-book quotes.
    Quote,
    /// Order-book depth updates.
    Depth,
}

/// A live subscription owned by exactly one streaming client.
///
/// Invariant: at most one logical subscription exists per
/// `(provider, symbol, kind)`; re-subscribing returns the existing id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Monotonic id assigned by the owning client's subscription manager.
    pub id: SubscriptionId,
    /// Provider this subscription is routed through.
    pub provider: ProviderId,
    /// Canonical symbol.
    pub symbol: String,
    /// Stream kind.
    pub kind: SubscriptionKind,
}

/// Which side initiated a trade print, when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggressor {
    /// Buyer-initiated.
    Buy,
    /// Seller-initiated.
    Sell,
    /// Not reported by the vendor.
    Unknown,
}

/// Book side for a depth level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Bid side.
    Bid,
    /// Ask side.
    Ask,
}

/// Fields common to every normalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Event timestamp, UTC, nanosecond precision where the vendor provides it.
    pub timestamp: DateTime<Utc>,
    /// Canonical symbol.
    pub symbol: String,
    /// Vendor-assigned sequence number, when present.
    pub sequence: Option<u64>,
    /// Id of the streaming client instance that produced this event.
    pub stream_id: u64,
    /// Source venue tag (e.g. exchange code reported by the vendor).
    pub source_venue: String,
}

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    /// Shared event fields.
    pub meta: EventMeta,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Aggressor side, when known.
    pub aggressor: Aggressor,
}

/// A top-of-book quote update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteUpdate {
    /// Shared event fields.
    pub meta: EventMeta,
    /// Best bid price.
    pub bid_price: Decimal,
    /// Best ask price.
    pub ask_price: Decimal,
    /// Best bid size.
    pub bid_size: Decimal,
    /// Best ask size.
    pub ask_size: Decimal,
}

/// A single price/size level in a depth update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: Decimal,
    /// Level size.
    pub size: Decimal,
    /// Book side.
    pub side: Side,
}

/// An order-book depth update, up to the provider's advertised depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// Shared event fields.
    pub meta: EventMeta,
    /// Levels included in this update.
    pub levels: Vec<DepthLevel>,
}

/// A liveness heartbeat carrying no market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Shared event fields (symbol is typically empty for heartbeats).
    pub meta: EventMeta,
}

/// Tagged union of everything a streaming client can emit to its sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizedEvent {
    /// A trade print.
    Trade(TradeUpdate),
    /// A quote update.
    Quote(QuoteUpdate),
    /// A depth update.
    Depth(DepthUpdate),
    /// A heartbeat.
    Heartbeat(Heartbeat),
}

/// A single daily (or intraday) price bar.
///
/// Invariants (enforced by the bar validator, not by construction):
/// `low <= open, close <= high`; `low <= high`; `volume >= 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    /// Canonical symbol.
    pub symbol: String,
    /// Session date the bar covers.
    pub session_date: NaiveDate,
    /// Opening price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: u64,
    /// Provider that produced this bar.
    pub source: String,
    /// Vendor-assigned sequence number, for dedup/ordering.
    pub sequence_number: u64,
}

/// A [`HistoricalBar`] enriched with split/dividend adjustment fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustedBar {
    /// The unadjusted bar.
    pub bar: HistoricalBar,
    /// Split/dividend-adjusted open, when the provider supplies it.
    pub adjusted_open: Option<Decimal>,
    /// Split/dividend-adjusted high.
    pub adjusted_high: Option<Decimal>,
    /// Split/dividend-adjusted low.
    pub adjusted_low: Option<Decimal>,
    /// Split/dividend-adjusted close.
    pub adjusted_close: Option<Decimal>,
    /// Split/dividend-adjusted volume.
    pub adjusted_volume: Option<u64>,
    /// Cumulative split factor applied, if any.
    pub split_factor: Option<Decimal>,
    /// Cash dividend amount applied on this session, if any.
    pub dividend_amount: Option<Decimal>,
}

/// Bar granularity. Defaults to `Daily`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    /// One bar per trading session.
    #[default]
    Daily,
    /// One bar per hour.
    Hourly,
    /// One bar per minute.
    Minute,
}

/// An inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Range start, inclusive.
    pub from: NaiveDate,
    /// Range end, inclusive.
    pub to: NaiveDate,
}

/// Tunables for how a backfill job is split and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillOptions {
    /// Maximum width, in days, of any single generated request's date range.
    pub batch_size_days: u32,
    /// Maximum retry attempts per request.
    pub max_retries: u32,
    /// Base priority fed into the scheduler's priority formula (lower = sooner).
    pub priority: i32,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size_days: 30,
            max_retries: 3,
            priority: 100,
        }
    }
}

/// Per-symbol progress tracking within a [`BackfillJob`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolProgress {
    /// Total requests generated for this symbol.
    pub total_requests: u32,
    /// Requests that completed successfully.
    pub completed: u32,
    /// Requests that terminally failed.
    pub failed: u32,
    /// Session dates still missing bars.
    pub dates_to_fill: Vec<NaiveDate>,
}

/// A user-facing request to fill historical gaps for a set of symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    /// Job identifier.
    pub id: JobId,
    /// Bar granularity requested.
    pub granularity: Granularity,
    /// Symbols included in this job.
    pub symbols: Vec<String>,
    /// Overall date range to fill.
    pub range: DateRange,
    /// Providers to prefer, in order.
    pub preferred_providers: Vec<ProviderId>,
    /// Scheduling tunables.
    pub options: BackfillOptions,
    /// Per-symbol progress, keyed by symbol.
    pub progress: std::collections::HashMap<String, SymbolProgress>,
}

/// Lifecycle state of a single [`BackfillRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting in the scheduler's queue.
    Pending,
    /// Dispatched to a provider, awaiting completion.
    InProgress,
    /// Completed successfully.
    Completed,
    /// Terminally failed (non-retryable, or retries exhausted).
    Failed,
    /// Cancelled via its owning job being cancelled.
    Cancelled,
}

/// A single contiguous date-range fetch, the scheduler's unit of dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Owning job.
    pub job_id: JobId,
    /// Symbol this request fetches.
    pub symbol: String,
    /// Range start, inclusive.
    pub from: NaiveDate,
    /// Range end, inclusive.
    pub to: NaiveDate,
    /// Bar granularity.
    pub granularity: Granularity,
    /// Providers to try, in order.
    pub preferred_providers: Vec<ProviderId>,
    /// Provider the scheduler assigned this request to, once dispatched.
    pub assigned_provider: Option<ProviderId>,
    /// Scheduling priority; lower is sooner.
    pub priority: i32,
    /// Maximum retry attempts.
    pub max_retries: u32,
    /// Attempts made so far.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Dispatch time, once assigned.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time, once terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message, if the request failed.
    pub error: Option<String>,
    /// Bars retrieved by the last (or only) attempt.
    pub bars_retrieved: u32,
}

/// An ordered primary/backup failover policy for one logical data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRule {
    /// Rule identifier.
    pub id: RuleId,
    /// The provider normally active.
    pub primary: ProviderId,
    /// Backup providers, tried in order when the primary degrades.
    pub backups: Vec<ProviderId>,
    /// Consecutive failures on the primary before failing over.
    pub failover_threshold: u32,
    /// Consecutive successes on the primary before recovering, when `auto_recover`.
    pub recovery_threshold: u32,
    /// Data-quality score below which the primary is considered degraded; `0` disables the check.
    pub data_quality_threshold: f64,
    /// Average latency above which the primary is considered degraded; `0` disables the check.
    pub max_latency_ms: u64,
    /// Whether this rule is currently diverted away from `primary`.
    pub in_failover_state: bool,
    /// The provider currently serving this rule's subscriptions.
    pub current_active_provider: ProviderId,
}

/// A single observed issue recorded against a provider's health state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    /// When the issue was observed.
    pub at: DateTime<Utc>,
    /// Short machine-readable issue type (e.g. `"disconnected"`).
    pub kind: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

/// Rolling health counters for one provider, mutated only by the failover controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthState {
    /// Provider this state describes.
    pub provider: ProviderId,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Consecutive successes since the last failure.
    pub consecutive_successes: u32,
    /// Timestamp of the most recent issue, if any.
    pub last_issue_time: Option<DateTime<Utc>>,
    /// Timestamp of the most recent success, if any.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Most recent issues, newest last; capped at 20.
    pub recent_issues: VecDeque<HealthIssue>,
}

impl ProviderHealthState {
    const RING_CAPACITY: usize = 20;

    /// Construct a fresh, all-healthy state for `provider`.
    #[must_use]
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_issue_time: None,
            last_success_time: None,
            recent_issues: VecDeque::with_capacity(Self::RING_CAPACITY),
        }
    }

    /// Record an issue: bumps `consecutive_failures`, resets `consecutive_successes`,
    /// stamps `last_issue_time`, and pushes into the capped issue ring.
    pub fn report_issue(&mut self, at: DateTime<Utc>, kind: impl Into<String>, message: Option<String>) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_issue_time = Some(at);
        if self.recent_issues.len() == Self::RING_CAPACITY {
            self.recent_issues.pop_front();
        }
        self.recent_issues.push_back(HealthIssue {
            at,
            kind: kind.into(),
            message,
        });
    }

    /// Record a success: bumps `consecutive_successes`, resets `consecutive_failures`,
    /// stamps `last_success_time`.
    pub fn report_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success_time = Some(at);
    }
}
