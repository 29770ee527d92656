//! `pp` wires the provider registry, backfill scheduler, and failover
//! controller from `pp-core` into a single [`ProviderPlane`] handle.
//!
//! Overview
//! - Register vendor connectors once through [`ProviderPlaneBuilder`];
//!   selection, concurrency limits, and health evaluation are then handled
//!   by the registry, scheduler, and failover controller respectively.
//! - Streaming subscriptions are routed through a failover rule's currently
//!   active provider and transferred automatically when that provider
//!   degrades.
//! - Historical gaps are enqueued onto the scheduler and drained by a
//!   polling worker this crate owns; validated bars land on a caller-supplied
//!   sink.
//! - [`PlaneMetrics`] gives a single point-in-time snapshot across all three
//!   components for monitoring.
#![warn(missing_docs)]

pub mod metrics;
pub mod plane;

pub use metrics::{FailoverRuleSnapshot, PlaneMetrics};
pub use plane::{ProviderPlane, ProviderPlaneBuilder};

pub use pp_core::connector::{
    BackfillProvider, BarSink, DepthSink, FigiResolverProvider, Provider, QuoteSink,
    StreamingProvider, SymbolSearchProvider, TradeSink,
};
pub use pp_core::error::ProviderPlaneError;
pub use pp_core::failover::FailoverEvent;
pub use pp_core::types::{
    BackfillJob, BackfillOptions, BackfillRequest, DateRange, FailoverRule, Granularity,
    HistoricalBar, ProviderId, RuleId, SubscriptionKind,
};
pub use pp_types::ProviderPlaneConfig;
