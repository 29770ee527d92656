//! pp-core
//!
//! Core types, traits, and utilities shared across the provider-plane workspace.
//!
//! - `types`: the shared data model (registry records, subscriptions, normalized
//!   events, historical bars, backfill/failover state).
//! - `connector`: the `Provider` trait and its capability provider traits.
//! - `middleware`: generic composition of connector-wrapping middleware layers.
//! - `stream`: the `StreamHandle` abstraction for long-lived streaming tasks.
//! - `streaming`: the streaming-client state-machine reducer and subscription bookkeeping.
//! - `validate`: the pure bar-validation pipeline.
//! - `registry`: the provider registry.
//! - `scheduler`: the priority-ordered backfill dispatch queue.
//! - `failover`: the primary/backup health evaluation and failover controller.
#![warn(missing_docs)]

/// Provider capability traits and the primary `Provider` interface.
pub mod connector;
/// Core error type shared by every provider-plane component.
pub mod error;
/// Primary/backup health evaluation and automatic failover.
pub mod failover;
/// Generic middleware-stack composition and validation.
pub mod middleware;
/// The provider registry: registration, lookup by capability, and disposal.
pub mod registry;
/// Priority-ordered backfill request dispatch with bounded concurrency.
pub mod scheduler;
/// Internal stream utilities used by `StreamHandle` and tests.
pub mod stream;
/// The streaming-client state machine: connection reducer and subscription bookkeeping.
pub mod streaming;
/// The shared data model: registry, subscription, and event types.
pub mod types;
/// Pure, synchronous historical-bar validation.
pub mod validate;

pub use connector::Provider;
pub use error::ProviderPlaneError;
pub use failover::FailoverController;
pub use middleware::Middleware;
pub use registry::ProviderRegistry;
pub use scheduler::BackfillScheduler;
pub use stream::StreamHandle;
pub use types::*;
