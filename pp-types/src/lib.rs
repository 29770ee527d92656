//! Shared data transfer objects and configuration primitives for the provider plane.
#![warn(missing_docs)]

mod capability;
mod config;
mod connector;
mod error;
mod middleware;
pub mod routing_policy;

pub use capability::{Capabilities, Capability, CapabilityMask, PrimaryKind, RateLimitProfile};
pub use config::{
    BackfillSchedulerConfig, BackoffConfig, DataSourcesConfig, FailoverDefaults, FigiResolverConfig,
    ProviderConfigEntry, ProviderPlaneConfig, QuotaConfig, QuotaConsumptionStrategy, QuotaState,
    ValidatorPreset,
};
pub use connector::ProviderKey;
pub use error::ProviderPlaneError;
pub use middleware::{MiddlewareLayer, MiddlewareStack};
pub use routing_policy::{
    Preference, RoutingContext, RoutingPolicy, RoutingPolicyBuilder, ScopeKey,
};
