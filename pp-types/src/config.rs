//! Configuration types fed into the provider plane from an external loader.
//!
//! The core only defines the typed shape of the configuration record; it
//! does not read files or environment variables itself beyond the pure
//! credential-resolution helper below.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::routing_policy::RoutingPolicy;

/// Strategy for consuming units from a quota when handling requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum QuotaConsumptionStrategy {
    /// Each request deducts exactly one unit from the quota budget.
    #[default]
    Unit,
    /// The caller specifies a weight (units) to deduct per request.
    Weighted,
}

/// Configuration for the rate-limit governor's sliding window and cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum number of units that may be consumed within a single window.
    pub limit: u64,
    /// Duration of the sliding accounting window.
    pub window: Duration,
    /// Minimum delay enforced between any two admitted requests.
    pub min_inter_request_delay: Duration,
    /// Cooldown applied after a 429 response before admitting further requests.
    pub cooldown_on_429: Duration,
    /// Strategy for how requests consume units from the budget.
    pub strategy: QuotaConsumptionStrategy,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 1000,
            window: Duration::from_secs(60),
            min_inter_request_delay: Duration::from_millis(0),
            cooldown_on_429: Duration::from_secs(60),
            strategy: QuotaConsumptionStrategy::Unit,
        }
    }
}

/// Snapshot of a quota budget at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaState {
    /// Configured maximum units per window.
    pub limit: u64,
    /// Remaining units available in the current window.
    pub remaining: u64,
    /// Time remaining until the current window resets.
    pub reset_in: Duration,
    /// Time remaining until an active cooldown elapses, if any.
    pub cooldown_remaining: Option<Duration>,
}

/// Exponential backoff configuration for reconnecting streaming sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Minimum backoff delay in milliseconds.
    pub min_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Exponential factor to increase delay after each failure (>= 1).
    pub factor: u32,
    /// Random jitter percentage [0, 100] added to each delay.
    pub jitter_percent: u8,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 500,
            max_backoff_ms: 30_000,
            factor: 2,
            jitter_percent: 20,
        }
    }
}

/// Preset controlling which of the nine bar-validation checks are enforced
/// as errors versus warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ValidatorPreset {
    /// Balanced defaults documented in the bar validator design.
    #[default]
    Default,
    /// Every check that can be an error is an error; tight spike thresholds.
    Strict,
    /// Spike/gap checks are downgraded to warnings; only hard OHLC violations reject.
    Lenient,
}

/// Tunables for the backfill scheduler (C6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSchedulerConfig {
    /// Size, in days, of a single contiguous backfill request batch.
    pub batch_size_days: u32,
    /// Maximum retry attempts before a job is marked terminally failed.
    pub max_retries: u32,
    /// Maximum number of backfill requests in flight across all providers.
    pub max_concurrent_requests: u32,
    /// Maximum number of backfill requests in flight per provider.
    pub max_concurrent_per_provider: u32,
}

impl Default for BackfillSchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size_days: 30,
            max_retries: 3,
            max_concurrent_requests: 16,
            max_concurrent_per_provider: 4,
        }
    }
}

/// Default thresholds for the failover controller (C7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverDefaults {
    /// Health-check tick interval.
    pub health_check_interval: Duration,
    /// Consecutive reported issues on the primary before failing over.
    pub failover_threshold: u32,
    /// Consecutive reported successes on the primary before auto-recovering.
    pub recovery_threshold: u32,
    /// Whether recovery back to the primary happens automatically.
    pub auto_recover: bool,
}

impl Default for FailoverDefaults {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            failover_threshold: 3,
            recovery_threshold: 3,
            auto_recover: true,
        }
    }
}

/// Tunables for the FIGI resolver's HTTP client and cache (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FigiResolverConfig {
    /// Maximum number of cached resolutions held in memory.
    pub cache_capacity: u64,
    /// TTL applied to successful resolutions.
    pub positive_ttl: Duration,
    /// TTL applied to failed/negative resolutions.
    pub negative_ttl: Duration,
    /// Name of the environment variable holding the OpenFIGI API key.
    pub api_key_env_var: String,
}

impl Default for FigiResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            positive_ttl: Duration::from_secs(24 * 60 * 60),
            negative_ttl: Duration::from_secs(10 * 60),
            api_key_env_var: "OPENFIGI_API_KEY".to_string(),
        }
    }
}

/// Per-provider configuration record, keyed by provider id in
/// [`DataSourcesConfig::providers`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfigEntry {
    /// Whether the provider is active at startup.
    pub enabled: bool,
    /// Priority used to order providers for the same capability (lower wins).
    pub priority: i32,
    /// API key id, resolved via [`resolve_credential`] when absent.
    pub key_id: Option<String>,
    /// Secret key, resolved via [`resolve_credential`] when absent.
    pub secret_key: Option<String>,
    /// API key, resolved via [`resolve_credential`] when absent.
    pub api_key: Option<String>,
    /// Bearer token, resolved via [`resolve_credential`] when absent.
    pub token: Option<String>,
    /// Vendor-specific feed name (e.g. Alpaca's "iex"/"sip").
    pub feed: Option<String>,
    /// Route requests to the vendor's sandbox/paper environment.
    pub use_sandbox: bool,
    /// Subscribe to top-of-book quotes in addition to trades.
    pub subscribe_quotes: bool,
    /// Declared rate limit, requests per minute.
    pub rate_limit_per_minute: Option<u32>,
    /// Vendor-specific options not modeled explicitly above.
    pub extra_options: serde_json::Map<String, serde_json::Value>,
}

impl Default for ProviderConfigEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            key_id: None,
            secret_key: None,
            api_key: None,
            token: None,
            feed: None,
            use_sandbox: false,
            subscribe_quotes: false,
            rate_limit_per_minute: None,
            extra_options: serde_json::Map::new(),
        }
    }
}

/// Top-level record enumerating the active providers and failover defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourcesConfig {
    /// Per-vendor configuration, keyed by provider id string.
    pub providers: HashMap<String, ProviderConfigEntry>,
    /// Enable automatic failover (C7).
    pub enable_failover: bool,
    /// Failover health-check timeout, in seconds.
    pub failover_timeout_seconds: u64,
}

impl Default for DataSourcesConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            enable_failover: true,
            failover_timeout_seconds: 10,
        }
    }
}

/// Resolves a credential value using a two-tier environment lookup, with the
/// config-supplied value always taking precedence.
///
/// Lookup order: `config_value`, then `VENDOR__FIELD`, then `VENDOR_FIELD`.
/// `vendor` and `field` are upper-cased for the environment-variable names.
/// `lookup_env` is injected so this stays unit-testable without touching
/// real process environment state.
pub fn resolve_credential(
    vendor: &str,
    field: &str,
    config_value: Option<&str>,
    mut lookup_env: impl FnMut(&str) -> Option<String>,
) -> Option<String> {
    if let Some(v) = config_value {
        return Some(v.to_string());
    }
    let vendor = vendor.to_uppercase();
    let field = field.to_uppercase();
    lookup_env(&format!("{vendor}__{field}")).or_else(|| lookup_env(&format!("{vendor}_{field}")))
}

/// Global configuration for the provider plane orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPlaneConfig {
    /// Unified routing policy controlling provider ordering.
    pub routing_policy: RoutingPolicy,
    /// Active data sources and their per-provider settings.
    pub data_sources: DataSourcesConfig,
    /// Backoff used when reconnecting streaming sessions.
    pub backoff: BackoffConfig,
    /// Bar-validation preset (C3).
    pub bar_validation: ValidatorPreset,
    /// Backfill scheduler tunables (C6).
    pub backfill: BackfillSchedulerConfig,
    /// Failover controller defaults (C7).
    pub failover: FailoverDefaults,
    /// FIGI resolver tunables (C1).
    pub figi: FigiResolverConfig,
}

impl Default for ProviderPlaneConfig {
    fn default() -> Self {
        Self {
            routing_policy: RoutingPolicy::default(),
            data_sources: DataSourcesConfig::default(),
            backoff: BackoffConfig::default(),
            bar_validation: ValidatorPreset::default(),
            backfill: BackfillSchedulerConfig::default(),
            failover: FailoverDefaults::default(),
            figi: FigiResolverConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_value_wins_over_env() {
        let resolved = resolve_credential("alpaca", "api_key", Some("from-config"), |_| {
            Some("from-env".to_string())
        });
        assert_eq!(resolved.as_deref(), Some("from-config"));
    }

    #[test]
    fn double_underscore_form_preferred_over_legacy() {
        let resolved = resolve_credential("alpaca", "api_key", None, |key| match key {
            "ALPACA__API_KEY" => Some("preferred".to_string()),
            "ALPACA_API_KEY" => Some("legacy".to_string()),
            _ => None,
        });
        assert_eq!(resolved.as_deref(), Some("preferred"));
    }

    #[test]
    fn falls_back_to_legacy_form() {
        let resolved = resolve_credential("alpaca", "api_key", None, |key| match key {
            "ALPACA_API_KEY" => Some("legacy".to_string()),
            _ => None,
        });
        assert_eq!(resolved.as_deref(), Some("legacy"));
    }

    #[test]
    fn missing_everywhere_returns_none() {
        let resolved = resolve_credential("alpaca", "api_key", None, |_| None);
        assert!(resolved.is_none());
    }
}
