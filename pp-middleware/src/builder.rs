//! Builder for composing providers with middleware layers.
//!
//! # Middleware Ordering Convention
//!
//! Middleware layers form an "onion" around the raw provider:
//!
//! ```text
//! User Request
//!     ↓
//! Outermost Middleware (Blacklist - checks first, handles errors last)
//!     ↓
//! Inner Middleware (Quota - enforces limits, translates errors)
//!     ↓
//! Raw Provider (e.g., Alpaca - makes actual API calls)
//! ```
//!
//! ## Storage vs Application Order
//!
//! The `layers` vector stores middleware in **outermost-first** order for intuitive
//! builder semantics (last added = outermost), but they are **applied in reverse**
//! during `build()` to construct the proper nesting.
//!
//! Example:
//! ```text
//! builder.with_quota(..).with_blacklist(..)
//!
//! Storage: [Blacklist, Quota]  (outermost first)
//! Applied:  Raw -> Quota -> Blacklist  (innermost to outermost)
//! Result:   Blacklist(Quota(Raw))
//! ```
//!
//! This convention matches [`MiddlewareStack`](pp_types::MiddlewareStack) where
//! `layers[0]` is the outermost layer.

use std::sync::Arc;
use std::time::Duration;

use pp_core::connector::Provider;
use pp_core::{
    Middleware, ProviderPlaneError,
    middleware::{MiddlewareDescriptor, ValidationContext},
};
use pp_types::{MiddlewareLayer, MiddlewareStack, QuotaConfig, QuotaConsumptionStrategy};
use serde_json::json;

/// Generic middleware builder for composing a provider with layered wrappers.
///
/// See [module-level documentation](self) for details on middleware ordering.
///
/// The builder stores middleware descriptors (which track type information) and validates
/// dependencies before building the final stack. This allows middleware to enforce ordering
/// requirements without hardcoding or footguns.
pub struct ProviderBuilder {
    raw: Arc<dyn Provider>,
    /// Middleware layers in outermost-first order.
    ///
    /// During `build()`, these are applied in reverse (innermost to outermost)
    /// to construct the proper nesting: `layers[0](layers[1](...(raw)))`.
    layers: Vec<MiddlewareDescriptor>,
}

impl ProviderBuilder {
    /// Create a new builder from a raw, unwrapped provider.
    #[must_use]
    pub fn new(raw: Arc<dyn Provider>) -> Self {
        Self {
            raw,
            layers: Vec::new(),
        }
    }

    /// Reorder layers to satisfy helper ordering policy:
    /// Blacklist (outermost) -> Quota -> others (stable among themselves).
    fn enforce_ordering(&mut self) {
        self.layers.sort_by_key(|d| match d.name() {
            "BlacklistedProvider" => 0,
            "QuotaGatedProvider" => 1,
            _ => 2,
        });
    }

    /// Internal: extract existing quota config from layers if present.
    fn existing_quota_config(&self) -> Option<QuotaConfig> {
        for desc in &self.layers {
            if desc.name() == "QuotaGatedProvider" {
                let cfg = desc.middleware().config_json();
                let defaults = QuotaConfig::default();
                let limit = cfg
                    .get("limit")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(defaults.limit);
                let window_ms = cfg
                    .get("window_ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or_else(|| {
                        u64::try_from(defaults.window.as_millis()).unwrap_or(u64::MAX)
                    });
                let min_delay_ms = cfg
                    .get("min_inter_request_delay_ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or_else(|| {
                        u64::try_from(defaults.min_inter_request_delay.as_millis())
                            .unwrap_or(u64::MAX)
                    });
                let cooldown_ms = cfg
                    .get("cooldown_on_429_ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or_else(|| {
                        u64::try_from(defaults.cooldown_on_429.as_millis()).unwrap_or(u64::MAX)
                    });
                let strategy = match cfg.get("strategy").and_then(|v| v.as_str()) {
                    Some("Weighted") => QuotaConsumptionStrategy::Weighted,
                    Some("Unit") => QuotaConsumptionStrategy::Unit,
                    _ => defaults.strategy,
                };
                return Some(QuotaConfig {
                    limit,
                    window: Duration::from_millis(window_ms),
                    min_inter_request_delay: Duration::from_millis(min_delay_ms),
                    cooldown_on_429: Duration::from_millis(cooldown_ms),
                    strategy,
                });
            }
        }
        None
    }

    /// Add or replace quota configuration.
    ///
    /// Adds quota middleware so it runs before the raw provider on the request
    /// path. If quota middleware already exists, it is removed and replaced.
    #[must_use]
    pub fn with_quota(mut self, cfg: &QuotaConfig) -> Self {
        self.layers.retain(|d| d.name() != "QuotaGatedProvider");
        self.layers.push(MiddlewareDescriptor::new(
            crate::quota::QuotaMiddleware::new(cfg.clone()),
        ));
        self.enforce_ordering();
        self
    }

    /// Remove quota if present.
    #[must_use]
    pub fn without_quota(mut self) -> Self {
        self.layers.retain(|d| d.name() != "QuotaGatedProvider");
        self
    }

    /// Add or replace blacklist configuration.
    ///
    /// Adds blacklist middleware at the outermost position so it checks
    /// blacklist state before any other middleware runs, and observes
    /// capacity errors from everything inside it.
    ///
    /// If blacklist middleware already exists, it is removed and replaced.
    #[must_use]
    pub fn with_blacklist(mut self, duration: Duration) -> Self {
        self.layers.retain(|d| d.name() != "BlacklistedProvider");
        self.layers.push(MiddlewareDescriptor::new(
            crate::blacklist::BlacklistMiddleware::new(duration),
        ));
        self.enforce_ordering();
        self
    }

    /// Remove blacklist if present.
    #[must_use]
    pub fn without_blacklist(mut self) -> Self {
        self.layers.retain(|d| d.name() != "BlacklistedProvider");
        self
    }

    /// Shortcut: set quota limit only (preserves existing window/strategy if already set).
    #[must_use]
    pub fn quota_limit(self, limit: u64) -> Self {
        let mut cfg = self.existing_quota_config().unwrap_or_default();
        cfg.limit = limit;
        self.with_quota(&cfg)
    }

    /// Shortcut: set window (preserves existing limit/strategy if already set).
    #[must_use]
    pub fn quota_window(self, window: Duration) -> Self {
        let mut cfg = self.existing_quota_config().unwrap_or_default();
        cfg.window = window;
        self.with_quota(&cfg)
    }

    /// Shortcut: set strategy (preserves existing limit/window if already set).
    #[must_use]
    pub fn quota_strategy(self, strategy: QuotaConsumptionStrategy) -> Self {
        let mut cfg = self.existing_quota_config().unwrap_or_default();
        cfg.strategy = strategy;
        self.with_quota(&cfg)
    }

    /// Export the current middleware stack configuration for inspection.
    ///
    /// Returns a [`MiddlewareStack`] that preserves the outermost-first ordering
    /// convention. The resulting stack can be serialized, stored, and later
    /// reconstructed with [`from_stack`](Self::from_stack).
    ///
    /// The raw provider is appended as the innermost "layer" for observability.
    #[must_use]
    pub fn to_stack(&self) -> MiddlewareStack {
        let mut stack = MiddlewareStack::new();
        for desc in &self.layers {
            stack.push_inner(MiddlewareLayer::new(
                desc.name(),
                desc.middleware().config_json(),
            ));
        }
        stack.push_inner(MiddlewareLayer::new(
            "RawProvider",
            json!({ "id": self.raw.id().as_str() }),
        ));
        stack
    }

    /// Construct a builder from a raw provider and an explicit stack.
    ///
    /// Reconstructs middleware layers from a serialized [`MiddlewareStack`],
    /// preserving the outermost-first ordering convention. Unknown middleware
    /// types are silently ignored (forward compatibility).
    ///
    /// This is the inverse of [`to_stack`](Self::to_stack).
    #[must_use]
    pub fn from_stack(raw: Arc<dyn Provider>, stack: &MiddlewareStack) -> Self {
        let mut layers: Vec<MiddlewareDescriptor> = Vec::new();
        for l in &stack.layers {
            match l.name.as_str() {
                "QuotaGatedProvider" => {
                    let limit = l
                        .config
                        .get("limit")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(1);
                    let window_ms = l
                        .config
                        .get("window_ms")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(60_000);
                    let min_delay_ms = l
                        .config
                        .get("min_inter_request_delay_ms")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0);
                    let cooldown_ms = l
                        .config
                        .get("cooldown_on_429_ms")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(60_000);
                    let strategy = match l.config.get("strategy").and_then(|v| v.as_str()) {
                        Some("Weighted") => QuotaConsumptionStrategy::Weighted,
                        _ => QuotaConsumptionStrategy::Unit,
                    };
                    let cfg = QuotaConfig {
                        limit,
                        window: Duration::from_millis(window_ms),
                        min_inter_request_delay: Duration::from_millis(min_delay_ms),
                        cooldown_on_429: Duration::from_millis(cooldown_ms),
                        strategy,
                    };
                    layers.push(MiddlewareDescriptor::new(
                        crate::quota::QuotaMiddleware::new(cfg),
                    ));
                }
                "BlacklistedProvider" => {
                    let dur_ms = l
                        .config
                        .get("default_duration_ms")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(300_000);
                    layers.push(MiddlewareDescriptor::new(
                        crate::blacklist::BlacklistMiddleware::new(Duration::from_millis(dur_ms)),
                    ));
                }
                _ => {}
            }
        }
        let mut builder = Self { raw, layers };
        builder.enforce_ordering();
        builder
    }

    /// Validate the middleware stack without building.
    ///
    /// Calls `validate()` on each middleware in the stack, allowing them to check
    /// for dependencies and ordering requirements. Returns an error if any middleware
    /// fails validation.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::InvalidMiddlewareStack`] if validation fails.
    pub fn validate(&self) -> Result<(), ProviderPlaneError> {
        // Validation order: iterate in reverse (innermost to outermost), matching
        // the application order, so middleware can check what's already "inside".
        for (idx, desc) in self.layers.iter().enumerate().rev() {
            let ctx = ValidationContext::new(&self.layers, idx);
            desc.middleware().validate(&ctx)?;
        }
        Ok(())
    }

    /// Build the wrapped provider according to the captured stack.
    ///
    /// First validates the middleware stack, then applies middleware layers in
    /// reverse order (innermost to outermost) to construct the proper nesting.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::InvalidMiddlewareStack`] if validation fails.
    pub fn build(self) -> Result<Arc<dyn Provider>, ProviderPlaneError> {
        self.validate()?;

        let mut acc: Arc<dyn Provider> = Arc::clone(&self.raw);
        for desc in self.layers.into_iter().rev() {
            acc = desc.into_middleware().apply(acc);
        }
        Ok(acc)
    }

    /// Add an arbitrary middleware layer at the outermost position.
    ///
    /// Use this for custom middleware that should wrap all other layers. The
    /// middleware type is tracked via `TypeId` to enable dependency checking.
    #[must_use]
    pub fn layer<M: Middleware + 'static>(mut self, layer: M) -> Self {
        self.layers.insert(0, MiddlewareDescriptor::new(layer));
        self
    }
}
