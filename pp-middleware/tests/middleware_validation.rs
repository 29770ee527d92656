use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pp_core::connector::Provider;
use pp_core::middleware::ValidationContext;
use pp_core::{Capabilities, CapabilityMask, Middleware, PrimaryKind, ProviderId, ProviderPlaneError, RateLimitProfile};
use pp_middleware::ProviderBuilder;
use pp_types::QuotaConfig;

struct NoopProvider {
    caps: Capabilities,
}

#[async_trait]
impl Provider for NoopProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new("raw")
    }
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
}

fn raw_provider() -> Arc<dyn Provider> {
    Arc::new(NoopProvider {
        caps: Capabilities {
            primary_kind: PrimaryKind::Backfill,
            mask: CapabilityMask::BACKFILL,
            max_depth_levels: None,
            supports_adjusted: false,
            supports_intraday: false,
            supports_historical_trades: false,
            supports_historical_quotes: false,
            supports_auctions: false,
            markets: vec!["US".to_string()],
            rate_limit: RateLimitProfile {
                max_requests: 100,
                window_ms: 60_000,
                min_inter_request_delay_ms: 0,
            },
        },
    })
}

/// Custom middleware that requires another middleware to be present anywhere
/// in the stack, exercising `ValidationContext::has_middleware`.
struct RequiresQuota;

impl Middleware for RequiresQuota {
    fn apply(self: Box<Self>, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        inner
    }

    fn name(&self) -> &'static str {
        "RequiresQuota"
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn validate(&self, ctx: &ValidationContext) -> Result<(), ProviderPlaneError> {
        if !ctx.has_middleware(TypeId::of::<pp_middleware::QuotaMiddleware>()) {
            return Err(ProviderPlaneError::InvalidMiddlewareStack {
                message: "RequiresQuota requires QuotaMiddleware to be present".to_string(),
            });
        }
        Ok(())
    }
}

#[test]
fn validation_fails_when_dependency_missing() {
    let result = ProviderBuilder::new(raw_provider()).layer(RequiresQuota).build();
    match result {
        Err(ProviderPlaneError::InvalidMiddlewareStack { message }) => {
            assert!(message.contains("QuotaMiddleware"));
        }
        _ => panic!("expected InvalidMiddlewareStack"),
    }
}

#[test]
fn validation_succeeds_when_dependency_present() {
    let result = ProviderBuilder::new(raw_provider())
        .with_quota(&QuotaConfig::default())
        .layer(RequiresQuota)
        .build();
    assert!(result.is_ok());
}

/// Custom middleware that inspects its own stack position, exercising
/// `has_middleware_outer`/`has_middleware_inner`.
struct PositionCheckingMiddleware;

impl Middleware for PositionCheckingMiddleware {
    fn apply(self: Box<Self>, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        inner
    }

    fn name(&self) -> &'static str {
        "PositionCheckingMiddleware"
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn validate(&self, ctx: &ValidationContext) -> Result<(), ProviderPlaneError> {
        let quota_outer = ctx.has_middleware_outer(TypeId::of::<pp_middleware::QuotaMiddleware>());
        let blacklist_outer = ctx.has_middleware_outer(TypeId::of::<pp_middleware::BlacklistMiddleware>());
        if !quota_outer || !blacklist_outer {
            return Err(ProviderPlaneError::InvalidMiddlewareStack {
                message: "expected quota and blacklist to be outer".to_string(),
            });
        }
        if ctx.has_middleware_inner(TypeId::of::<pp_middleware::QuotaMiddleware>()) {
            return Err(ProviderPlaneError::InvalidMiddlewareStack {
                message: "expected to be innermost".to_string(),
            });
        }
        Ok(())
    }
}

#[test]
fn validation_context_reports_correct_stack_position() {
    let result = ProviderBuilder::new(raw_provider())
        .layer(PositionCheckingMiddleware)
        .with_quota(&QuotaConfig::default())
        .with_blacklist(Duration::from_secs(60))
        .build();
    assert!(result.is_ok());
}
