use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pp_core::{Capabilities, CapabilityMask, PrimaryKind, Provider, ProviderId, RateLimitProfile};
use pp_middleware::QuotaGatedProvider;
use pp_types::{QuotaConfig, QuotaConsumptionStrategy};
use proptest::prelude::*;

struct NoopProvider {
    id: ProviderId,
    caps: Capabilities,
}

#[async_trait]
impl Provider for NoopProvider {
    fn id(&self) -> ProviderId {
        self.id
    }
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
}

fn noop_provider() -> Arc<dyn Provider> {
    Arc::new(NoopProvider {
        id: ProviderId::new("quota-prop-stub"),
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Firing more concurrent admissions than the window allows never lets
    /// more than `limit` through within any `window`-long slice.
    #[test]
    fn admissions_in_any_window_never_exceed_the_configured_limit(
        limit in 1u64..6,
        extra in 1u64..6,
    ) {
        let window = Duration::from_millis(80);
        let total_calls = limit + extra;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let timestamps: Vec<Instant> = rt.block_on(async {
            let gated = Arc::new(QuotaGatedProvider::new(
                noop_provider(),
                QuotaConfig {
                    limit,
                    window,
                    min_inter_request_delay: Duration::ZERO,
                    cooldown_on_429: Duration::from_secs(1),
                    strategy: QuotaConsumptionStrategy::Unit,
                },
            ));

            let mut handles = Vec::new();
            for _ in 0..total_calls {
                let gated = Arc::clone(&gated);
                handles.push(tokio::spawn(async move {
                    gated.wait_for_slot().await;
                    Instant::now()
                }));
            }
            let mut out = Vec::new();
            for handle in handles {
                out.push(handle.await.unwrap());
            }
            out
        });

        let mut sorted = timestamps;
        sorted.sort();
        for (i, &t) in sorted.iter().enumerate() {
            let admitted_in_window = sorted[..=i]
                .iter()
                .filter(|&&earlier| t.saturating_duration_since(earlier) <= window)
                .count();
            prop_assert!(admitted_in_window as u64 <= limit);
        }
    }
}
