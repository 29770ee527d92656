//! End-to-end coverage combining the registry, failover controller, and
//! backfill worker through a single [`ProviderPlane`], rather than each
//! component's own unit tests in isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pp::{BarSink, ProviderPlane, ProviderPlaneBuilder};
use pp_core::connector::{BackfillProvider, Provider, StreamSinks, StreamingProvider};
use pp_core::error::ProviderPlaneError;
use pp_core::types::{
    BackfillJob, BackfillOptions, Capabilities, CapabilityMask, DateRange, FailoverRule,
    Granularity, HistoricalBar, JobId, PrimaryKind, ProviderId, RateLimitProfile, RequestStatus,
    RuleId, SubscriptionId, SubscriptionKind,
};
use pp_types::ProviderPlaneConfig;

fn caps(primary: PrimaryKind, mask: CapabilityMask) -> Capabilities {
    Capabilities {
        primary_kind: primary,
        mask,
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
    }
}

struct FakeStreaming {
    id: ProviderId,
    caps: Capabilities,
    trade_subscriptions: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Provider for FakeStreaming {
    fn id(&self) -> ProviderId {
        self.id
    }
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
    fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
        Some(self)
    }
}

#[async_trait]
impl StreamingProvider for FakeStreaming {
    async fn connect(&self, _sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
        Ok(())
    }
    async fn subscribe_trades(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        self.trade_subscriptions.lock().unwrap().push(symbol.to_string());
        Ok(SubscriptionId(1))
    }
    async fn unsubscribe_trades(&self, _symbol: &str) -> Result<(), ProviderPlaneError> {
        Ok(())
    }
}

struct FakeBackfill {
    id: ProviderId,
    caps: Capabilities,
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for FakeBackfill {
    fn id(&self) -> ProviderId {
        self.id
    }
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
    fn as_backfill_provider(&self) -> Option<&dyn BackfillProvider> {
        Some(self)
    }
}

#[async_trait]
impl BackfillProvider for FakeBackfill {
    async fn fetch_bars(
        &self,
        symbol: &str,
        range: DateRange,
        _granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, ProviderPlaneError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        use rust_decimal::Decimal;
        Ok(vec![HistoricalBar {
            symbol: symbol.to_string(),
            session_date: range.from,
            open: Decimal::from(100),
            high: Decimal::from(101),
            low: Decimal::from(99),
            close: Decimal::from(100),
            volume: 1_000,
            source: "fake".to_string(),
            sequence_number: 0,
        }])
    }
}

struct CollectingSink {
    bars: Mutex<Vec<(String, usize)>>,
}

impl BarSink for CollectingSink {
    fn on_bars(&self, symbol: &str, bars: Vec<HistoricalBar>) {
        self.bars.lock().unwrap().push((symbol.to_string(), bars.len()));
    }
}

#[tokio::test]
async fn forced_failover_moves_subscriptions_to_the_new_active_provider() {
    let primary_subs = Arc::new(Mutex::new(Vec::new()));
    let backup_subs = Arc::new(Mutex::new(Vec::new()));
    let primary = Arc::new(FakeStreaming {
        id: ProviderId::new("primary"),
        caps: caps(PrimaryKind::Streaming, CapabilityMask::STREAM_TRADES),
        trade_subscriptions: Arc::clone(&primary_subs),
    });
    let backup = Arc::new(FakeStreaming {
        id: ProviderId::new("backup"),
        caps: caps(PrimaryKind::Streaming, CapabilityMask::STREAM_TRADES),
        trade_subscriptions: Arc::clone(&backup_subs),
    });
    let sink = Arc::new(CollectingSink { bars: Mutex::new(Vec::new()) });

    let plane = ProviderPlaneBuilder::new(ProviderPlaneConfig::default())
        .with_provider(primary, 0)
        .with_provider(backup, 1)
        .with_bar_sink(sink)
        .build()
        .unwrap();

    let rule_id = plane.add_failover_rule(FailoverRule {
        id: RuleId(0),
        primary: ProviderId::new("primary"),
        backups: vec![ProviderId::new("backup")],
        failover_threshold: 3,
        recovery_threshold: 3,
        data_quality_threshold: 0.0,
        max_latency_ms: 0,
        in_failover_state: false,
        current_active_provider: ProviderId::new("primary"),
    });

    plane
        .subscribe(rule_id, "AAPL", SubscriptionKind::Trade)
        .await
        .unwrap();
    assert_eq!(primary_subs.lock().unwrap().as_slice(), ["AAPL"]);

    plane.force_failover(rule_id, ProviderId::new("backup")).await;

    plane
        .subscribe(rule_id, "MSFT", SubscriptionKind::Trade)
        .await
        .unwrap();
    assert_eq!(backup_subs.lock().unwrap().as_slice(), ["AAPL", "MSFT"]);

    let metrics = plane.metrics();
    assert_eq!(metrics.rules[0].current_active_provider, ProviderId::new("backup"));
    assert!(metrics.rules[0].in_failover_state);
}

#[tokio::test]
async fn backfill_worker_drains_the_scheduler_and_publishes_validated_bars() {
    let sink = Arc::new(CollectingSink { bars: Mutex::new(Vec::new()) });
    let provider = Arc::new(FakeBackfill {
        id: ProviderId::new("yahoo"),
        caps: caps(PrimaryKind::Backfill, CapabilityMask::BACKFILL),
        calls: AtomicUsize::new(0),
    });

    let plane = Arc::new(
        ProviderPlaneBuilder::new(ProviderPlaneConfig::default())
            .with_provider(provider, 0)
            .with_bar_sink(Arc::clone(&sink) as Arc<dyn BarSink>)
            .build()
            .unwrap(),
    );

    let mut gaps = HashMap::new();
    gaps.insert(
        "AAPL".to_string(),
        vec![NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()],
    );
    let job = BackfillJob {
        id: JobId(1),
        granularity: Granularity::Daily,
        symbols: vec!["AAPL".to_string()],
        range: DateRange {
            from: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        },
        preferred_providers: vec![ProviderId::new("yahoo")],
        options: BackfillOptions::default(),
        progress: HashMap::new(),
    };
    plane.enqueue_backfill(&job, &gaps);

    let worker = plane.start_backfill_worker(Duration::from_millis(10));
    let completed = tokio::time::timeout(Duration::from_secs(2), plane.next_completed_backfill())
        .await
        .expect("worker did not complete the request in time")
        .expect("scheduler channel closed unexpectedly");
    worker.stop().await;

    assert_eq!(completed.status, RequestStatus::Completed);
    assert_eq!(sink.bars.lock().unwrap().as_slice(), [("AAPL".to_string(), 1)]);
    assert_eq!(plane.metrics().backfill.completed, 1);
}
