//! The provider plane facade: binds the registry (C5), the backfill
//! scheduler (C6), and the failover controller (C7) into a single
//! subscribe/unsubscribe/backfill/metrics surface over whatever providers a
//! deployment registers.
//!
//! The scheduler is passive by design (§5): nothing here owns a dispatch
//! task unless [`ProviderPlane::start_backfill_worker`] is called, mirroring
//! the "callers pump it by polling" contract the scheduler itself documents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pp_core::connector::{AvailabilityContext, BarSink, Provider};
use pp_core::error::ProviderPlaneError;
use pp_core::failover::{FailoverController, FailoverEvent, HealthSignalSource, SubscriptionTransfer};
use pp_core::registry::ProviderRegistry;
use pp_core::scheduler::BackfillScheduler;
use pp_core::stream::StreamHandle;
use pp_core::types::{
    BackfillJob, BackfillRequest, FailoverRule, ProviderId, RequestId, RuleId, SubscriptionId,
    SubscriptionKind,
};
use pp_core::validate::{validate_bars, ValidationConfig};
use pp_types::ProviderPlaneConfig;

use crate::metrics::{FailoverRuleSnapshot, PlaneMetrics};

/// Bridges the registry's `is_available` hook and a per-rule subscription
/// ledger into the two seams [`FailoverController`] expects, rather than
/// inventing separate connectivity/transfer state.
struct PlaneHealth {
    registry: Arc<ProviderRegistry>,
    rule_subscriptions: Mutex<HashMap<RuleId, Vec<(String, SubscriptionKind)>>>,
}

impl PlaneHealth {
    fn record(&self, rule: RuleId, symbol: &str, kind: SubscriptionKind) {
        let mut ledger = self
            .rule_subscriptions
            .lock()
            .expect("plane subscription ledger poisoned");
        let entries = ledger.entry(rule).or_default();
        if !entries.iter().any(|(s, k)| s == symbol && *k == kind) {
            entries.push((symbol.to_string(), kind));
        }
    }

    fn forget(&self, rule: RuleId, symbol: &str, kind: SubscriptionKind) {
        if let Some(entries) = self
            .rule_subscriptions
            .lock()
            .expect("plane subscription ledger poisoned")
            .get_mut(&rule)
        {
            entries.retain(|(s, k)| !(s == symbol && *k == kind));
        }
    }
}

#[async_trait]
impl HealthSignalSource for PlaneHealth {
    async fn is_connected(&self, provider: ProviderId) -> bool {
        match self.registry.get_by_id(provider) {
            Some(p) => p.is_available(AvailabilityContext::default()).await,
            None => false,
        }
    }
}

/// Moves a rule's tracked `(symbol, kind)` pairs onto the new active
/// provider. Assumes one streaming provider serves at most one rule at a
/// time, so a rule's ledger entry is a complete description of what needs
/// to move.
#[async_trait]
impl SubscriptionTransfer for PlaneHealth {
    async fn transfer(&self, rule: RuleId, _from: ProviderId, to: ProviderId) {
        let subs = self
            .rule_subscriptions
            .lock()
            .expect("plane subscription ledger poisoned")
            .get(&rule)
            .cloned()
            .unwrap_or_default();
        let Some(target) = self.registry.get_by_id(to) else {
            return;
        };
        let Some(streaming) = target.as_streaming_provider() else {
            return;
        };
        for (symbol, kind) in subs {
            let result = match kind {
                SubscriptionKind::Trade => streaming.subscribe_trades(&symbol).await,
                SubscriptionKind::Quote => streaming.subscribe_quotes(&symbol).await,
                SubscriptionKind::Depth => streaming.subscribe_depth(&symbol).await,
            };
            #[cfg(feature = "tracing")]
            if let Err(_err) = result {
                tracing::warn!(
                    provider = to.as_str(),
                    symbol = %symbol,
                    error = ?_err,
                    "subscription transfer failed"
                );
            }
            #[cfg(not(feature = "tracing"))]
            let _ = result;
        }
    }

    async fn retract(&self, rule: RuleId, from: ProviderId) {
        let subs = self
            .rule_subscriptions
            .lock()
            .expect("plane subscription ledger poisoned")
            .get(&rule)
            .cloned()
            .unwrap_or_default();
        let Some(source) = self.registry.get_by_id(from) else {
            return;
        };
        let Some(streaming) = source.as_streaming_provider() else {
            return;
        };
        for (symbol, kind) in subs {
            let _ = match kind {
                SubscriptionKind::Trade => streaming.unsubscribe_trades(&symbol).await,
                SubscriptionKind::Quote => streaming.unsubscribe_quotes(&symbol).await,
                SubscriptionKind::Depth => streaming.unsubscribe_depth(&symbol).await,
            };
        }
    }
}

type PlaneFailover = FailoverController<PlaneHealth, PlaneHealth>;

/// Builds a [`ProviderPlane`] from a configuration record and the set of
/// providers a deployment wants registered.
pub struct ProviderPlaneBuilder {
    config: ProviderPlaneConfig,
    providers: Vec<(Arc<dyn Provider>, i32)>,
    bar_sink: Option<Arc<dyn BarSink>>,
}

impl ProviderPlaneBuilder {
    /// Start building from a configuration record.
    #[must_use]
    pub fn new(config: ProviderPlaneConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            bar_sink: None,
        }
    }

    /// Register a provider at construction time, at the given priority
    /// (lower is preferred). Providers can also be registered later through
    /// [`ProviderPlane::registry`].
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>, priority: i32) -> Self {
        self.providers.push((provider, priority));
        self
    }

    /// The sink every backfill worker tick publishes validated bars to.
    /// Required: [`build`](Self::build) fails without one.
    #[must_use]
    pub fn with_bar_sink(mut self, sink: Arc<dyn BarSink>) -> Self {
        self.bar_sink = Some(sink);
        self
    }

    /// Construct the plane, registering every provider supplied so far.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::Fatal`] if no bar sink was supplied, or
    /// if two supplied providers share an id.
    pub fn build(self) -> Result<ProviderPlane, ProviderPlaneError> {
        let bar_sink = self
            .bar_sink
            .ok_or_else(|| ProviderPlaneError::fatal("provider plane requires a bar sink"))?;

        let registry = Arc::new(ProviderRegistry::new());
        for (provider, priority) in self.providers {
            registry.register(provider, priority)?;
        }

        let health = Arc::new(PlaneHealth {
            registry: Arc::clone(&registry),
            rule_subscriptions: Mutex::new(HashMap::new()),
        });
        let failover = Arc::new(FailoverController::new(
            Arc::clone(&health),
            Arc::clone(&health),
            self.config.failover,
        ));
        let scheduler = Arc::new(BackfillScheduler::new(&self.config.backfill));
        let validation = ValidationConfig::from_preset(self.config.bar_validation);

        Ok(ProviderPlane {
            registry,
            scheduler,
            failover,
            health,
            validation,
            bar_sink,
            rule_ids: Mutex::new(Vec::new()),
        })
    }
}

/// The bound-together provider plane: one registry, one backfill scheduler,
/// one failover controller, operated through a single handle.
pub struct ProviderPlane {
    registry: Arc<ProviderRegistry>,
    scheduler: Arc<BackfillScheduler>,
    failover: Arc<PlaneFailover>,
    health: Arc<PlaneHealth>,
    validation: ValidationConfig,
    bar_sink: Arc<dyn BarSink>,
    rule_ids: Mutex<Vec<RuleId>>,
}

impl ProviderPlane {
    /// The underlying provider registry (C5), for direct registration,
    /// enable/disable, and lookup.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The underlying backfill scheduler (C6), for direct job enqueueing.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<BackfillScheduler> {
        &self.scheduler
    }

    /// Register a failover rule (C7). Returns the id it was assigned.
    pub fn add_failover_rule(&self, rule: FailoverRule) -> RuleId {
        let id = self.failover.add_rule(rule);
        self.rule_ids.lock().expect("plane rule-id list poisoned").push(id);
        id
    }

    /// Remove a failover rule. Its subscription ledger entry is dropped too.
    pub fn remove_failover_rule(&self, rule_id: RuleId) -> Option<FailoverRule> {
        self.rule_ids
            .lock()
            .expect("plane rule-id list poisoned")
            .retain(|id| *id != rule_id);
        self.health
            .rule_subscriptions
            .lock()
            .expect("plane subscription ledger poisoned")
            .remove(&rule_id);
        self.failover.remove_rule(rule_id)
    }

    /// Subscribe `symbol` for `kind` through `rule_id`'s currently active
    /// provider, and remember the subscription so a future failover or
    /// recovery carries it along.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::NotFound`] if `rule_id` is unknown, or
    /// [`ProviderPlaneError::Unsupported`] if the active provider has no
    /// streaming facet.
    pub async fn subscribe(
        &self,
        rule_id: RuleId,
        symbol: &str,
        kind: SubscriptionKind,
    ) -> Result<SubscriptionId, ProviderPlaneError> {
        let rule = self
            .failover
            .get_rule(rule_id)
            .ok_or_else(|| ProviderPlaneError::not_found(format!("failover rule {rule_id}")))?;
        let provider = self
            .registry
            .get_by_id(rule.current_active_provider)
            .ok_or_else(|| {
                ProviderPlaneError::not_found(format!(
                    "provider {}",
                    rule.current_active_provider.as_str()
                ))
            })?;
        let capability = match kind {
            SubscriptionKind::Trade => pp_core::types::Capability::StreamTrades,
            SubscriptionKind::Quote => pp_core::types::Capability::StreamQuotes,
            SubscriptionKind::Depth => pp_core::types::Capability::StreamDepth,
        };
        let streaming = provider
            .as_streaming_provider()
            .ok_or_else(|| ProviderPlaneError::unsupported(capability))?;
        let id = match kind {
            SubscriptionKind::Trade => streaming.subscribe_trades(symbol).await?,
            SubscriptionKind::Quote => streaming.subscribe_quotes(symbol).await?,
            SubscriptionKind::Depth => streaming.subscribe_depth(symbol).await?,
        };
        self.health.record(rule_id, symbol, kind);
        Ok(id)
    }

    /// Unsubscribe `symbol`/`kind` from `rule_id`'s currently active
    /// provider, and drop it from the failover subscription ledger.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::NotFound`] if `rule_id` is unknown.
    pub async fn unsubscribe(
        &self,
        rule_id: RuleId,
        symbol: &str,
        kind: SubscriptionKind,
    ) -> Result<(), ProviderPlaneError> {
        let rule = self
            .failover
            .get_rule(rule_id)
            .ok_or_else(|| ProviderPlaneError::not_found(format!("failover rule {rule_id}")))?;
        if let Some(provider) = self.registry.get_by_id(rule.current_active_provider)
            && let Some(streaming) = provider.as_streaming_provider()
        {
            let result = match kind {
                SubscriptionKind::Trade => streaming.unsubscribe_trades(symbol).await,
                SubscriptionKind::Quote => streaming.unsubscribe_quotes(symbol).await,
                SubscriptionKind::Depth => streaming.unsubscribe_depth(symbol).await,
            };
            result?;
        }
        self.health.forget(rule_id, symbol, kind);
        Ok(())
    }

    /// Enqueue a backfill job's gaps onto the scheduler (C6).
    pub fn enqueue_backfill(
        &self,
        job: &BackfillJob,
        gaps: &HashMap<String, Vec<NaiveDate>>,
    ) -> Vec<RequestId> {
        self.scheduler.enqueue_job(job, gaps)
    }

    /// Cancel every pending/in-flight request belonging to a backfill job.
    pub async fn cancel_backfill(&self, job_id: pp_core::types::JobId) {
        self.scheduler.cancel_job(job_id).await;
    }

    /// Await the next terminal backfill request (completed, failed, or
    /// cancelled).
    pub async fn next_completed_backfill(&self) -> Option<BackfillRequest> {
        self.scheduler.next_completed().await
    }

    /// Await the next failover/recovery event.
    pub async fn next_failover_event(&self) -> Option<FailoverEvent> {
        self.failover.next_event().await
    }

    /// Force `rule_id` onto `target`, bypassing health evaluation.
    pub async fn force_failover(&self, rule_id: RuleId, target: ProviderId) {
        self.failover.force_failover(rule_id, target).await;
    }

    /// Start the failover controller's periodic health-evaluation tick
    /// (C7). Stopping the returned handle stops ticking; it does not revert
    /// any failover already in effect.
    pub fn start_failover_ticker(self: &Arc<Self>, interval: Duration) -> StreamHandle {
        self.failover.start(interval)
    }

    /// Start a backfill worker: on every `poll_interval` tick, drain every
    /// currently-runnable request from the scheduler and dispatch it
    /// against its assigned provider, validating results before they reach
    /// the bar sink.
    ///
    /// The scheduler itself performs no I/O and owns no task (§5); this is
    /// the one place in the facade that turns its passive queue into active
    /// dispatch.
    pub fn start_backfill_worker(self: &Arc<Self>, poll_interval: Duration) -> StreamHandle {
        let plane = Arc::clone(self);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => return,
                    _ = timer.tick() => {
                        while let Some(request) = plane.scheduler.try_dequeue_runnable() {
                            let plane = Arc::clone(&plane);
                            tokio::spawn(async move { plane.run_one_backfill(request).await });
                        }
                    }
                }
            }
        });
        StreamHandle::new(task, stop_tx)
    }

    async fn run_one_backfill(&self, request: BackfillRequest) {
        let Some(provider_id) = request.assigned_provider else {
            self.scheduler
                .complete_request(
                    request.id,
                    false,
                    Some("request dispatched with no assigned provider".to_string()),
                    0,
                )
                .await;
            return;
        };
        let Some(provider) = self.registry.get_by_id(provider_id) else {
            self.scheduler
                .complete_request(request.id, false, Some("assigned provider not registered".to_string()), 0)
                .await;
            return;
        };
        let Some(backfill) = provider.as_backfill_provider() else {
            self.scheduler
                .complete_request(request.id, false, Some("assigned provider has no backfill facet".to_string()), 0)
                .await;
            return;
        };

        let range = pp_core::types::DateRange {
            from: request.from,
            to: request.to,
        };
        match backfill.fetch_bars(&request.symbol, range, request.granularity).await {
            Ok(bars) => {
                let report = validate_bars(bars, &self.validation);
                let retrieved = u32::try_from(report.valid.len()).unwrap_or(u32::MAX);
                if !report.valid.is_empty() {
                    self.bar_sink.on_bars(&request.symbol, report.valid);
                }
                self.scheduler.complete_request(request.id, true, None, retrieved).await;
            }
            Err(ProviderPlaneError::RateLimitExceeded { .. }) => {
                self.scheduler.record_provider_rate_limit_hit(provider_id, None);
                self.scheduler
                    .complete_request(request.id, false, Some("rate limit exceeded".to_string()), 0)
                    .await;
            }
            Err(ProviderPlaneError::Capacity { retry_after, .. }) => {
                self.scheduler.record_provider_rate_limit_hit(provider_id, retry_after);
                self.scheduler
                    .complete_request(request.id, false, Some("provider at capacity".to_string()), 0)
                    .await;
            }
            Err(err) => {
                self.scheduler.complete_request(request.id, false, Some(err.to_string()), 0).await;
            }
        }
    }

    /// A point-in-time snapshot of registry, backfill, and failover state.
    pub fn metrics(&self) -> PlaneMetrics {
        let rules = self
            .rule_ids
            .lock()
            .expect("plane rule-id list poisoned")
            .iter()
            .filter_map(|id| {
                self.failover.get_rule(*id).map(|rule| FailoverRuleSnapshot {
                    rule_id: *id,
                    primary: rule.primary,
                    current_active_provider: rule.current_active_provider,
                    in_failover_state: rule.in_failover_state,
                })
            })
            .collect();
        PlaneMetrics {
            registry: self.registry.get_summary(),
            backfill: self.scheduler.get_statistics(),
            rules,
        }
    }

    /// Dispose every registered provider and clear the registry.
    pub async fn dispose(&self) {
        self.registry.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pp_core::connector::{BackfillProvider, StreamSinks, StreamingProvider};
    use pp_core::types::{
        Capabilities, CapabilityMask, Granularity, HistoricalBar, PrimaryKind, RateLimitProfile,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackfill {
        id: ProviderId,
        caps: Capabilities,
        bars: Vec<HistoricalBar>,
    }

    #[async_trait]
    impl Provider for StubBackfill {
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
    impl BackfillProvider for StubBackfill {
        async fn fetch_bars(
            &self,
            symbol: &str,
            _range: pp_core::types::DateRange,
            _granularity: Granularity,
        ) -> Result<Vec<HistoricalBar>, ProviderPlaneError> {
            Ok(self
                .bars
                .iter()
                .cloned()
                .map(|mut b| {
                    b.symbol = symbol.to_string();
                    b
                })
                .collect())
        }
    }

    struct StubStreaming {
        id: ProviderId,
        caps: Capabilities,
        subscribed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for StubStreaming {
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
    impl StreamingProvider for StubStreaming {
        async fn connect(&self, _sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
        async fn subscribe_trades(&self, _symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
            self.subscribed.fetch_add(1, Ordering::Relaxed);
            Ok(SubscriptionId(1))
        }
        async fn unsubscribe_trades(&self, _symbol: &str) -> Result<(), ProviderPlaneError> {
            Ok(())
        }
    }

    struct RecordingSink {
        received: Mutex<Vec<(String, usize)>>,
    }
    impl BarSink for RecordingSink {
        fn on_bars(&self, symbol: &str, bars: Vec<HistoricalBar>) {
            self.received.lock().unwrap().push((symbol.to_string(), bars.len()));
        }
    }

    fn caps(mask: CapabilityMask) -> Capabilities {
        Capabilities {
            primary_kind: PrimaryKind::Backfill,
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

    fn bar(date: NaiveDate) -> HistoricalBar {
        use rust_decimal::Decimal;
        HistoricalBar {
            symbol: String::new(),
            session_date: date,
            open: Decimal::from(10),
            high: Decimal::from(12),
            low: Decimal::from(9),
            close: Decimal::from(11),
            volume: 100,
            source: "stub".to_string(),
            sequence_number: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_routes_through_rule_active_provider_and_records_ledger() {
        let subscribed = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(StubStreaming {
            id: ProviderId::new("alpaca"),
            caps: caps(CapabilityMask::STREAM_TRADES),
            subscribed: Arc::clone(&subscribed),
        });
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let plane = ProviderPlaneBuilder::new(ProviderPlaneConfig::default())
            .with_provider(provider, 0)
            .with_bar_sink(sink)
            .build()
            .unwrap();

        let rule_id = plane.add_failover_rule(FailoverRule {
            id: RuleId(0),
            primary: ProviderId::new("alpaca"),
            backups: vec![],
            failover_threshold: 3,
            recovery_threshold: 3,
            data_quality_threshold: 0.0,
            max_latency_ms: 0,
            in_failover_state: false,
            current_active_provider: ProviderId::new("alpaca"),
        });

        plane
            .subscribe(rule_id, "AAPL", SubscriptionKind::Trade)
            .await
            .unwrap();
        assert_eq!(subscribed.load(Ordering::Relaxed), 1);
        assert_eq!(
            plane
                .health
                .rule_subscriptions
                .lock()
                .unwrap()
                .get(&rule_id)
                .map(Vec::len),
            Some(1)
        );
    }

    #[tokio::test]
    async fn backfill_worker_dispatches_and_validates_then_reports_success() {
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let provider = Arc::new(StubBackfill {
            id: ProviderId::new("yahoo"),
            caps: caps(CapabilityMask::BACKFILL),
            bars: vec![bar(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())],
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
            vec![NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()],
        );
        let job = BackfillJob {
            id: pp_core::types::JobId(1),
            granularity: pp_core::types::Granularity::Daily,
            symbols: vec!["AAPL".to_string()],
            range: pp_core::types::DateRange {
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            },
            preferred_providers: vec![ProviderId::new("yahoo")],
            options: pp_core::types::BackfillOptions::default(),
            progress: HashMap::new(),
        };
        plane.enqueue_backfill(&job, &gaps);

        let request = plane.scheduler.try_dequeue_runnable().unwrap();
        plane.run_one_backfill(request).await;

        assert_eq!(sink.received.lock().unwrap().len(), 1);
        assert_eq!(plane.metrics().backfill.completed, 1);
    }

    #[test]
    fn build_fails_without_bar_sink() {
        let err = ProviderPlaneBuilder::new(ProviderPlaneConfig::default()).build();
        assert!(err.is_err());
    }

    #[test]
    fn metrics_reports_registered_rule_state() {
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        let plane = ProviderPlaneBuilder::new(ProviderPlaneConfig::default())
            .with_bar_sink(sink)
            .build()
            .unwrap();

        plane.add_failover_rule(FailoverRule {
            id: RuleId(0),
            primary: ProviderId::new("alpaca"),
            backups: vec![],
            failover_threshold: 3,
            recovery_threshold: 3,
            data_quality_threshold: 0.0,
            max_latency_ms: 0,
            in_failover_state: false,
            current_active_provider: ProviderId::new("alpaca"),
        });

        let metrics = plane.metrics();
        assert_eq!(metrics.rules.len(), 1);
        assert_eq!(metrics.rules[0].primary, ProviderId::new("alpaca"));
    }
}
