//! Failover controller (C7): per-rule primary/backup health evaluation and
//! subscription transfer, ticked on a fixed interval.
//!
//! The controller owns no transport itself. Connectivity and quality signals
//! come from a caller-supplied [`HealthSignalSource`]; subscription transfer
//! on failover/recovery goes through a caller-supplied [`SubscriptionTransfer`].
//! This mirrors the sink/source seams used elsewhere in this crate
//! ([`crate::connector::StreamSinks`]) rather than reaching into a concrete
//! registry or connector type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pp_types::FailoverDefaults;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::stream::StreamHandle;
use crate::types::{FailoverRule, ProviderHealthState, ProviderId, RuleId};

/// Connectivity and (optionally) quality signals the controller evaluates
/// rules against. Implementations are expected to be cheap and non-blocking;
/// the controller awaits them sequentially per rule on every tick.
#[async_trait]
pub trait HealthSignalSource: Send + Sync {
    /// Whether `provider`'s streaming connection is currently up.
    async fn is_connected(&self, provider: ProviderId) -> bool;

    /// Data-quality score in `[0, 1]`, if the caller tracks one.
    async fn data_quality_score(&self, _provider: ProviderId) -> Option<f64> {
        None
    }

    /// Average event latency in milliseconds, if the caller tracks one.
    async fn avg_latency_ms(&self, _provider: ProviderId) -> Option<u64> {
        None
    }
}

/// Moves a rule's live subscriptions from one provider to another.
#[async_trait]
pub trait SubscriptionTransfer: Send + Sync {
    /// Subscribe `to` to every symbol currently routed to `from` under
    /// `rule`, without unsubscribing `from`. Callers may briefly see the same
    /// event published by both providers; deduplication by
    /// `(provider, symbol, sequence)` is the consumer's responsibility.
    async fn transfer(&self, rule: RuleId, from: ProviderId, to: ProviderId);

    /// Unsubscribe `from` once failback to `to` is confirmed. Symmetric
    /// counterpart to `transfer`, used only on recovery.
    async fn retract(&self, rule: RuleId, from: ProviderId);
}

/// Emitted when a rule's active provider changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    /// `rule` diverted from `from` to `to`.
    FailoverOccurred {
        /// Rule that triggered.
        rule: RuleId,
        /// Provider the rule was diverted away from.
        from: ProviderId,
        /// Provider the rule is now routed through.
        to: ProviderId,
    },
    /// `rule` recovered back onto its primary provider.
    ProviderRecovered {
        /// Rule that recovered.
        rule: RuleId,
        /// Provider (the rule's primary) now serving it again.
        provider: ProviderId,
    },
}

/// Periodic health evaluation and primary/backup failover for a set of
/// [`FailoverRule`]s.
pub struct FailoverController<H: HealthSignalSource, T: SubscriptionTransfer> {
    source: Arc<H>,
    transfer: Arc<T>,
    defaults: FailoverDefaults,
    rules: Mutex<HashMap<RuleId, FailoverRule>>,
    health: Mutex<HashMap<ProviderId, ProviderHealthState>>,
    next_rule_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<FailoverEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<FailoverEvent>>,
    execute_lock: AsyncMutex<()>,
}

impl<H: HealthSignalSource + 'static, T: SubscriptionTransfer + 'static> FailoverController<H, T> {
    /// Construct a controller with no rules registered yet.
    #[must_use]
    pub fn new(source: Arc<H>, transfer: Arc<T>, defaults: FailoverDefaults) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            source,
            transfer,
            defaults,
            rules: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            next_rule_id: AtomicU64::new(1),
            events_tx,
            events_rx: AsyncMutex::new(events_rx),
            execute_lock: AsyncMutex::new(()),
        }
    }

    /// Register a new rule, assigning it an id if `rule.id` is `RuleId(0)`.
    pub fn add_rule(&self, mut rule: FailoverRule) -> RuleId {
        if rule.id.0 == 0 {
            rule.id = RuleId(self.next_rule_id.fetch_add(1, AtomicOrdering::Relaxed));
        }
        let id = rule.id;
        self.rules.lock().expect("failover rules lock poisoned").insert(id, rule);
        id
    }

    /// Remove a rule. Returns the removed rule, if it existed.
    pub fn remove_rule(&self, rule_id: RuleId) -> Option<FailoverRule> {
        self.rules.lock().expect("failover rules lock poisoned").remove(&rule_id)
    }

    /// Record an externally-observed issue against `provider`.
    pub fn report_issue(&self, provider: ProviderId, kind: impl Into<String>, message: Option<String>) {
        self.health
            .lock()
            .expect("failover health lock poisoned")
            .entry(provider)
            .or_insert_with(|| ProviderHealthState::new(provider))
            .report_issue(Utc::now(), kind, message);
    }

    /// Record an externally-observed success against `provider`.
    pub fn report_success(&self, provider: ProviderId) {
        self.health
            .lock()
            .expect("failover health lock poisoned")
            .entry(provider)
            .or_insert_with(|| ProviderHealthState::new(provider))
            .report_success(Utc::now());
    }

    /// Snapshot a rule's current state.
    pub fn get_rule(&self, rule_id: RuleId) -> Option<FailoverRule> {
        self.rules.lock().expect("failover rules lock poisoned").get(&rule_id).cloned()
    }

    /// Force `rule_id`'s active provider to `target`, regardless of health.
    /// Still serialized against concurrent tick-driven failover/recovery.
    pub async fn force_failover(&self, rule_id: RuleId, target: ProviderId) {
        let _guard = self.execute_lock.lock().await;
        let from = {
            let mut rules = self.rules.lock().expect("failover rules lock poisoned");
            let Some(rule) = rules.get_mut(&rule_id) else {
                return;
            };
            let from = rule.current_active_provider;
            rule.in_failover_state = target != rule.primary;
            rule.current_active_provider = target;
            from
        };
        if from == target {
            return;
        }
        self.transfer.transfer(rule_id, from, target).await;
        let _ = self.events_tx.send(FailoverEvent::FailoverOccurred {
            rule: rule_id,
            from,
            to: target,
        });
    }

    /// Evaluate every rule once: pull connectivity for each rule's active
    /// provider, update its health counters, and fail over or recover as the
    /// ordered conditions dictate.
    pub async fn tick(&self) {
        let rule_ids: Vec<RuleId> = self
            .rules
            .lock()
            .expect("failover rules lock poisoned")
            .keys()
            .copied()
            .collect();
        for rule_id in rule_ids {
            self.evaluate_rule(rule_id).await;
        }
    }

    async fn evaluate_rule(&self, rule_id: RuleId) {
        let Some(rule) = self.get_rule(rule_id) else {
            return;
        };
        // Health is always pulled from the primary, never the provider
        // currently serving traffic: the controller must keep watching the
        // primary for recovery even while a backup is live.
        let active = rule.primary;
        let connected = self.source.is_connected(active).await;
        if connected {
            self.report_success(active);
        } else {
            self.report_issue(active, "disconnected", None);
        }

        let (consecutive_failures, consecutive_successes) = {
            let health = self.health.lock().expect("failover health lock poisoned");
            health
                .get(&active)
                .map_or((0, 0), |s| (s.consecutive_failures, s.consecutive_successes))
        };

        let quality = self.source.data_quality_score(active).await;
        let latency = self.source.avg_latency_ms(active).await;

        let triggered = !connected
            || consecutive_failures >= rule.failover_threshold
            || (rule.data_quality_threshold > 0.0
                && quality.map_or(false, |q| q < rule.data_quality_threshold))
            || (rule.max_latency_ms > 0 && latency.map_or(false, |l| l > rule.max_latency_ms));

        if triggered {
            if !rule.in_failover_state {
                for backup in rule.backups.clone() {
                    let backup_connected = self.source.is_connected(backup).await;
                    let backup_healthy = {
                        let health = self.health.lock().expect("failover health lock poisoned");
                        health.get(&backup).map_or(true, |s| s.consecutive_failures == 0)
                    };
                    if backup_connected && backup_healthy {
                        self.execute_failover(rule_id, backup).await;
                        break;
                    }
                }
            }
            return;
        }

        if rule.in_failover_state
            && self.defaults.auto_recover
            && consecutive_successes >= rule.recovery_threshold
        {
            self.execute_recovery(rule_id).await;
        }
    }

    async fn execute_failover(&self, rule_id: RuleId, target: ProviderId) {
        let _guard = self.execute_lock.lock().await;
        let from = {
            let mut rules = self.rules.lock().expect("failover rules lock poisoned");
            let Some(rule) = rules.get_mut(&rule_id) else {
                return;
            };
            if rule.in_failover_state {
                return;
            }
            let from = rule.current_active_provider;
            rule.in_failover_state = true;
            rule.current_active_provider = target;
            from
        };
        self.transfer.transfer(rule_id, from, target).await;
        let _ = self.events_tx.send(FailoverEvent::FailoverOccurred {
            rule: rule_id,
            from,
            to: target,
        });
    }

    async fn execute_recovery(&self, rule_id: RuleId) {
        let _guard = self.execute_lock.lock().await;
        let from = {
            let mut rules = self.rules.lock().expect("failover rules lock poisoned");
            let Some(rule) = rules.get_mut(&rule_id) else {
                return;
            };
            if !rule.in_failover_state {
                return;
            }
            let from = rule.current_active_provider;
            rule.in_failover_state = false;
            rule.current_active_provider = rule.primary;
            from
        };
        let to = self.get_rule(rule_id).map(|r| r.primary);
        let Some(to) = to else {
            return;
        };
        self.transfer.transfer(rule_id, from, to).await;
        self.transfer.retract(rule_id, from).await;
        let _ = self.events_tx.send(FailoverEvent::ProviderRecovered { rule: rule_id, provider: to });
    }

    /// Await the next failover/recovery event. Returns `None` once the
    /// controller (and every clone of its sender) has been dropped.
    pub async fn next_event(&self) -> Option<FailoverEvent> {
        self.events_rx.lock().await.recv().await
    }
}

impl<H: HealthSignalSource + 'static, T: SubscriptionTransfer + 'static> FailoverController<H, T> {
    /// Start ticking every `interval`. Returns a [`StreamHandle`] whose
    /// `stop`/`abort`/`Drop` behavior governs the background task's
    /// lifecycle, matching the `start()`/`stop()` pair other long-lived
    /// components in this crate expose.
    pub fn start(self: &Arc<Self>, interval: Duration) -> StreamHandle {
        let controller = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => return,
                    _ = timer.tick() => controller.tick().await,
                }
            }
        });
        StreamHandle::new(task, stop_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct ScriptedSource {
        primary_connected: AtomicBool,
    }

    #[async_trait]
    impl HealthSignalSource for ScriptedSource {
        async fn is_connected(&self, provider: ProviderId) -> bool {
            if provider == ProviderId::new("primary") {
                self.primary_connected.load(AtomicOrdering::Relaxed)
            } else {
                true
            }
        }
    }

    struct RecordingTransfer {
        events: Mutex<Vec<(RuleId, ProviderId, ProviderId, &'static str)>>,
    }

    #[async_trait]
    impl SubscriptionTransfer for RecordingTransfer {
        async fn transfer(&self, rule: RuleId, from: ProviderId, to: ProviderId) {
            self.events.lock().unwrap().push((rule, from, to, "transfer"));
        }
        async fn retract(&self, rule: RuleId, from: ProviderId) {
            self.events.lock().unwrap().push((rule, from, from, "retract"));
        }
    }

    fn rule() -> FailoverRule {
        FailoverRule {
            id: RuleId(1),
            primary: ProviderId::new("primary"),
            backups: vec![ProviderId::new("backup")],
            failover_threshold: 3,
            recovery_threshold: 2,
            data_quality_threshold: 0.0,
            max_latency_ms: 0,
            in_failover_state: false,
            current_active_provider: ProviderId::new("primary"),
        }
    }

    #[tokio::test]
    async fn tick_fails_over_after_threshold_and_recovers_after_reconnect() {
        let source = Arc::new(ScriptedSource {
            primary_connected: AtomicBool::new(false),
        });
        let transfer = Arc::new(RecordingTransfer { events: Mutex::new(Vec::new()) });
        let controller = FailoverController::new(
            Arc::clone(&source),
            Arc::clone(&transfer),
            FailoverDefaults {
                health_check_interval: Duration::from_secs(10),
                failover_threshold: 3,
                recovery_threshold: 2,
                auto_recover: true,
            },
        );
        controller.add_rule(rule());

        controller.tick().await;
        controller.tick().await;
        assert!(controller.get_rule(RuleId(1)).unwrap().current_active_provider == ProviderId::new("primary"));

        controller.tick().await;
        let after = controller.get_rule(RuleId(1)).unwrap();
        assert!(after.in_failover_state);
        assert_eq!(after.current_active_provider, ProviderId::new("backup"));
        let event = controller.next_event().await.unwrap();
        assert!(matches!(event, FailoverEvent::FailoverOccurred { .. }));

        source.primary_connected.store(true, AtomicOrdering::Relaxed);
        controller.tick().await;
        controller.tick().await;
        let recovered = controller.get_rule(RuleId(1)).unwrap();
        assert!(!recovered.in_failover_state);
        assert_eq!(recovered.current_active_provider, ProviderId::new("primary"));
        let event = controller.next_event().await.unwrap();
        assert!(matches!(event, FailoverEvent::ProviderRecovered { .. }));
    }

    #[tokio::test]
    async fn stays_failed_over_while_primary_remains_down_regardless_of_backup_health() {
        // Backup is always reported connected by `ScriptedSource`; if the
        // controller mistakenly watched the active (backup) provider instead
        // of the primary, this would recover immediately after failover.
        let source = Arc::new(ScriptedSource {
            primary_connected: AtomicBool::new(false),
        });
        let transfer = Arc::new(RecordingTransfer { events: Mutex::new(Vec::new()) });
        let controller = FailoverController::new(
            Arc::clone(&source),
            Arc::clone(&transfer),
            FailoverDefaults {
                health_check_interval: Duration::from_secs(10),
                failover_threshold: 3,
                recovery_threshold: 2,
                auto_recover: true,
            },
        );
        controller.add_rule(rule());

        for _ in 0..3 {
            controller.tick().await;
        }
        let after = controller.get_rule(RuleId(1)).unwrap();
        assert!(after.in_failover_state);
        assert_eq!(after.current_active_provider, ProviderId::new("backup"));
        let _ = controller.next_event().await.unwrap();

        for _ in 0..5 {
            controller.tick().await;
        }
        let still_failed_over = controller.get_rule(RuleId(1)).unwrap();
        assert!(still_failed_over.in_failover_state, "primary never recovered, so the rule must stay on backup");
        assert_eq!(still_failed_over.current_active_provider, ProviderId::new("backup"));
    }

    #[tokio::test]
    async fn force_failover_bypasses_health_checks() {
        let source = Arc::new(ScriptedSource {
            primary_connected: AtomicBool::new(true),
        });
        let transfer = Arc::new(RecordingTransfer { events: Mutex::new(Vec::new()) });
        let controller = FailoverController::new(source, transfer, FailoverDefaults::default());
        controller.add_rule(rule());

        controller.force_failover(RuleId(1), ProviderId::new("backup")).await;
        let after = controller.get_rule(RuleId(1)).unwrap();
        assert_eq!(after.current_active_provider, ProviderId::new("backup"));
        assert!(after.in_failover_state);
    }
}
