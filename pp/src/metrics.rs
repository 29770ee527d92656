//! Point-in-time metrics snapshot for a [`crate::plane::ProviderPlane`],
//! aggregating the registry, scheduler, and failover state each already
//! tracks independently.

use pp_core::registry::RegistrySummary;
use pp_core::scheduler::SchedulerStatistics;
use pp_core::types::{ProviderId, RuleId};

/// One failover rule's current routing state, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FailoverRuleSnapshot {
    /// Rule identifier.
    pub rule_id: RuleId,
    /// The rule's configured primary.
    pub primary: ProviderId,
    /// Provider currently serving the rule's subscriptions.
    pub current_active_provider: ProviderId,
    /// Whether the rule is currently diverted away from its primary.
    pub in_failover_state: bool,
}

/// A combined snapshot of registry, backfill, and failover state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaneMetrics {
    /// Provider registration counts by state and capability (C5).
    pub registry: RegistrySummary,
    /// Backfill queue depth and lifetime counters (C6).
    pub backfill: SchedulerStatistics,
    /// Current routing state of every registered failover rule (C7).
    pub rules: Vec<FailoverRuleSnapshot>,
}
