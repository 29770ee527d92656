//! Provider registry (C5): registration, enable/disable, capability lookup,
//! and disposal for the set of providers a deployment has wired up.
//!
//! Operations lock their `RwLock<HashMap<..>>`/`RwLock<Option<RoutingPolicy>>`
//! for the duration of a read/write only; any `async` work (`is_available`,
//! `dispose`) happens after the relevant `Arc<dyn Provider>` has been cloned
//! out and the lock dropped, so no lock is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::connector::{AvailabilityContext, BackfillProvider, Provider, SymbolSearchProvider};
use crate::error::ProviderPlaneError;
use crate::types::{Capability, ProviderId};
use pp_types::{ProviderKey, RoutingContext, RoutingPolicy};

struct Entry {
    provider: Arc<dyn Provider>,
    priority: i32,
    enabled: bool,
}

/// A point-in-time count of registered providers, by state and capability.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistrySummary {
    /// Total providers registered, enabled or not.
    pub total: usize,
    /// Providers currently enabled.
    pub enabled: usize,
    /// Providers currently disabled.
    pub disabled: usize,
    /// Count of enabled providers supporting each capability, keyed by
    /// [`Capability::as_str`].
    pub by_capability: HashMap<&'static str, usize>,
}

/// A snapshot of one registered provider's metadata, independent of its
/// concrete connector implementation.
#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    /// Stable identifier.
    pub id: ProviderId,
    /// Selection priority; lower is preferred.
    pub priority: i32,
    /// Whether the provider currently participates in selection.
    pub enabled: bool,
}

/// Thread-safe registry of `Provider` instances, queryable by id or capability.
///
/// Ids are unique: registering a second provider under an id already present
/// fails rather than silently replacing the first. Disabled providers are
/// excluded from [`get_by_capability`](Self::get_by_capability) and
/// `get_best_*` selection but remain visible through
/// [`get_all`](Self::get_all).
pub struct ProviderRegistry {
    entries: RwLock<HashMap<ProviderId, Entry>>,
    routing_policy: RwLock<Option<RoutingPolicy>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            routing_policy: RwLock::new(None),
        }
    }

    /// Install a routing policy that reorders `get_best_*` selection on top
    /// of plain `priority`. Rejects the policy if it references a provider
    /// key not currently registered.
    ///
    /// # Errors
    /// Returns [`ProviderPlaneError::Fatal`] naming the unknown provider keys.
    pub fn install_routing_policy(&self, mut policy: RoutingPolicy) -> Result<(), ProviderPlaneError> {
        let known: std::collections::HashSet<&'static str> = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries.keys().map(|id| id.as_str()).collect()
        };
        let unknown = policy.providers.normalize_and_collect_unknown(&known);
        if !unknown.is_empty() {
            return Err(ProviderPlaneError::fatal(format!(
                "routing policy references unregistered providers: {unknown:?}"
            )));
        }
        *self.routing_policy.write().expect("registry lock poisoned") = Some(policy);
        Ok(())
    }

    /// Remove any installed routing policy, reverting selection to plain
    /// `priority` ordering.
    pub fn clear_routing_policy(&self) {
        *self.routing_policy.write().expect("registry lock poisoned") = None;
    }

    /// Register `provider` at `priority` (lower is preferred). Registering a
    /// second provider under an id already present is a no-op: the first
    /// registration stands and this call simply returns `Ok(())`.
    ///
    /// # Errors
    /// Currently infallible; returns `Result` to leave room for future
    /// rejection cases without breaking the call signature.
    pub fn register(&self, provider: Arc<dyn Provider>, priority: i32) -> Result<(), ProviderPlaneError> {
        let id = provider.id();
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&id) {
            #[cfg(feature = "tracing")]
            tracing::debug!(provider = id.as_str(), "register called with already-registered id, ignoring");
            return Ok(());
        }
        entries.insert(
            id,
            Entry {
                provider,
                priority,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Remove a provider from the registry without disposing it. Returns the
    /// removed instance, if it was present.
    pub fn unregister(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
            .map(|e| e.provider)
    }

    /// Enable a previously-disabled provider. Returns `false` if `id` is unknown.
    pub fn enable(&self, id: ProviderId) -> bool {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.enabled = true;
                true
            }
            None => false,
        }
    }

    /// Disable a provider, excluding it from future selection. Returns `false`
    /// if `id` is unknown. Disabling a streaming-capable provider logs a
    /// `warn`-level monitoring alert.
    pub fn disable(&self, id: ProviderId) -> bool {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.enabled = false;
                if entry.provider.as_streaming_provider().is_some() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(provider = id.as_str(), "streaming provider disabled");
                }
                true
            }
            None => false,
        }
    }

    /// Look up a provider by id, regardless of enabled state.
    pub fn get_by_id(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .map(|e| Arc::clone(&e.provider))
    }

    /// Metadata for every registered provider, enabled or not.
    pub fn get_all(&self) -> Vec<ProviderMetadata> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(id, e)| ProviderMetadata {
                id: *id,
                priority: e.priority,
                enabled: e.enabled,
            })
            .collect()
    }

    /// Every enabled provider whose capabilities satisfy `predicate`, in
    /// priority order (lower priority first).
    pub fn get_by_capability(
        &self,
        predicate: impl Fn(&crate::types::Capabilities) -> bool,
    ) -> Vec<Arc<dyn Provider>> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut matches: Vec<(i32, Arc<dyn Provider>)> = entries
            .values()
            .filter(|e| e.enabled && predicate(e.provider.capabilities()))
            .map(|e| (e.priority, Arc::clone(&e.provider)))
            .collect();
        matches.sort_by_key(|(priority, _)| *priority);
        matches.into_iter().map(|(_, p)| p).collect()
    }

    /// Enabled providers supporting `cap`, ordered by the installed routing
    /// policy's rank for `ctx.symbol`/`cap` first and plain `priority` as the
    /// tie-breaker; falls back to plain `priority` ordering when no policy is
    /// installed. A `strict` routing rule that excludes a provider drops it
    /// from the result entirely.
    fn ranked_candidates_for(&self, cap: Capability, ctx: AvailabilityContext<'_>) -> Vec<Arc<dyn Provider>> {
        let routing_policy = self.routing_policy.read().expect("registry lock poisoned");
        let entries = self.entries.read().expect("registry lock poisoned");
        let routing_ctx = RoutingContext::new(ctx.symbol, Some(cap));

        let mut matches: Vec<((usize, i32), Arc<dyn Provider>)> = Vec::new();
        for e in entries.values() {
            if !e.enabled || !e.provider.capabilities().supports(cap) {
                continue;
            }
            let rank = match routing_policy.as_ref() {
                Some(policy) => match policy.providers.provider_rank(&routing_ctx, &e.provider.id()) {
                    Some((rank, _strict)) => rank,
                    None => continue,
                },
                None => usize::MAX,
            };
            matches.push(((rank, e.priority), Arc::clone(&e.provider)));
        }
        matches.sort_by(|(a, _), (b, _)| a.cmp(b));
        matches.into_iter().map(|(_, p)| p).collect()
    }

    /// The highest-ranked enabled backfill provider currently available for
    /// `ctx`, or `None` if none qualify. Availability errors are treated as
    /// "not available" and logged at debug.
    pub async fn get_best_backfill_provider(
        &self,
        ctx: AvailabilityContext<'_>,
    ) -> Option<Arc<dyn Provider>> {
        for candidate in self.ranked_candidates_for(Capability::Backfill, ctx) {
            if candidate.as_backfill_provider().is_none() {
                continue;
            }
            if candidate.is_available(ctx).await {
                return Some(candidate);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(provider = candidate.id().as_str(), "backfill provider not available");
        }
        None
    }

    /// The highest-ranked enabled symbol-search provider currently available
    /// for `ctx`, or `None` if none qualify.
    pub async fn get_best_symbol_search_provider(
        &self,
        ctx: AvailabilityContext<'_>,
    ) -> Option<Arc<dyn Provider>> {
        for candidate in self.ranked_candidates_for(Capability::SymbolSearch, ctx) {
            if candidate.as_symbol_search_provider().is_none() {
                continue;
            }
            if candidate.is_available(ctx).await {
                return Some(candidate);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(provider = candidate.id().as_str(), "symbol-search provider not available");
        }
        None
    }

    /// A point-in-time count of providers by state and capability.
    pub fn get_summary(&self) -> RegistrySummary {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut summary = RegistrySummary {
            total: entries.len(),
            ..RegistrySummary::default()
        };
        let capabilities = [
            Capability::StreamTrades,
            Capability::StreamQuotes,
            Capability::StreamDepth,
            Capability::Backfill,
            Capability::BackfillAdjusted,
            Capability::SymbolSearch,
            Capability::FigiResolve,
        ];
        for entry in entries.values() {
            if entry.enabled {
                summary.enabled += 1;
            } else {
                summary.disabled += 1;
            }
            if entry.enabled {
                for cap in capabilities {
                    if entry.provider.capabilities().supports(cap) {
                        *summary.by_capability.entry(cap.as_str()).or_insert(0) += 1;
                    }
                }
            }
        }
        summary
    }

    /// Dispose every registered provider, swallowing individual disposal
    /// errors so the remainder still get a chance to clean up, then clear
    /// the registry.
    pub async fn dispose(&self) {
        let providers: Vec<Arc<dyn Provider>> = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries.values().map(|e| Arc::clone(&e.provider)).collect()
        };
        for provider in providers {
            if let Err(_err) = provider.dispose().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(provider = provider.id().as_str(), error = ?_err, "provider disposal failed");
            }
        }
        self.entries.write().expect("registry lock poisoned").clear();
    }
}
