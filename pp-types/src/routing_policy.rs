//! Centralized routing policy for provider ordering.
//!
//! This module defines a composable policy and an ergonomic builder to steer
//! provider preferences at global, per-capability and per-symbol scopes. The
//! provider registry's `install_routing_policy`/`get_best_*` selection
//! consumes the stable sort-keys exposed here instead of duplicating
//! ordering logic across call sites.
//!
//! Provider rules are matched against a [`RoutingContext`]. When multiple
//! rules match, the one with the highest [`Selector::specificity_bits`] wins
//! (more populated selector fields beats fewer). Ties are broken by
//! preferring rules that target a symbol over ones that target only a
//! capability; if a tie remains, the rule defined last wins. A rule can be
//! marked `strict` to exclude any provider not explicitly listed by that
//! rule. A global rule applies when no more-specific rule matches.
//!
//! Notes:
//! - The registry validates provider keys when a policy is installed; unknown
//!   provider keys cause an error.
//! - Unlisted providers remain eligible when a matching rule is not `strict`;
//!   they are placed after listed ones, preserving registration order.

use std::collections::{HashMap, HashSet};

use crate::capability::Capability;
use crate::connector::ProviderKey;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};

type Specificity = (u8, u8);
type ProviderMatch<'a> = (&'a RankedList<ProviderKey>, bool, Specificity, usize);

/// Scope at which a preference applies. Precedence is Symbol > Capability > Global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeKey {
    /// Global scope, used when no symbol- or capability-specific preference exists.
    Global,
    /// Preference bound to a specific capability.
    Capability(Capability),
    /// Preference bound to a specific symbol string.
    Symbol(String),
}

/// Ranked list of values with cached index positions for stable sort keys.
#[derive(Debug, Clone)]
pub(crate) struct RankedList<T> {
    values: Vec<T>,
    ranks: HashMap<T, usize>,
}

impl<T> RankedList<T>
where
    T: Clone + Eq + std::hash::Hash,
{
    fn new(list: &[T]) -> Self {
        let mut values: Vec<T> = Vec::new();
        let mut seen: HashSet<T> = HashSet::new();
        for value in list.iter().cloned() {
            if seen.insert(value.clone()) {
                values.push(value);
            }
        }

        let mut ranks: HashMap<T, usize> = HashMap::with_capacity(values.len());
        for (idx, value) in values.iter().cloned().enumerate() {
            ranks.insert(value, idx);
        }

        Self { values, ranks }
    }

    fn values(&self) -> &[T] {
        &self.values
    }

    const fn ranks(&self) -> &HashMap<T, usize> {
        &self.ranks
    }
}

impl<T> Serialize for RankedList<T>
where
    T: Serialize + Clone + Eq + std::hash::Hash,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
        for v in &self.values {
            seq.serialize_element(v)?;
        }
        seq.end()
    }
}

impl<'de, T> Deserialize<'de> for RankedList<T>
where
    T: Deserialize<'de> + Clone + Eq + std::hash::Hash,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct RLVisitor<TV> {
            _m: std::marker::PhantomData<TV>,
        }
        impl<'de, TV> Visitor<'de> for RLVisitor<TV>
        where
            TV: Deserialize<'de> + Clone + Eq + std::hash::Hash,
        {
            type Value = RankedList<TV>;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a sequence of values")
            }
            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut vals: Vec<TV> = Vec::new();
                while let Some(elem) = seq.next_element::<TV>()? {
                    vals.push(elem);
                }
                Ok(RankedList::new(&vals))
            }
        }
        deserializer.deserialize_seq(RLVisitor {
            _m: std::marker::PhantomData,
        })
    }
}

/// Ordered preference list keyed by a [`ScopeKey`].
///
/// Values are de-duplicated while preserving the first occurrence order.
#[derive(Debug, Clone)]
pub struct Preference<T> {
    global: Option<RankedList<T>>,
    by_capability: HashMap<Capability, RankedList<T>>,
    by_symbol: HashMap<String, RankedList<T>>,
}

impl<T> Default for Preference<T>
where
    T: Clone + Eq + std::hash::Hash,
{
    fn default() -> Self {
        Self {
            global: None,
            by_capability: HashMap::new(),
            by_symbol: HashMap::new(),
        }
    }
}

impl<T> Preference<T>
where
    T: Clone + Eq + std::hash::Hash,
{
    /// Set the ordered list for `scope`, keeping only the first occurrence of
    /// each element and preserving order.
    pub fn set(&mut self, scope: ScopeKey, list: &[T]) {
        let ranked = RankedList::new(list);
        match scope {
            ScopeKey::Global => {
                self.global = Some(ranked);
            }
            ScopeKey::Capability(cap) => {
                self.by_capability.insert(cap, ranked);
            }
            ScopeKey::Symbol(symbol) => {
                self.by_symbol.insert(symbol, ranked);
            }
        }
    }

    /// Remove all configured preferences.
    pub fn clear(&mut self) {
        self.global = None;
        self.by_capability.clear();
        self.by_symbol.clear();
    }

    /// Resolve the highest-precedence list for `(symbol, capability)` following
    /// the Symbol > Capability > Global ordering. Returns `None` if no
    /// preference exists.
    #[must_use]
    pub fn resolve<'a>(
        &'a self,
        symbol: Option<&str>,
        capability: Option<Capability>,
    ) -> Option<&'a [T]> {
        if let Some(sym) = symbol
            && let Some(list) = self.by_symbol.get(sym)
        {
            return Some(list.values());
        }
        if let Some(cap) = capability
            && let Some(list) = self.by_capability.get(&cap)
        {
            return Some(list.values());
        }
        self.global.as_ref().map(RankedList::values)
    }

    /// Resolve the highest-precedence rank map for `(symbol, capability)`,
    /// mirroring [`resolve`] but returning the cached rank table.
    #[must_use]
    pub fn resolve_rank_map(
        &self,
        symbol: Option<&str>,
        capability: Option<Capability>,
    ) -> Option<&HashMap<T, usize>> {
        if let Some(sym) = symbol
            && let Some(list) = self.by_symbol.get(sym)
        {
            return Some(list.ranks());
        }
        if let Some(cap) = capability
            && let Some(list) = self.by_capability.get(&cap)
        {
            return Some(list.ranks());
        }
        self.global.as_ref().map(RankedList::ranks)
    }
}

impl<T> Serialize for Preference<T>
where
    T: Serialize + Clone + Eq + std::hash::Hash,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut st = serializer.serialize_struct("Preference", 3)?;
        st.serialize_field("global", &self.global)?;
        st.serialize_field("by_capability", &self.by_capability)?;
        st.serialize_field("by_symbol", &self.by_symbol)?;
        st.end()
    }
}

impl<'de, T> Deserialize<'de> for Preference<T>
where
    T: Deserialize<'de> + Clone + Eq + std::hash::Hash,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(bound(deserialize = "T: Deserialize<'de> + Clone + Eq + std::hash::Hash"))]
        struct PrefSerde<T> {
            global: Option<RankedList<T>>,
            by_capability: Option<HashMap<Capability, RankedList<T>>>,
            by_symbol: Option<HashMap<String, RankedList<T>>>,
        }
        let tmp = PrefSerde::deserialize(deserializer)?;
        Ok(Self {
            global: tmp.global,
            by_capability: tmp.by_capability.unwrap_or_default(),
            by_symbol: tmp.by_symbol.unwrap_or_default(),
        })
    }
}

/// Generic selector identifying when a provider rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    /// Optional symbol constraint for a rule. When set, the rule applies only to this symbol.
    pub symbol: Option<String>,
    /// Optional capability constraint. When set, the rule applies only to requests for this capability.
    pub capability: Option<Capability>,
}

impl Selector {
    /// Compute precedence bits for tie-breaking between selectors.
    #[must_use]
    pub const fn specificity_bits(&self) -> (u8, u8) {
        (self.symbol.is_some() as u8, self.capability.is_some() as u8)
    }
}

/// A single provider rule with its selector, ordered provider list and strict flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRule {
    /// The selector describing when this rule applies.
    pub selector: Selector,
    pub(crate) list: RankedList<ProviderKey>,
    /// When true, only the providers listed by this rule are eligible. When false, providers
    /// not explicitly listed remain eligible after listed ones, preserving registration order.
    pub strict: bool,
}

/// Provider policy composed of ordered matching rules and an optional global rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub(crate) rules: Vec<ProviderRule>,
    pub(crate) global: Option<(RankedList<ProviderKey>, bool)>,
}

impl ProviderPolicy {
    /// Select the best-matching rule for the provided context.
    ///
    /// Tie-breaking: higher [`Selector::specificity_bits`] wins; if equal
    /// specificity, the rule defined later wins. Returns the list and its
    /// `strict` flag.
    fn best_rule<'a>(&'a self, ctx: &RoutingContext) -> Option<(&'a RankedList<ProviderKey>, bool)> {
        let mut best: Option<ProviderMatch<'_>> = None;
        for (idx, r) in self.rules.iter().enumerate() {
            let s = &r.selector;
            if s.symbol.is_some() && s.symbol.as_deref() != ctx.symbol {
                continue;
            }
            if s.capability.is_some() && s.capability != ctx.capability {
                continue;
            }
            let (sb, cb) = s.specificity_bits();
            let spec: Specificity = (sb, cb);
            match best {
                None => best = Some((&r.list, r.strict, spec, idx)),
                Some((_, _, bspec, bidx)) => {
                    if spec > bspec || (spec == bspec && idx > bidx) {
                        best = Some((&r.list, r.strict, spec, idx));
                    }
                }
            }
        }
        best.map(|(list, strict, _, _)| (list, strict))
    }

    /// Returns `Some((rank, strict))` for a provider key if eligible in this
    /// context, otherwise `None`.
    ///
    /// Semantics:
    /// - If a matching rule exists and contains `key`, the returned rank is its
    ///   position in that rule's list.
    /// - If a matching rule exists but does not include `key` and the rule is
    ///   `strict`, the provider is ineligible (returns `None`).
    /// - If no matching rule exists, the global rule is considered next with the
    ///   same semantics.
    /// - If neither matches, the provider is eligible with `usize::MAX` rank (i.e.,
    ///   after any explicitly listed providers).
    #[must_use]
    pub fn provider_rank(&self, ctx: &RoutingContext, key: &ProviderKey) -> Option<(usize, bool)> {
        if let Some((list, strict)) = self.best_rule(ctx) {
            if let Some(rank) = list.ranks().get(key).copied() {
                return Some((rank, strict));
            }
            return if strict { None } else { Some((usize::MAX, false)) };
        }
        if let Some((global, strict)) = &self.global {
            if let Some(rank) = global.ranks().get(key).copied() {
                return Some((rank, *strict));
            }
            return if *strict { None } else { Some((usize::MAX, false)) };
        }
        Some((usize::MAX, false))
    }

    /// Set or replace the global provider ordering and strictness.
    pub fn set_global(&mut self, list: &[ProviderKey], strict: bool) {
        self.global = Some((RankedList::new(list), strict));
    }

    /// Append a provider rule; later rules of equal specificity override earlier ones.
    pub fn add_rule(&mut self, selector: Selector, list: &[ProviderKey], strict: bool) {
        self.rules.push(ProviderRule {
            selector,
            list: RankedList::new(list),
            strict,
        });
    }

    /// Iterate rules (for registry validation).
    pub fn iter_rules(&self) -> impl Iterator<Item = &ProviderRule> {
        self.rules.iter()
    }

    /// Normalize provider lists against a set of known provider keys and collect unknowns.
    ///
    /// - Drops duplicate providers while preserving first occurrence order.
    /// - Filters out unknown provider keys; returns them grouped by selector.
    /// - Used by the registry when a routing policy is installed, to reject
    ///   policies that reference unregistered providers. Callers typically
    ///   surface the returned list as an error.
    pub fn normalize_and_collect_unknown(
        &mut self,
        known: &std::collections::HashSet<&'static str>,
    ) -> Vec<(Selector, Vec<String>)> {
        let mut unknown: Vec<(Selector, Vec<String>)> = Vec::new();

        if let Some((global, _strict)) = &mut self.global {
            let mut filtered: Vec<ProviderKey> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            let mut missing: Vec<String> = Vec::new();
            for key in global.values.iter().cloned() {
                let name = key.as_str();
                if known.contains(name) {
                    if seen.insert(name.to_string()) {
                        filtered.push(key);
                    }
                } else {
                    missing.push(name.to_string());
                }
            }
            *global = RankedList::new(&filtered);
            if !missing.is_empty() {
                unknown.push((
                    Selector {
                        symbol: None,
                        capability: None,
                    },
                    missing,
                ));
            }
        }

        for rule in &mut self.rules {
            let mut filtered: Vec<ProviderKey> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            let mut missing: Vec<String> = Vec::new();
            for key in rule.list.values.iter().cloned() {
                let name = key.as_str();
                if known.contains(name) {
                    if seen.insert(name.to_string()) {
                        filtered.push(key);
                    }
                } else {
                    missing.push(name.to_string());
                }
            }
            rule.list = RankedList::new(&filtered);
            if !missing.is_empty() {
                unknown.push((rule.selector.clone(), missing));
            }
        }

        unknown
    }
}

/// Routing policy aggregating provider ordering preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Provider routing policy (rules + global).
    pub providers: ProviderPolicy,
}

/// Builder for a [`RoutingPolicy`]. Later calls for the same scope overwrite
/// earlier ones.
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicyBuilder {
    policy: RoutingPolicy,
}

impl RoutingPolicyBuilder {
    /// Create a new empty routing policy builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            policy: RoutingPolicy::default(),
        }
    }

    /// Set a global provider ordering (fallback allowed).
    ///
    /// Providers not listed remain eligible after the listed ones unless a
    /// more specific strict rule applies in a given context.
    #[must_use]
    pub fn providers_global(mut self, list: &[ProviderKey]) -> Self {
        self.policy.providers.set_global(list, false);
        self
    }

    /// Set a global provider ordering (no fallback to other providers).
    #[must_use]
    pub fn providers_global_strict(mut self, list: &[ProviderKey]) -> Self {
        self.policy.providers.set_global(list, true);
        self
    }

    /// Set provider ordering for a specific capability (fallback allowed).
    #[must_use]
    pub fn providers_for_capability(mut self, capability: Capability, list: &[ProviderKey]) -> Self {
        let selector = Selector {
            symbol: None,
            capability: Some(capability),
        };
        self.policy.providers.add_rule(selector, list, false);
        self
    }

    /// Set provider ordering for a specific symbol (fallback allowed).
    ///
    /// Symbol rules are more specific than capability-only rules and
    /// therefore take precedence when they match the current context.
    #[must_use]
    pub fn providers_for_symbol(mut self, symbol: &str, list: &[ProviderKey]) -> Self {
        let selector = Selector {
            symbol: Some(symbol.to_string()),
            capability: None,
        };
        self.policy.providers.add_rule(selector, list, false);
        self
    }

    /// Add a fully-composable provider rule with a strict flag.
    ///
    /// Use this when you need to combine constraints (symbol+capability) or
    /// set a strict rule that disables fallback to unlisted providers.
    #[must_use]
    pub fn providers_rule(mut self, selector: Selector, list: &[ProviderKey], strict: bool) -> Self {
        self.policy.providers.add_rule(selector, list, strict);
        self
    }

    /// Finalize and return the built policy.
    #[must_use]
    pub fn build(self) -> RoutingPolicy {
        self.policy
    }
}

/// Routing context used when evaluating precedence and computing sort keys.
#[derive(Debug, Clone)]
pub struct RoutingContext<'a> {
    /// Optional symbol under consideration.
    pub symbol: Option<&'a str>,
    /// Optional capability under consideration.
    pub capability: Option<Capability>,
}

impl<'a> RoutingContext<'a> {
    /// Construct a new context from optional `symbol` and `capability`.
    #[must_use]
    pub const fn new(symbol: Option<&'a str>, capability: Option<Capability>) -> Self {
        Self { symbol, capability }
    }
}

impl RoutingPolicy {
    /// Compute a stable sort key for provider ordering using the provider policy.
    ///
    /// Returns (rank, `orig_idx`) where unknown providers rank after known ones.
    #[must_use]
    pub fn provider_sort_key(
        &self,
        ctx: &RoutingContext,
        key: &ProviderKey,
        orig_idx: usize,
    ) -> (usize, usize) {
        let (rank, _strict) = self
            .providers
            .provider_rank(ctx, key)
            .unwrap_or((usize::MAX, false));
        (rank, orig_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_rule_beats_capability_rule() {
        let policy = RoutingPolicyBuilder::new()
            .providers_for_capability(Capability::Backfill, &[ProviderKey::new("yahoo")])
            .providers_for_symbol("AAPL", &[ProviderKey::new("alpaca")])
            .build();
        let ctx = RoutingContext::new(Some("AAPL"), Some(Capability::Backfill));
        let rank = policy
            .providers
            .provider_rank(&ctx, &ProviderKey::new("alpaca"));
        assert_eq!(rank, Some((0, false)));
    }

    #[test]
    fn strict_rule_excludes_unlisted_providers() {
        let policy = RoutingPolicyBuilder::new()
            .providers_global_strict(&[ProviderKey::new("alpaca")])
            .build();
        let ctx = RoutingContext::new(None, None);
        assert_eq!(
            policy.providers.provider_rank(&ctx, &ProviderKey::new("yahoo")),
            None
        );
    }

    #[test]
    fn unlisted_provider_ranks_after_listed_ones_when_not_strict() {
        let policy = RoutingPolicyBuilder::new()
            .providers_global(&[ProviderKey::new("alpaca")])
            .build();
        let ctx = RoutingContext::new(None, None);
        assert_eq!(
            policy.providers.provider_rank(&ctx, &ProviderKey::new("yahoo")),
            Some((usize::MAX, false))
        );
    }
}
