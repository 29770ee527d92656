use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::Capability;

/// Unified error type for the provider plane.
///
/// Every fallible public operation returns `Result<T, ProviderPlaneError>`.
/// Each variant family corresponds to one member of the error taxonomy so
/// callers can match on the taxonomy itself rather than parsing messages.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProviderPlaneError {
    /// Retryable per policy: network glitch, 5xx, or a 429 with a cooldown.
    #[error("{provider} transient error: {msg}")]
    Transient {
        /// Provider that raised the error.
        provider: String,
        /// Human-readable description of the underlying cause.
        msg: String,
    },

    /// Authentication/authorization failure; the provider is disabled and a
    /// monitoring alert is raised. Never retried automatically.
    #[error("{provider} credential error: {msg}")]
    Credential {
        /// Provider whose credentials were rejected.
        provider: String,
        /// Human-readable description.
        msg: String,
    },

    /// A resource or symbol could not be found. Terminates the one request;
    /// does not disable the provider.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource, e.g. "bar for AAPL 2024-01-02".
        what: String,
    },

    /// A single inbound message failed to parse. The payload is truncated to
    /// 500 bytes before being attached here; the message is dropped and
    /// processing continues.
    #[error("{provider} malformed message")]
    Malformed {
        /// Provider that sent the malformed payload.
        provider: String,
        /// Payload truncated to at most 500 bytes. Never contains credentials.
        truncated_payload: String,
    },

    /// Rate limit or queue capacity exhausted; cooldown then retry.
    #[error("{provider} capacity exceeded")]
    Capacity {
        /// Provider whose capacity was exhausted.
        provider: String,
        /// Suggested delay before retrying, if known.
        retry_after: Option<Duration>,
    },

    /// Out-of-memory or invariant violation. Bubbles up; never auto-recovered.
    #[error("fatal: {msg}")]
    Fatal {
        /// Description of the violated invariant.
        msg: String,
    },

    /// The requested capability is not implemented by the target provider.
    #[error("unsupported capability: {capability}")]
    Unsupported {
        /// Capability that was requested.
        capability: Capability,
    },

    /// All selected providers failed; contains the individual failures.
    #[error("all providers failed: {0:?}")]
    AllProvidersFailed(Vec<ProviderPlaneError>),

    /// An individual provider call exceeded the configured timeout.
    #[error("provider timed out: {capability} via {provider}")]
    ProviderTimeout {
        /// Provider that timed out.
        provider: String,
        /// Capability being requested when the timeout occurred.
        capability: Capability,
    },

    /// A vendor's rate-limit window is currently exhausted.
    #[error("{provider} rate limit exceeded")]
    RateLimitExceeded {
        /// Provider whose quota was exceeded.
        provider: String,
    },

    /// A vendor is under an active cooldown installed after a prior rate-limit hit.
    #[error("{provider} temporarily blacklisted for {remaining_ms}ms")]
    TemporarilyBlacklisted {
        /// Provider under cooldown.
        provider: String,
        /// Milliseconds remaining in the cooldown.
        remaining_ms: u64,
    },

    /// A routing policy in strict mode rejected every candidate for a symbol.
    #[error("symbol {symbol} rejected by strict routing policy")]
    StrictSymbolsRejected {
        /// Symbol that had no admissible provider.
        symbol: String,
    },

    /// A middleware stack failed its ordering/dependency validation.
    #[error("invalid middleware stack: {message}")]
    InvalidMiddlewareStack {
        /// Description of the violated ordering or dependency rule.
        message: String,
    },
}

impl ProviderPlaneError {
    /// Helper: build a `Transient` error.
    pub fn transient(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `Credential` error.
    pub fn credential(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            provider: provider.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Helper: build a `Malformed` error, truncating `payload` to 500 bytes.
    pub fn malformed(provider: impl Into<String>, payload: &str) -> Self {
        let truncated_payload = truncate_payload(payload, 500);
        Self::Malformed {
            provider: provider.into(),
            truncated_payload,
        }
    }

    /// Helper: build a `Capacity` error.
    pub fn capacity(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Capacity {
            provider: provider.into(),
            retry_after,
        }
    }

    /// Helper: build a `Fatal` error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal { msg: msg.into() }
    }

    /// Helper: build an `Unsupported` error.
    #[must_use]
    pub const fn unsupported(capability: Capability) -> Self {
        Self::Unsupported { capability }
    }

    /// Helper: build a `ProviderTimeout` error.
    pub fn provider_timeout(provider: impl Into<String>, capability: Capability) -> Self {
        Self::ProviderTimeout {
            provider: provider.into(),
            capability,
        }
    }

    /// Helper: build a `RateLimitExceeded` error.
    pub fn rate_limit_exceeded(provider: impl Into<String>) -> Self {
        Self::RateLimitExceeded {
            provider: provider.into(),
        }
    }

    /// Helper: build a `TemporarilyBlacklisted` error.
    pub fn temporarily_blacklisted(provider: impl Into<String>, remaining_ms: u64) -> Self {
        Self::TemporarilyBlacklisted {
            provider: provider.into(),
            remaining_ms,
        }
    }

    /// Helper: build a `StrictSymbolsRejected` error.
    pub fn strict_symbols_rejected(symbol: impl Into<String>) -> Self {
        Self::StrictSymbolsRejected {
            symbol: symbol.into(),
        }
    }

    /// Helper: build an `InvalidMiddlewareStack` error.
    pub fn invalid_middleware_stack(message: impl Into<String>) -> Self {
        Self::InvalidMiddlewareStack {
            message: message.into(),
        }
    }

    /// Returns true if this error should be surfaced to users as actionable.
    ///
    /// Non-actionable errors are capability absence and benign not-found
    /// conditions. Aggregates are classified based on their contents.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        match self {
            Self::Unsupported { .. } | Self::NotFound { .. } => false,
            Self::AllProvidersFailed(inner) => inner.iter().any(Self::is_actionable),
            _ => true,
        }
    }

    /// Flatten nested `AllProvidersFailed` structures into a plain vector.
    #[must_use]
    pub fn flatten(self) -> Vec<Self> {
        match self {
            Self::AllProvidersFailed(list) => list.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}

fn truncate_payload(payload: &str, max_bytes: usize) -> String {
    if payload.len() <= max_bytes {
        return payload.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &payload[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_truncates_long_payload() {
        let payload = "x".repeat(600);
        let err = ProviderPlaneError::malformed("alpaca", &payload);
        match err {
            ProviderPlaneError::Malformed {
                truncated_payload, ..
            } => assert!(truncated_payload.len() <= 501),
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn unsupported_and_not_found_are_not_actionable() {
        assert!(!ProviderPlaneError::unsupported(Capability::Backfill).is_actionable());
        assert!(!ProviderPlaneError::not_found("AAPL").is_actionable());
        assert!(ProviderPlaneError::fatal("oom").is_actionable());
    }

    #[test]
    fn flatten_recurses_through_nested_aggregates() {
        let inner = ProviderPlaneError::not_found("a");
        let nested = ProviderPlaneError::AllProvidersFailed(vec![
            ProviderPlaneError::AllProvidersFailed(vec![inner.clone()]),
            ProviderPlaneError::not_found("b"),
        ]);
        let flat = nested.flatten();
        assert_eq!(flat.len(), 2);
    }
}
