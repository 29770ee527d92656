//! pp-middleware
//!
//! Re-exports for provider-plane middleware wrappers: the rate-limit governor
//! (sliding-window admission) and the cooldown blacklist (reactive backoff on
//! capacity errors), composed via [`ProviderBuilder`].

mod blacklist;
mod builder;
mod quota;

pub use crate::blacklist::{BlacklistMiddleware, BlacklistedProvider};
pub use crate::builder::ProviderBuilder;
pub use crate::quota::{QuotaGatedProvider, QuotaMiddleware};
