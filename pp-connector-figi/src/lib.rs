//! Symbol normalization and OpenFIGI-backed identifier resolution.
//!
//! Two independent pieces live in this crate:
//!
//! - [`normalize`]: a pure per-vendor symbol rewrite, used wherever a
//!   canonical symbol needs to cross into a vendor-specific request.
//! - [`FigiResolver`]: a [`pp_core::connector::Provider`] implementing
//!   [`pp_core::connector::FigiResolverProvider`] against OpenFIGI's mapping
//!   API, with its own positive/negative cache. It applies no rate limiting
//!   itself; callers wrap it in `pp_middleware::quota::QuotaGatedProvider`
//!   like every other connector in this workspace.

mod normalize;
mod resolver;

pub use normalize::normalize;
pub use resolver::FigiResolver;
