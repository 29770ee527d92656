//! Re-export of the unified provider-plane error type.
//!
//! `pp-core` has no error variants of its own; every component shares
//! [`pp_types::ProviderPlaneError`] so that registry, scheduler, and
//! streaming-client failures compose into a single `AllProvidersFailed`
//! aggregate without per-crate wrapping.

pub use pp_types::ProviderPlaneError;
