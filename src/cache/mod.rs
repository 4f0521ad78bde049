//! Caching core: key derivation, URL policy, and the fill coordinator.

mod coordinator;
mod entry;
pub(crate) mod keys;
mod policy;

pub use coordinator::{
    CacheCoordinator, METRIC_CACHE_FILL_FAIL_TOTAL, METRIC_CACHE_FILL_MS, METRIC_CACHE_HIT_TOTAL,
    METRIC_CACHE_MISS_TOTAL,
};
pub use entry::{FailureKind, FetchFailure, Outcome};
pub use keys::{CacheKey, KeyError, Resource, normalize};
pub use policy::{PolicyDecision, PolicyError, UrlPolicy};
