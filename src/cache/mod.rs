//! Generic caching layer for reference data and offline support.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Mirrors each query's records in memory and in the key-value store
//! - Allows at most one network fetch per query key at a time
//! - Coalesces rapid updates into one debounced store write
//! - Serves the best available data when offline or when a fetch fails,
//!   flagging entries older than the TTL as stale

mod debounce;
mod layer;
mod traits;

pub use debounce::WriteScheduler;
pub use layer::{CacheEntry, CacheSettings, ReferenceCache, DEFAULT_PERSIST_DELAY, DEFAULT_TTL};
pub use traits::{CacheResult, CacheSource, Cacheable, GetOptions, QueryKey};
