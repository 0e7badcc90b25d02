//! Two-tier TTL cache for derived and fetched data.
//!
//! This module provides a cache that is independent of domain state:
//! - A memory tier that lives for the process lifetime
//! - A persistent tier, one key per entry under a fixed prefix
//! - Lazy eviction on read; there is no background sweep
//! - Read-through fetching that falls back to the fetcher on any miss

mod entry;
mod layer;

pub use entry::{CacheEntry, CacheHit, CacheSource, CacheStats};
pub use layer::{CacheManager, CACHE_PREFIX, DEFAULT_TTL};
