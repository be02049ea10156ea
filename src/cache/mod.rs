//! Result caching
//!
//! This module provides:
//! - A bounded TTL cache with LRU eviction and hit/miss accounting
//! - Request fingerprinting for deterministic cache keys
//! - An optional background sweep of expired entries

pub mod fingerprint;
pub mod store;

pub use fingerprint::Fingerprint;
pub use store::{CacheConfig, CacheStats, CacheWeight, QueryCache, SetOutcome};
