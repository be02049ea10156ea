//! Bounded result cache with TTL expiry and LRU eviction
//!
//! Entries are bounded by count and, optionally, by accounted byte size.
//! Expiry is checked lazily on access; an optional background sweep removes
//! expired entries nobody asks for.

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fingerprint::Fingerprint;

/// Approximate memory a cached value accounts for
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl CacheWeight for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl CacheWeight for serde_json::Value {
    fn weight(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Configuration for cache behavior
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum accounted size of all entries, `None` for count-only bounding
    pub max_size_bytes: Option<usize>,

    /// Time to live of an entry
    pub ttl: Duration,

    /// Values larger than this fraction of `max_size_bytes` are not cached
    pub max_entry_fraction: f64,

    /// Period of the background expiry sweep, `None` disables it
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_size_bytes: Some(64 * 1024 * 1024),
            ttl: Duration::from_secs(300),
            max_entry_fraction: 0.5,
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            anyhow::bail!("cache max_entries must be positive");
        }
        if self.max_size_bytes == Some(0) {
            anyhow::bail!("cache max_size_bytes must be positive when set");
        }
        if self.ttl.is_zero() {
            anyhow::bail!("cache ttl must be positive");
        }
        if !(self.max_entry_fraction > 0.0 && self.max_entry_fraction <= 1.0) {
            anyhow::bail!("cache max_entry_fraction must be in (0, 1]");
        }
        if matches!(self.sweep_interval, Some(d) if d.is_zero()) {
            anyhow::bail!("cache sweep_interval must be non-zero");
        }
        Ok(())
    }

    /// Largest single entry the cache accepts
    pub fn entry_size_limit(&self) -> Option<usize> {
        self.max_size_bytes
            .map(|max| (max as f64 * self.max_entry_fraction) as usize)
    }
}

/// What `set` did with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Replaced,
    /// Too large to cache; the caller keeps using the uncached value
    Rejected { size: usize, limit: usize },
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_entries: usize,
    pub max_size_bytes: Option<usize>,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejected: u64,
}

/// A cached value and its metadata
struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
    size: usize,
    hits: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

struct CacheState<V> {
    entries: LruCache<Fingerprint, CacheEntry<V>>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejected: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn remove_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

struct CacheInner<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for CacheInner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Result cache keyed by request fingerprint
///
/// Cloning is cheap; clones share the same entries.
pub struct QueryCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> QueryCache<V>
where
    V: CacheWeight + Send + Sync + 'static,
{
    /// Create a cache. If a sweep interval is configured and a tokio runtime
    /// is running, the background expiry sweep starts immediately.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        info!(
            max_entries = config.max_entries,
            max_size_bytes = ?config.max_size_bytes,
            ttl_secs = config.ttl.as_secs(),
            "Creating query cache"
        );

        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    size_bytes: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    expirations: 0,
                    rejected: 0,
                }),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        };

        cache.start_sweeper();
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up a fingerprint. A hit marks the entry most recently used; an
    /// expired entry is removed and reported as a miss.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<V>> {
        let ttl = self.inner.config.ttl;
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.peek(key) {
            Some(entry) => entry.is_expired(ttl, now),
            None => {
                state.misses += 1;
                return None;
            }
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        let value = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.hits += 1;
                Arc::clone(&entry.value)
            }
            None => return None,
        };
        state.hits += 1;
        Some(value)
    }

    /// Insert or replace an entry and evict least recently used entries
    /// until both the count and size bounds hold again. A rejected value
    /// still removes whatever was cached under `key` before.
    pub fn set(&self, key: Fingerprint, value: impl Into<Arc<V>>) -> SetOutcome {
        let value = value.into();
        let size = value.weight() + key.as_str().len();
        let config = &self.inner.config;

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if let Some(limit) = config.entry_size_limit() {
            if size > limit {
                state.rejected += 1;
                // The old value for this key is no longer current
                let dropped_previous = state.remove(&key).is_some();
                debug!(key = %key, size, limit, dropped_previous, "Value too large to cache");
                return SetOutcome::Rejected { size, limit };
            }
        }

        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            size,
            hits: 0,
        };

        let outcome = match state.entries.put(key, entry) {
            Some(previous) => {
                state.size_bytes = state.size_bytes.saturating_sub(previous.size);
                SetOutcome::Replaced
            }
            None => SetOutcome::Inserted,
        };
        state.size_bytes += size;

        while state.entries.len() > config.max_entries
            || config.max_size_bytes.is_some_and(|max| state.size_bytes > max)
        {
            let Some((evicted, entry)) = state.entries.pop_lru() else {
                break;
            };
            state.size_bytes = state.size_bytes.saturating_sub(entry.size);
            state.evictions += 1;
            debug!(key = %evicted, size = entry.size, hits = entry.hits, "Evicted cache entry");
        }

        outcome
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.inner.state.lock().remove(key).is_some()
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = self
            .inner
            .state
            .lock()
            .remove_expired(self.inner.config.ttl, Instant::now());
        if removed > 0 {
            debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    /// Remove all entries. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.size_bytes = 0;
        info!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            size_bytes: state.size_bytes,
            max_entries: self.inner.config.max_entries,
            max_size_bytes: self.inner.config.max_size_bytes,
            ttl_seconds: self.inner.config.ttl.as_secs(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            expirations: state.expirations,
            rejected: state.rejected,
        }
    }

    fn start_sweeper(&self) {
        let Some(interval) = self.inner.config.sweep_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, cache expiry sweep disabled");
            return;
        };

        let weak: Weak<CacheInner<V>> = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                QueryCache { inner }.purge_expired();
            }
        });

        *self.inner.sweeper.lock() = Some(handle);
    }

    /// Stop the background sweep. The cache stays usable.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweep task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            max_size_bytes: None,
            ttl: Duration::from_secs(300),
            sweep_interval: None,
            ..CacheConfig::default()
        }
    }

    fn key(s: &str) -> Fingerprint {
        Fingerprint::from_raw(s)
    }

    #[test]
    fn test_set_then_get() {
        let cache: QueryCache<String> = QueryCache::new(config(10)).unwrap();
        assert_eq!(cache.set(key("a"), "1".to_string()), SetOutcome::Inserted);
        assert_eq!(cache.get(&key("a")).as_deref(), Some(&"1".to_string()));
        assert!(cache.get(&key("missing")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache: QueryCache<String> = QueryCache::new(config(2)).unwrap();
        cache.set(key("a"), "1".to_string());
        cache.set(key("b"), "2".to_string());
        assert!(cache.get(&key("a")).is_some());
        cache.set(key("c"), "3".to_string());

        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_keeps_size_exact() {
        let cache: QueryCache<String> = QueryCache::new(config(10)).unwrap();
        cache.set(key("k"), "x".repeat(100));
        assert_eq!(cache.set(key("k"), "y".repeat(10)), SetOutcome::Replaced);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 10 + 1);
    }

    #[test]
    fn test_size_bound_evicts_until_it_fits() {
        let cfg = CacheConfig {
            max_size_bytes: Some(100),
            max_entry_fraction: 1.0,
            ..config(100)
        };
        let cache: QueryCache<String> = QueryCache::new(cfg).unwrap();
        // 39 bytes of value + 1 byte of key each
        cache.set(key("a"), "a".repeat(39));
        cache.set(key("b"), "b".repeat(39));
        cache.set(key("c"), "c".repeat(39));

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size_bytes, 80);
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_rejects_oversized_value() {
        let cfg = CacheConfig {
            max_size_bytes: Some(100),
            max_entry_fraction: 0.5,
            ..config(100)
        };
        let cache: QueryCache<String> = QueryCache::new(cfg).unwrap();
        cache.set(key("small"), "s".to_string());

        let outcome = cache.set(key("big"), "b".repeat(60));
        assert_eq!(outcome, SetOutcome::Rejected { size: 63, limit: 50 });
        assert!(cache.get(&key("big")).is_none());
        // Nothing else was evicted to make room
        assert!(cache.get(&key("small")).is_some());
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn test_rejected_value_drops_previous_entry() {
        let cfg = CacheConfig {
            max_size_bytes: Some(100),
            max_entry_fraction: 0.5,
            ..config(100)
        };
        let cache: QueryCache<String> = QueryCache::new(cfg).unwrap();
        cache.set(key("k"), "old".to_string());
        cache.set(key("other"), "o".to_string());

        let outcome = cache.set(key("k"), "n".repeat(80));
        assert_eq!(outcome, SetOutcome::Rejected { size: 81, limit: 50 });
        assert!(cache.get(&key("k")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, "o".len() + "other".len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cfg = CacheConfig {
            ttl: Duration::from_secs(5),
            ..config(10)
        };
        let cache: QueryCache<String> = QueryCache::new(cfg).unwrap();
        cache.set(key("a"), "1".to_string());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get(&key("a")).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key("a")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cfg = CacheConfig {
            ttl: Duration::from_secs(5),
            ..config(10)
        };
        let cache: QueryCache<String> = QueryCache::new(cfg).unwrap();
        cache.set(key("old"), "1".to_string());
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.set(key("new"), "2".to_string());
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get(&key("new")).is_some());
        assert_eq!(cache.stats().size_bytes, 4);
    }

    #[test]
    fn test_clear_and_invalidate() {
        let cache: QueryCache<String> = QueryCache::new(config(10)).unwrap();
        cache.set(key("a"), "1".to_string());
        cache.set(key("b"), "2".to_string());

        assert!(cache.invalidate(&key("a")));
        assert!(!cache.invalidate(&key("a")));
        assert_eq!(cache.stats().entries, 1);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(config(0).validate().is_err());
        let cfg = CacheConfig {
            max_entry_fraction: 1.5,
            ..config(10)
        };
        assert!(cfg.validate().is_err());
    }
}
