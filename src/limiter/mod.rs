//! Per-caller token bucket rate limiting
//!
//! Each key owns a bucket that starts full at `burst` tokens and refills
//! continuously at `rate_per_minute / 60` tokens per second. An admitted
//! request spends one token; a request finding less than one is denied.
//! Denial is an ordinary outcome, never an error.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Long-run admitted requests per minute, per key
    pub rate_per_minute: u32,

    /// Bucket capacity: requests admitted back to back from a full bucket
    pub burst: u32,

    /// Buckets untouched for this long (and therefore full) are dropped
    pub prune_after: Option<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 60,
            burst: 10,
            prune_after: Some(Duration::from_secs(600)),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rate_per_minute == 0 {
            anyhow::bail!("rate_per_minute must be positive");
        }
        if self.burst == 0 {
            anyhow::bail!("burst must be at least 1");
        }
        Ok(())
    }

    fn tokens_per_second(&self) -> f64 {
        f64::from(self.rate_per_minute) / 60.0
    }

    /// Pause between retries in `await_admission`
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.rate_per_minute))
    }
}

/// Token state for one key
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, per_second: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub tracked_keys: usize,
    pub rate_per_minute: u32,
    pub burst: u32,
    pub admitted: u64,
    pub denied: u64,
}

struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    admitted: u64,
    denied: u64,
    last_prune: Instant,
}

/// Token bucket rate limiter keyed by caller/operation
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                admitted: 0,
                denied: 0,
                last_prune: Instant::now(),
            }),
        })
    }

    /// The bucket key for a client calling an operation
    pub fn key(client: &str, operation: &str) -> String {
        format!("{client}:{operation}")
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Spend one token for `key` if one is available. Never blocks.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let per_second = self.config.tokens_per_second();
        let capacity = f64::from(self.config.burst);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.maybe_prune(state, now);

        let admitted = match state.buckets.get_mut(key) {
            Some(bucket) => {
                bucket.refill(now, per_second, capacity);
                bucket.try_consume()
            }
            None => {
                let mut bucket = TokenBucket::full(capacity, now);
                let admitted = bucket.try_consume();
                state.buckets.insert(key.to_string(), bucket);
                admitted
            }
        };

        if admitted {
            state.admitted += 1;
        } else {
            state.denied += 1;
            debug!(key, "Rate limit denied request");
        }
        admitted
    }

    /// Wait until `key` is admitted, retrying every `60 / rate_per_minute`
    /// seconds. Request paths that should fail fast call [`allow`](Self::allow).
    pub async fn await_admission(&self, key: &str) {
        let wait = self.config.retry_interval();
        while !self.allow(key) {
            warn!(key, wait_ms = wait.as_millis() as u64, "Rate limit exceeded, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens `key` could spend right now, without spending any
    pub fn remaining(&self, key: &str) -> f64 {
        let now = Instant::now();
        let capacity = f64::from(self.config.burst);
        let state = self.state.lock();
        match state.buckets.get(key) {
            Some(bucket) => {
                let mut bucket = bucket.clone();
                bucket.refill(now, self.config.tokens_per_second(), capacity);
                bucket.tokens
            }
            None => capacity,
        }
    }

    /// Drop buckets idle for at least `older_than` that have refilled to
    /// capacity. A recreated bucket starts full, so nothing observable changes.
    pub fn prune_idle(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.prune_locked(&mut state, now, older_than)
    }

    fn maybe_prune(&self, state: &mut LimiterState, now: Instant) {
        if let Some(prune_after) = self.config.prune_after {
            if now.saturating_duration_since(state.last_prune) >= prune_after {
                self.prune_locked(state, now, prune_after);
            }
        }
    }

    fn prune_locked(&self, state: &mut LimiterState, now: Instant, older_than: Duration) -> usize {
        let per_second = self.config.tokens_per_second();
        let capacity = f64::from(self.config.burst);
        let before = state.buckets.len();

        state.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill);
            let refilled = bucket.tokens + idle.as_secs_f64() * per_second;
            idle < older_than || refilled < capacity
        });
        state.last_prune = now;

        let pruned = before - state.buckets.len();
        if pruned > 0 {
            debug!(pruned, remaining = state.buckets.len(), "Pruned idle rate limit buckets");
        }
        pruned
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            tracked_keys: state.buckets.len(),
            rate_per_minute: self.config.rate_per_minute,
            burst: self.config.burst,
            admitted: state.admitted,
            denied: state.denied,
        }
    }
}
