pub mod metrics;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, Fingerprint, QueryCache, SetOutcome};
use crate::config::Config;
use crate::limiter::{LimiterStats, RateLimiter};
use crate::pool::{ConnectionFactory, PoolError, PoolStats, ResourcePool};

pub use metrics::{MetricsSnapshot, OperationSnapshot, RequestMetrics};

/// One inbound operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation name, e.g. `execute_query`
    pub operation: String,
    /// Caller identity used for rate limiting
    pub client: String,
    /// Operation payload, e.g. the query text
    pub body: String,
    /// Whether the result may be served from and stored in the cache
    pub cacheable: bool,
}

impl Request {
    pub fn new(operation: impl Into<String>, client: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            client: client.into(),
            body: body.into(),
            cacheable: true,
        }
    }

    /// Mark the request as never cached (e.g. writes)
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.operation, &self.body)
    }

    pub fn rate_key(&self) -> String {
        RateLimiter::key(&self.client, &self.operation)
    }
}

/// Result of a handled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: Arc<String>,
    /// Served from the cache without touching the backend
    pub cached: bool,
}

/// Runs a request on a checked-out backend connection
#[async_trait]
pub trait Executor<C>: Send + Sync {
    async fn execute(&self, conn: &mut C, request: &Request) -> Result<String>;

    /// Whether `err` leaves the connection unusable. Such connections are
    /// retired instead of going back to the pool.
    fn is_connection_error(&self, _err: &anyhow::Error) -> bool {
        true
    }
}

/// Error types for request handling
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Rate limited: {key}")]
    RateLimited { key: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Backend operation failed: {0:#}")]
    Backend(anyhow::Error),
}

/// Point-in-time view of every component
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<LimiterStats>,
    pub metrics: MetricsSnapshot,
}

/// Owns one pool, one cache and one rate limiter, built from configuration
///
/// Components never call each other; `handle` composes them per request.
/// Clones share the same components.
pub struct Core<F: ConnectionFactory> {
    pub config: Arc<Config>,
    pub pool: ResourcePool<F>,
    pub cache: Option<QueryCache<String>>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub metrics: Arc<RequestMetrics>,
}

impl<F: ConnectionFactory> Clone for Core<F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            limiter: self.limiter.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<F: ConnectionFactory> Core<F> {
    pub async fn new(config: Config, factory: F) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = ResourcePool::new(factory, config.pool.to_pool_config())
            .await
            .context("Failed to create connection pool")?;

        let cache = if config.cache.enabled {
            Some(
                QueryCache::new(config.cache.to_cache_config())
                    .context("Failed to create query cache")?,
            )
        } else {
            None
        };

        let limiter = if config.rate_limit.enabled {
            Some(Arc::new(
                RateLimiter::new(config.rate_limit.to_rate_limit_config())
                    .context("Failed to create rate limiter")?,
            ))
        } else {
            None
        };

        info!(
            min_connections = config.pool.min_connections,
            max_connections = config.pool.max_connections,
            caching = cache.is_some(),
            rate_limiting = limiter.is_some(),
            "Core initialized"
        );

        Ok(Self {
            config,
            pool,
            cache,
            limiter,
            metrics: Arc::new(RequestMetrics::new()),
        })
    }

    /// Serve one request: rate limit, then cache, then a pooled connection,
    /// writing fresh results back to the cache. Every outcome is recorded in
    /// the per-operation metrics.
    pub async fn handle<E>(&self, request: &Request, executor: &E) -> Result<Response, CoreError>
    where
        E: Executor<F::Connection> + ?Sized,
    {
        let start = Instant::now();
        let result = self.serve(request, executor).await;
        self.metrics.record(&request.operation, start.elapsed(), &result);
        result
    }

    async fn serve<E>(&self, request: &Request, executor: &E) -> Result<Response, CoreError>
    where
        E: Executor<F::Connection> + ?Sized,
    {
        if let Some(limiter) = &self.limiter {
            let key = request.rate_key();
            if !limiter.allow(&key) {
                return Err(CoreError::RateLimited { key });
            }
        }

        let cached = match &self.cache {
            Some(cache) if request.cacheable => Some((cache, request.fingerprint())),
            _ => None,
        };

        if let Some((cache, fingerprint)) = &cached {
            if let Some(body) = cache.get(fingerprint) {
                debug!(operation = %request.operation, "Served from cache");
                return Ok(Response { body, cached: true });
            }
        }

        let mut conn = self.pool.acquire().await?;
        let executed = executor.execute(&mut *conn, request).await;
        let output = match executed {
            Ok(output) => output,
            Err(err) => {
                if executor.is_connection_error(&err) {
                    warn!(operation = %request.operation, error = %err, "Retiring connection after backend failure");
                    conn.retire();
                }
                return Err(CoreError::Backend(err));
            }
        };
        drop(conn);

        let body = Arc::new(output);
        if let Some((cache, fingerprint)) = cached {
            if let SetOutcome::Rejected { size, limit } = cache.set(fingerprint, Arc::clone(&body)) {
                debug!(operation = %request.operation, size, limit, "Result not cached");
            }
        }

        Ok(Response { body, cached: false })
    }

    pub fn health(&self) -> HealthReport {
        let pool = self.pool.stats();
        let status = if self.pool.is_closed() {
            "closed"
        } else if pool.current_size == 0 && pool.failed_creates > 0 {
            "degraded"
        } else {
            "healthy"
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            pool,
            cache: self.cache.as_ref().map(|c| c.stats()),
            rate_limit: self.limiter.as_ref().map(|l| l.stats()),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Close the pool and stop background sweeps
    pub async fn shutdown(&self) {
        self.pool.close().await;
        if let Some(cache) = &self.cache {
            cache.shutdown().await;
        }
        info!("Core shut down");
    }
}
