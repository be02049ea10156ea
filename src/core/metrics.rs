//! Per-operation request metrics

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::{CoreError, Response};

#[derive(Debug, Default)]
struct OperationMetrics {
    count: u64,
    errors: u64,
    rate_limited: u64,
    cache_hits: u64,
    total_time: Duration,
    last_error: Option<String>,
    last_execution: Option<DateTime<Utc>>,
}

/// Serialisable view of one operation's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub count: u64,
    /// Failed requests, not counting rate limit denials
    pub errors: u64,
    /// Percentage of requests that failed
    pub error_rate: f64,
    pub rate_limited: u64,
    pub cache_hits: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub last_error: Option<String>,
    pub last_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_operations: u64,
    pub total_errors: u64,
    pub operations: BTreeMap<String, OperationSnapshot>,
}

/// Counts, timings and last error per operation name
#[derive(Debug)]
pub struct RequestMetrics {
    started: Instant,
    operations: Mutex<HashMap<String, OperationMetrics>>,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Record one handled request
    pub fn record(&self, operation: &str, elapsed: Duration, outcome: &Result<Response, CoreError>) {
        let mut operations = self.operations.lock();
        if !operations.contains_key(operation) {
            operations.insert(operation.to_string(), OperationMetrics::default());
        }
        let Some(metrics) = operations.get_mut(operation) else {
            return;
        };

        metrics.count += 1;
        metrics.total_time += elapsed;
        metrics.last_execution = Some(Utc::now());

        match outcome {
            Ok(response) if response.cached => metrics.cache_hits += 1,
            Ok(_) => {}
            Err(CoreError::RateLimited { .. }) => metrics.rate_limited += 1,
            Err(e) => {
                metrics.errors += 1;
                metrics.last_error = Some(e.to_string());
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self.operations.lock();

        let operations: BTreeMap<String, OperationSnapshot> = operations
            .iter()
            .map(|(name, m)| {
                let total_time_ms = m.total_time.as_secs_f64() * 1000.0;
                let (avg_time_ms, error_rate) = if m.count == 0 {
                    (0.0, 0.0)
                } else {
                    (
                        total_time_ms / m.count as f64,
                        m.errors as f64 / m.count as f64 * 100.0,
                    )
                };
                let snapshot = OperationSnapshot {
                    count: m.count,
                    errors: m.errors,
                    error_rate,
                    rate_limited: m.rate_limited,
                    cache_hits: m.cache_hits,
                    total_time_ms,
                    avg_time_ms,
                    last_error: m.last_error.clone(),
                    last_execution: m.last_execution,
                };
                (name.clone(), snapshot)
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            total_operations: operations.values().map(|o| o.count).sum(),
            total_errors: operations.values().map(|o| o.errors).sum(),
            operations,
        }
    }
}
