//! Simulated backend for load demos and smoke tests
//!
//! Connections take `latency` to open and to run a query, and fail at the
//! configured rate. A failed query leaves its connection dead, so the pool's
//! liveness check has something to catch.

use anyhow::bail;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{Executor, Request};
use crate::pool::ConnectionFactory;

#[derive(Debug, Default)]
struct Counters {
    next_id: AtomicU64,
    open: AtomicUsize,
    queries: AtomicU64,
}

/// A backend that only exists in memory
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    counters: Arc<Counters>,
}

/// An open simulated connection
#[derive(Debug)]
pub struct SimConnection {
    pub id: u64,
    healthy: bool,
    counters: Arc<Counters>,
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedBackend {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Connections currently open against the backend
    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Queries the backend actually ran
    pub fn queries_executed(&self) -> u64 {
        self.counters.queries.load(Ordering::SeqCst)
    }

    fn roll_failure(&self) -> bool {
        self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedBackend {
    type Connection = SimConnection;

    async fn create(&self) -> anyhow::Result<SimConnection> {
        tokio::time::sleep(self.latency).await;
        if self.roll_failure() {
            bail!("simulated connect failure");
        }
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(SimConnection {
            id: self.counters.next_id.fetch_add(1, Ordering::SeqCst),
            healthy: true,
            counters: Arc::clone(&self.counters),
        })
    }

    async fn is_alive(&self, conn: &mut SimConnection) -> bool {
        conn.healthy
    }
}

#[async_trait]
impl Executor<SimConnection> for SimulatedBackend {
    async fn execute(&self, conn: &mut SimConnection, request: &Request) -> anyhow::Result<String> {
        tokio::time::sleep(self.latency).await;
        if self.roll_failure() {
            conn.healthy = false;
            bail!("simulated failure running {} on connection {}", request.operation, conn.id);
        }
        let n = self.counters.queries.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "{} result #{} via connection {}: {}",
            request.operation, n, conn.id, request.body
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_open_count_follows_drop() {
        let backend = SimulatedBackend::new(Duration::from_millis(5), 0.0);
        let conn = backend.create().await.unwrap();
        assert_eq!(backend.open_connections(), 1);
        drop(conn);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_backend() {
        let backend = SimulatedBackend::new(Duration::ZERO, 1.0);
        assert!(backend.create().await.is_err());
        assert_eq!(backend.open_connections(), 0);
    }
}
