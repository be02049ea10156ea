//! Example demonstrating the connection pool on its own
//!
//! This example shows how to:
//! 1. Configure a pool over any `ConnectionFactory`
//! 2. Share it between tasks that contend for connections
//! 3. Retire a connection that broke while in use
//! 4. Monitor pool statistics

use querygate::pool::{PoolConfig, ResourcePool};
use querygate::sim::SimulatedBackend;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let pool_config = PoolConfig {
        min_size: 2,
        max_size: 4,
        acquire_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(30),
        health_check_interval: Some(Duration::from_secs(5)),
        ..PoolConfig::default()
    };

    let backend = SimulatedBackend::new(Duration::from_millis(10), 0.05);
    let pool = ResourcePool::new(backend.clone(), pool_config).await?;
    info!(stats = ?pool.stats(), "Pool ready");

    let mut handles = Vec::new();
    for worker in 0..12 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            match pool.acquire().await {
                Ok(conn) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if worker % 5 == 0 {
                        info!(worker, id = conn.id, "Retiring connection after use");
                        conn.retire();
                    } else {
                        info!(worker, id = conn.id, uses = conn.use_count(), "Done with connection");
                    }
                }
                Err(e) => warn!(worker, error = %e, retryable = e.is_retryable(), "No connection"),
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }

    let report = pool.maintain().await;
    info!(retired = report.retired, created = report.created, "Health sweep");

    let stats = pool.stats();
    println!("Pool statistics:");
    println!("  current size:  {}", stats.current_size);
    println!("  available:     {}", stats.available);
    println!("  created total: {}", stats.created_total);
    println!("  retired total: {}", stats.retired_total);
    println!("  reused:        {}", stats.total_reused);
    println!("  open on backend: {}", backend.open_connections());

    pool.close().await;
    Ok(())
}
