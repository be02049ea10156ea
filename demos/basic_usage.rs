//! Basic usage example for querygate
//!
//! Builds a `Core` over the simulated backend and sends the same query a few
//! times to show rate limiting and caching in the request path.
//!
//! Run with:
//! ```
//! cargo run --example basic_usage
//! ```

use querygate::core::{Core, CoreError, Request};
use querygate::sim::SimulatedBackend;
use querygate::Config;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = Config::default();
    config.pool.min_connections = 2;
    config.pool.max_connections = 4;
    config.rate_limit.burst_limit = 5;

    let backend = SimulatedBackend::new(Duration::from_millis(20), 0.0);
    let core = Core::new(config, backend.clone()).await?;

    println!("querygate - Basic Usage Example");
    println!("===============================\n");

    let request = Request::new("execute_query", "alice", "SELECT id, name FROM users");
    for attempt in 1..=7 {
        match core.handle(&request, &backend).await {
            Ok(response) => println!(
                "{attempt}. {} ({})",
                response.body,
                if response.cached { "cache hit" } else { "backend" }
            ),
            Err(CoreError::RateLimited { key }) => println!("{attempt}. rate limited: {key}"),
            Err(e) => println!("{attempt}. failed: {e}"),
        }
    }

    println!("\nHealth:\n{}", serde_json::to_string_pretty(&core.health())?);

    core.shutdown().await;
    Ok(())
}
