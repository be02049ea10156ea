use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use querygate::config;
use querygate::core::{Core, CoreError, Request};
use querygate::sim::SimulatedBackend;

#[derive(Parser)]
#[command(name = "querygate")]
#[command(version, about = "Pooled, cached and rate limited query middleware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Environment variable prefix to prefer over unprefixed names
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and print the effective configuration
    Check,

    /// Drive a simulated backend through the full request path
    Simulate {
        /// Total requests to send
        #[arg(long, default_value = "200")]
        requests: usize,

        /// Distinct callers, each with its own rate limit bucket
        #[arg(long, default_value = "4")]
        clients: usize,

        /// Requests in flight at once
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Distinct query texts; repeats are cache candidates
        #[arg(long, default_value = "20")]
        distinct_queries: usize,

        /// Probability that a connect or query fails
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,

        /// Simulated backend latency in milliseconds
        #[arg(long, default_value = "10")]
        latency_ms: u64,
    },
}

#[derive(Debug, Default)]
struct Tally {
    fresh: usize,
    cached: usize,
    rate_limited: usize,
    pool_errors: usize,
    backend_errors: usize,
}

impl Tally {
    fn record(&mut self, outcome: &Result<querygate::Response, CoreError>) {
        match outcome {
            Ok(response) if response.cached => self.cached += 1,
            Ok(_) => self.fresh += 1,
            Err(CoreError::RateLimited { .. }) => self.rate_limited += 1,
            Err(CoreError::Pool(_)) => self.pool_errors += 1,
            Err(CoreError::Backend(_)) => self.backend_errors += 1,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;

    match cli.command {
        Commands::Check => {
            let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
            println!("{yaml}");
        }
        Commands::Simulate {
            requests,
            clients,
            concurrency,
            distinct_queries,
            failure_rate,
            latency_ms,
        } => {
            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("failure_rate must be between 0 and 1");
            }
            let backend = SimulatedBackend::new(Duration::from_millis(latency_ms), failure_rate);
            let core = Core::new(config, backend.clone()).await?;

            let clients = clients.max(1);
            let distinct_queries = distinct_queries.max(1);
            let started = Instant::now();

            let outcomes: Vec<_> = stream::iter(0..requests)
                .map(|i| {
                    let core = core.clone();
                    let backend = backend.clone();
                    async move {
                        let request = Request::new(
                            "execute_query",
                            format!("client-{}", i % clients),
                            format!("SELECT * FROM events WHERE shard = {}", i % distinct_queries),
                        );
                        core.handle(&request, &backend).await
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

            let mut tally = Tally::default();
            for outcome in &outcomes {
                if let Err(e) = outcome {
                    if !matches!(e, CoreError::RateLimited { .. }) {
                        warn!(error = %e, "Request failed");
                    }
                }
                tally.record(outcome);
            }

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                fresh = tally.fresh,
                cached = tally.cached,
                rate_limited = tally.rate_limited,
                pool_errors = tally.pool_errors,
                backend_errors = tally.backend_errors,
                backend_queries = backend.queries_executed(),
                "Simulation finished"
            );

            let report = core.health();
            println!("{}", serde_json::to_string_pretty(&report)?);

            core.shutdown().await;
        }
    }

    Ok(())
}
