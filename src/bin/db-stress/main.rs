use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use db_stress::config_file;
use db_stress::driver::{Harness, Mode, Registry, RunReport};
use db_stress::exporter::{spawn_metrics_server, stop_metrics_server};
use db_stress::metrics::{MetricsSink, PrometheusMetrics, TeeSink};
use db_stress::sharded_stats::ShardedStats;

/// Measures point-read latency and error rate of a storage backend.
#[derive(Parser, Debug)]
#[command(name = "db-stress", version)]
struct Args {
    /// Backend to run against: postgres, mysql, mongo, cassandra, etcd, or ydb when built with the `ydb` feature.
    #[arg(short, long, env = "DB_BACKEND")]
    backend: String,

    /// `seed` populates the dataset, `test` runs the timed read workload.
    #[arg(short, long, env = "DB_MODE")]
    mode: Mode,

    /// YAML configuration file. Defaults to `config.yaml` when it exists.
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Address of the Prometheus scrape endpoint served in test mode.
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:8081")]
    metrics_address: SocketAddr,

    #[arg(long)]
    no_metrics_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let registry = Registry::with_default_backends();
    let backend = registry.resolve(&args.backend)?;
    let config = config_file::load(backend, args.config.as_deref())
        .context("Failed to load the configuration")?;
    config.print_configuration();

    let prometheus = Arc::new(PrometheusMetrics::new()?);
    let stats = Arc::new(ShardedStats::new());
    let sinks: Vec<Arc<dyn MetricsSink>> = vec![prometheus.clone(), stats.clone()];
    let sink = Arc::new(TeeSink::new(sinks));

    let server_shutdown = CancellationToken::new();
    let server = if args.mode == Mode::Test && !args.no_metrics_server {
        let (_, handle) = spawn_metrics_server(args.metrics_address, prometheus, server_shutdown.clone())?;
        Some(handle)
    } else {
        None
    };

    let harness = Harness::new(registry, sink)
        .with_stats(stats)
        .with_signal_handling();
    let result = harness.run(args.mode, config).await;

    if let Some(handle) = server {
        stop_metrics_server(&server_shutdown, handle).await;
    }

    match result? {
        RunReport::Seeded(summary) => {
            println!("Seeded {} of {} records", summary.written(), summary.attempted);
        }
        RunReport::Tested { summary, .. } => {
            println!(
                "Performed {} reads with {} workers, {} failed",
                summary.reads(),
                summary.workers,
                summary.failures
            );
        }
    }
    Ok(())
}
