use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use readgate::config::{LoggingConfig, ReadgateConfig};
use readgate::ratelimit::{RequestClassifier, RetentionSweeper, WindowRateLimiter};
use readgate::store::PostgresCounterStore;

#[derive(Parser)]
#[command(name = "readgate", version, about = "Admission control for AI-backed book endpoints")]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the sensitivity category of a request
    Classify {
        /// HTTP method; omitted means no method
        #[arg(short, long)]
        method: Option<String>,
        /// Request path
        path: String,
    },
    /// Create the counter table
    Migrate,
    /// Sweep expired counters until interrupted
    Sweep {
        /// Lower bound on the time between sweeps, in seconds
        #[arg(long, default_value_t = 60)]
        min_period_secs: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn connect(config: &ReadgateConfig) -> anyhow::Result<PostgresCounterStore> {
    let url = config
        .database
        .url
        .as_deref()
        .context("database.url is not configured")?;

    let store = PostgresCounterStore::connect(
        url,
        config.database.max_connections,
        config.database.acquire_timeout(),
    )
    .await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ReadgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Command::Classify { method, path } => {
            let category = RequestClassifier::new().classify(method.as_deref(), &path);
            println!("{}", category);
        }
        Command::Migrate => {
            let store = connect(&config).await?;
            store.ensure_schema().await?;
            info!("Counter schema is up to date");
        }
        Command::Sweep { min_period_secs } => {
            info!("Starting Readgate retention sweeper");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));

            let store = Arc::new(connect(&config).await?);
            let limiter = WindowRateLimiter::with_system_clock(store, config.limiter.clone())?;
            limiter.observe_window(config.limits.widest_window());

            let sweeper =
                RetentionSweeper::new(Arc::new(limiter), Duration::from_secs(min_period_secs));
            info!(period_secs = sweeper.period().as_secs(), "Sweeper configured");

            sweeper.run(shutdown_signal()).await;
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
