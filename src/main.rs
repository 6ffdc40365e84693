use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, TollgateConfig};
use tollgate::ratelimit::{Limiter, RateDefinition, RateSet};
use tollgate::service::AdmissionService;

/// Per-key request admission control over stdin/stdout.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate tier such as `100/sec` or `1000/hour:50`; replaces configured rates
    #[arg(short, long = "rate")]
    rates: Vec<RateDefinition>,

    /// Maximum number of keys tracked at once
    #[arg(long)]
    capacity: Option<usize>,

    /// Seconds between sweeps for idle keys (0 disables sweeping)
    #[arg(long)]
    reclaim_interval_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(secs) = args.reclaim_interval_secs {
        config.limiter.reclaim_interval_secs = secs;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Tollgate Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rates = if args.rates.is_empty() {
        config.limiter.rate_set()?
    } else {
        RateSet::from_definitions(args.rates)?
    };
    info!(rates = %rates, capacity = config.limiter.capacity, "Configuration loaded");

    let limiter = Arc::new(
        Limiter::builder(rates)
            .capacity(config.limiter.capacity)
            .build()?,
    );
    info!("Rate limiter initialized");

    if let Some(interval) = config.limiter.reclaim_interval() {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reclaimed = limiter.purge_expired();
                if reclaimed > 0 {
                    debug!(reclaimed = reclaimed, "Reclaimed idle keys");
                }
            }
        });
    }

    let service = AdmissionService::new(limiter);
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        served = service.serve(stdin, stdout) => {
            let replies = served?;
            info!(replies = replies, "Input closed");
        }
        _ = shutdown_signal() => {}
    }

    info!("Tollgate Admission Service stopped");
    Ok(())
}

fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Replies go to stdout, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
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
