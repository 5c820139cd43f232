//! Settlement node binary
//!
//! Usage: `settlement-node [config.toml]`. Without a path the configuration
//! comes from `FREIGHT_*` environment variables.

use anyhow::Context;
use chrono::Utc;
use freight_settlement::{config::LoggingConfig, Config, SettlementEngine};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FREIGHT_CONFIG").ok());

    match path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path)),
        None => Config::from_env().context("loading configuration from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    tracing::info!(
        data_dir = %config.ledger.data_dir.display(),
        "Starting freight settlement node"
    );

    let engine = SettlementEngine::open(config)
        .await
        .context("opening settlement engine")?;

    let mut purge = interval(PURGE_INTERVAL);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = purge.tick() => {
                if let Err(e) = engine.purge_idempotency(Utc::now()).await {
                    tracing::warn!(error = %e, "Idempotency purge failed");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down settlement node");
    engine.shutdown().await;
    Ok(())
}
