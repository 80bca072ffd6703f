use anyhow::{Context, Result};
use chart_sync_service::{runtime, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,chart_sync_service=debug,stream_transport=debug".into()
    });
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting chart-sync-service");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        brokers = %config.transport.bootstrap_servers(),
        producer_mode = %config.producer_mode,
        consumer_group = %config.consumer_group,
        "Configuration loaded"
    );

    runtime::run(config).await
}
