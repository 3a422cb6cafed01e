use anyhow::Context;
use rota_worker::Services;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rota_worker=debug,rota_schedule=info,rota_match=info,rota_store=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = rota_store::Config::load().context("Failed to load config")?;
    tracing::info!(backend = ?config.store.backend, "Starting Rota worker");

    let services = Services::from_config(&config).await?;
    let mut runner = services.task_runner(&config).await?;
    runner.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    runner.stop().await;

    Ok(())
}
