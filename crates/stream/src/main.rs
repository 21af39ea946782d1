use anyhow::Context;

use petstore_infra::StreamConfig;
use petstore_stream::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    petstore_observability::init();

    let config = StreamConfig::from_env().context("invalid configuration")?;
    let handle = app::start_from_config(&config)
        .await
        .context("failed to start the stream service")?;

    let stats = handle
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c; shutting down");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    tracing::info!(?stats, "stream service stopped");
    Ok(())
}
