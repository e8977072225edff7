use std::sync::Arc;

use anyhow::Context;

use coursegen_api::app::{build_app, services};
use coursegen_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coursegen_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();
    let shutdown_deadline = config.shutdown_deadline;

    let services = Arc::new(services::build_services(config).await?);
    let background = services.start_background();
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    let report = background.shutdown(shutdown_deadline).await;
    tracing::info!(
        finished = report.finished,
        abandoned = report.abandoned,
        "background workers stopped"
    );
    Ok(())
}
