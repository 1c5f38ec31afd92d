use anyhow::Context;

use relaygate_api::app::Gateway;
use relaygate_infra::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaygate_observability::init();

    let config = RelayConfig::from_env().context("invalid configuration")?;
    let gateway = Gateway::start(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.gateway_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.gateway_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    gateway.shutdown().await;
    Ok(())
}
