//! Wiring a dispatch table to its queue, and the service process lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use relaygate_channel::CommandChannel;
use relaygate_core::QueueBinding;
use relaygate_infra::{
    CommandDispatcher, DispatchError, DispatchTable, DispatcherConfig, DispatcherHandle,
    RelayConfig,
};

use crate::{auth, presence};

/// The services this crate can run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Service {
    Auth,
    Presence,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Auth => "auth",
            Service::Presence => "presence",
        }
    }

    pub fn binding(&self, config: &RelayConfig) -> QueueBinding {
        match self {
            Service::Auth => config.auth_binding(),
            Service::Presence => config.presence_binding(),
        }
    }

    pub fn table(&self, config: &RelayConfig) -> DispatchTable {
        match self {
            Service::Auth => auth::hs256_table(&config.jwt_secret),
            Service::Presence => presence::table(),
        }
    }
}

/// Start a dispatcher for `table` on `binding` with the configured limits.
pub async fn start_dispatcher(
    channel: Arc<dyn CommandChannel>,
    binding: QueueBinding,
    table: DispatchTable,
    config: &RelayConfig,
) -> Result<DispatcherHandle, DispatchError> {
    let dispatcher_config = DispatcherConfig::new(binding)
        .with_max_concurrent(config.dispatch_concurrency)
        .with_max_deliveries(config.max_deliveries);

    CommandDispatcher::new(channel, table, dispatcher_config)
        .start()
        .await
}

/// Start every service on one channel (single-process deployments, tests).
pub async fn start_embedded(
    channel: Arc<dyn CommandChannel>,
    config: &RelayConfig,
) -> Result<Vec<DispatcherHandle>, DispatchError> {
    let mut handles = Vec::new();
    for service in [Service::Auth, Service::Presence] {
        let handle = start_dispatcher(
            Arc::clone(&channel),
            service.binding(config),
            service.table(config),
            config,
        )
        .await?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Run one service until Ctrl-C (entrypoint of the service binaries).
pub async fn serve(service: Service) -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid configuration")?;

    if config.is_embedded() {
        warn!(
            service = service.name(),
            "in-process broker selected; no other process can reach this service"
        );
    }

    let channel = relaygate_infra::connect(&config)
        .await
        .context("failed to connect to broker")?;

    let binding = service.binding(&config);
    let handle = start_dispatcher(channel, binding.clone(), service.table(&config), &config)
        .await
        .with_context(|| format!("failed to start dispatcher on '{}'", binding.name))?;

    info!(service = service.name(), queue = %binding.name, "service ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!(service = service.name(), "shutting down");
    let stats = handle.shutdown().await;
    info!(service = service.name(), stats = ?stats, "service stopped");

    Ok(())
}
