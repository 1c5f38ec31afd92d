//! Gateway wiring: broker connection, RPC client, guard, and (in single-process
//! mode) the services themselves.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tracing::info;

use relaygate_auth::TokenIssuer;
use relaygate_channel::{CallError, CommandChannel, CommandSender, PendingSnapshot, RpcClient, RpcConfig};
use relaygate_core::{Command, Reply};
use relaygate_infra::{DispatcherHandle, RelayConfig};

use crate::guard::{AuthorizationGuard, GuardConfig};

/// What route handlers need to reach the services.
pub struct AppServices {
    rpc: Arc<RpcClient>,
    pub auth_queue: String,
    pub presence_queue: String,
    pub rpc_timeout: Duration,
}

impl AppServices {
    pub fn new(rpc: Arc<RpcClient>, config: &RelayConfig) -> Self {
        Self {
            rpc,
            auth_queue: config.auth_queue.clone(),
            presence_queue: config.presence_queue.clone(),
            rpc_timeout: config.rpc_timeout,
        }
    }

    pub fn sender(&self) -> Arc<dyn CommandSender> {
        self.rpc.clone()
    }

    /// Call a service with the configured timeout.
    pub async fn call(&self, queue: &str, command: Command) -> Result<Reply, CallError> {
        self.rpc.call(queue, command, self.rpc_timeout).await
    }

    pub fn rpc_stats(&self) -> PendingSnapshot {
        self.rpc.stats()
    }
}

/// A running gateway and everything it owns.
pub struct Gateway {
    services: Arc<AppServices>,
    guard: Arc<AuthorizationGuard>,
    issuer: Option<Arc<TokenIssuer>>,
    dispatchers: Vec<DispatcherHandle>,
}

impl Gateway {
    /// Connect to the configured broker and start the gateway on it.
    pub async fn start(config: &RelayConfig) -> anyhow::Result<Self> {
        let channel = relaygate_infra::connect(config)
            .await
            .context("failed to connect to broker")?;
        Self::start_on(channel, config).await
    }

    /// Start on an already-open channel.
    ///
    /// With an embedded broker the auth and presence services are started on
    /// the same channel, and `/dev/token` is mounted.
    pub async fn start_on(channel: Arc<dyn CommandChannel>, config: &RelayConfig) -> anyhow::Result<Self> {
        let dispatchers = if config.is_embedded() {
            let handles = relaygate_services::start_embedded(Arc::clone(&channel), config)
                .await
                .context("failed to start embedded services")?;
            info!(services = handles.len(), "embedded services started");
            handles
        } else {
            Vec::new()
        };

        let rpc = RpcClient::connect(channel, RpcConfig::default().with_reply_prefix("relaygate.gateway"))
            .await
            .context("failed to open rpc reply queue")?;
        let rpc = Arc::new(rpc);

        let services = Arc::new(AppServices::new(Arc::clone(&rpc), config));
        let guard = Arc::new(AuthorizationGuard::new(
            services.sender(),
            GuardConfig::new(config.auth_queue.clone(), config.rpc_timeout),
        ));
        let issuer = config
            .is_embedded()
            .then(|| Arc::new(TokenIssuer::new(&config.jwt_secret)));

        Ok(Self {
            services,
            guard,
            issuer,
            dispatchers,
        })
    }

    pub fn router(&self) -> Router {
        super::build_app(
            Arc::clone(&self.services),
            Arc::clone(&self.guard),
            self.issuer.clone(),
        )
    }

    pub fn services(&self) -> &Arc<AppServices> {
        &self.services
    }

    /// Delete the reply queue and stop any embedded services.
    pub async fn shutdown(self) {
        self.services.rpc.close().await;
        for dispatcher in self.dispatchers {
            let stats = dispatcher.shutdown().await;
            info!(stats = ?stats, "embedded dispatcher stopped");
        }
    }
}
