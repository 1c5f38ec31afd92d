use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use relaygate_channel::PendingSnapshot;

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Pending-call counters of the gateway's RPC client.
pub async fn rpc_stats(Extension(services): Extension<Arc<AppServices>>) -> Json<PendingSnapshot> {
    Json(services.rpc_stats())
}
