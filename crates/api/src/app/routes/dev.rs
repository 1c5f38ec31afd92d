//! Credential minting for the single-process development setup.
//!
//! Only mounted when the gateway hosts the services itself (`memory://`).

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use relaygate_auth::TokenIssuer;

use crate::app::errors::json_error;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub subject: String,
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: i64,
}

fn default_lifetime_secs() -> i64 {
    3600
}

/// Longest credential this endpoint will mint.
const MAX_LIFETIME_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn issue_token(
    Extension(issuer): Extension<Arc<TokenIssuer>>,
    Json(body): Json<TokenRequest>,
) -> axum::response::Response {
    if body.lifetime_secs > MAX_LIFETIME_SECS {
        return json_error(StatusCode::BAD_REQUEST, "invalid_request", "lifetime too long");
    }
    let Some(lifetime) = Duration::try_seconds(body.lifetime_secs) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_request", "lifetime out of range");
    };

    match issuer.issue(&body.subject, lifetime) {
        Ok(token) => Json(TokenResponse { token }).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
    }
}
