use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::app::errors::json_error;
use crate::context::CredentialContext;
use crate::guard::{AuthorizationGuard, Decision, InboundRequest};

#[derive(Clone)]
pub struct AuthState {
    pub guard: Arc<AuthorizationGuard>,
}

/// Run the guard on every request; 401 on deny.
///
/// The response body is the same for every deny reason.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let decision = state.guard.authorize(&InboundRequest::http(req.headers())).await;

    match decision {
        Decision::Allow(token) => {
            req.extensions_mut().insert(CredentialContext::from(token));
            next.run(req).await
        }
        Decision::Deny(_) => unauthorized(),
    }
}

pub fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", "authorization required")
}
