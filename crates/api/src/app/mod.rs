//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: broker, RPC client, guard and embedded services
//! - `routes/`: HTTP handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use relaygate_auth::TokenIssuer;

use crate::guard::AuthorizationGuard;
use crate::middleware;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, Gateway};

/// Build the full HTTP router.
///
/// `issuer` mounts `POST /dev/token`; pass it only for single-process setups.
pub fn build_app(
    services: Arc<AppServices>,
    guard: Arc<AuthorizationGuard>,
    issuer: Option<Arc<TokenIssuer>>,
) -> Router {
    let auth_state = middleware::AuthState { guard };

    // Protected routes: every request goes through the guard first.
    let protected = routes::router()
        .layer(Extension(Arc::clone(&services)))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    let mut public = Router::new()
        .route("/health", get(routes::system::health))
        .route("/stats/rpc", get(routes::system::rpc_stats));
    if let Some(issuer) = issuer {
        public = public
            .route("/dev/token", post(routes::dev::issue_token))
            .layer(Extension(issuer));
    }

    public.layer(Extension(services)).merge(protected)
}
