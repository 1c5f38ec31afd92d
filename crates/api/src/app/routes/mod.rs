use axum::{routing::get, Router};

pub mod dev;
pub mod presence;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new().route("/presence", get(presence::get_presence))
}
