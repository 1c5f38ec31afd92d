//! HTTP gateway: authorization guard, middleware and routing.

pub mod app;
pub mod context;
pub mod guard;
pub mod middleware;

pub use guard::{AuthorizationGuard, Decision, DenyReason, GuardConfig, InboundRequest, TransportKind};
