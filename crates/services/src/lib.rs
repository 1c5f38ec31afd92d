//! `relaygate-services` — the services that answer commands.
//!
//! - `auth`: `verify-token`, backed by [`relaygate_auth::VerificationService`]
//! - `presence`: `get-presence`
//!
//! Each module builds a static dispatch table; `runner` wires a table to a
//! queue and keeps it running.

pub mod auth;
pub mod presence;
pub mod runner;

pub use runner::{Service, serve, start_dispatcher, start_embedded};
