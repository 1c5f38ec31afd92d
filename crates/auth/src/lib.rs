//! `relaygate-auth` — credential verification (transport-agnostic).
//!
//! This crate knows how to check a signed credential and what a `verify-token`
//! command looks like. It knows nothing about queues or HTTP.

pub mod claims;
pub mod issuer;
pub mod service;
pub mod verifier;

pub use claims::{CredentialClaims, VerifiedToken};
pub use issuer::{IssueError, TokenIssuer};
pub use service::{VerificationService, VerifyTokenRequest};
pub use verifier::{CredentialVerifier, Hs256Verifier, VerificationError};
