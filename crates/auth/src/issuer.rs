//! Credential signing.
//!
//! Login (user lookup, password checks) lives elsewhere; this only mints the
//! token once an identity has been established. The gateway's embedded mode
//! and the tests use it.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use thiserror::Error;

use crate::claims::CredentialClaims;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssueError {
    #[error("credential lifetime must be positive")]
    NonPositiveLifetime,

    #[error("credential lifetime is out of range")]
    LifetimeOutOfRange,

    #[error("failed to sign credential: {0}")]
    Signing(String),
}

#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_ref()),
        }
    }

    /// Sign a credential for `subject` valid for `lifetime` from now.
    pub fn issue(&self, subject: &str, lifetime: Duration) -> Result<String, IssueError> {
        if lifetime <= Duration::zero() {
            return Err(IssueError::NonPositiveLifetime);
        }
        let expiry = Utc::now()
            .checked_add_signed(lifetime)
            .ok_or(IssueError::LifetimeOutOfRange)?;
        self.issue_with_expiry(subject, expiry)
    }

    /// Sign a credential with an explicit expiry (which may be in the past).
    pub fn issue_with_expiry(
        &self,
        subject: &str,
        expiry: DateTime<Utc>,
    ) -> Result<String, IssueError> {
        let claims = CredentialClaims {
            sub: Some(subject.to_string()),
            iat: Some(Utc::now().timestamp()),
            exp: expiry.timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| IssueError::Signing(e.to_string()))
    }
}

impl core::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}
