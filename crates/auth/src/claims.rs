use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registered claims carried by a credential.
///
/// Only `exp` is required; tokens minted elsewhere may carry extra claims,
/// which are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Subject (user or service the credential was issued to).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Issued-at, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

impl CredentialClaims {
    /// The expiry as an instant, or `None` when `exp` is out of range.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Success value of a `verify-token` reply.
///
/// The verification service does not judge expiry; whoever holds the reply
/// compares `expiry` against its own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedToken {
    pub expiry: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl VerifiedToken {
    pub fn new(expiry: DateTime<Utc>) -> Self {
        Self {
            expiry,
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Strict comparison: a credential expiring exactly at `now` is not valid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }
}
