use chrono::{DateTime, Utc};

use relaygate_auth::VerifiedToken;

/// Credential context for an authorized request.
///
/// Inserted by the guard middleware; present on every protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialContext {
    subject: Option<String>,
    expiry: DateTime<Utc>,
}

impl CredentialContext {
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }
}

impl From<VerifiedToken> for CredentialContext {
    fn from(token: VerifiedToken) -> Self {
        Self {
            subject: token.subject,
            expiry: token.expiry,
        }
    }
}
