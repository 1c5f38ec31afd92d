//! The `verify-token` command handler.
//!
//! ```text
//! { "cmd": "verify-token", "payload": { "jwt": "<token>" } }
//!   → success { "expiry": "<rfc3339>" }
//!   → failure missing_credential | invalid_credential | invalid_payload
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use relaygate_core::{Command, CommandError};

use crate::verifier::{CredentialVerifier, VerificationError};

/// Payload of a `verify-token` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTokenRequest {
    #[serde(default)]
    pub jwt: Option<String>,
}

impl VerifyTokenRequest {
    pub fn new(jwt: impl Into<String>) -> Self {
        Self {
            jwt: Some(jwt.into()),
        }
    }
}

#[derive(Clone)]
pub struct VerificationService {
    verifier: Arc<dyn CredentialVerifier>,
}

impl VerificationService {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    pub fn handle(&self, command: &Command) -> Result<JsonValue, CommandError> {
        let request = if command.payload().is_null() {
            VerifyTokenRequest::default()
        } else {
            command.decode_payload::<VerifyTokenRequest>()?
        };

        let jwt = request.jwt.unwrap_or_default();
        let verified = self.verifier.verify(&jwt).map_err(|e| {
            debug!(error = %e, "credential rejected");
            match e {
                VerificationError::Missing => CommandError::missing_credential(e.to_string()),
                VerificationError::Invalid(_) => CommandError::invalid_credential(e.to_string()),
            }
        })?;

        serde_json::to_value(&verified).map_err(|e| CommandError::handler(e.to_string()))
    }
}

impl core::fmt::Debug for VerificationService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VerificationService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hs256Verifier, TokenIssuer, VerifiedToken};
    use chrono::{Duration, Utc};
    use relaygate_core::{FailureKind, VERIFY_TOKEN};
    use serde_json::json;

    fn service() -> VerificationService {
        VerificationService::new(Arc::new(Hs256Verifier::new("svc-secret")))
    }

    fn kind(result: Result<JsonValue, CommandError>) -> FailureKind {
        result.unwrap_err().kind
    }

    #[test]
    fn missing_jwt_field() {
        let cmd = Command::new(VERIFY_TOKEN, json!({}));
        assert_eq!(kind(service().handle(&cmd)), FailureKind::MissingCredential);
    }

    #[test]
    fn null_payload_is_missing_credential() {
        let cmd = Command::new(VERIFY_TOKEN, JsonValue::Null);
        assert_eq!(kind(service().handle(&cmd)), FailureKind::MissingCredential);
    }

    #[test]
    fn empty_jwt() {
        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": "" }));
        assert_eq!(kind(service().handle(&cmd)), FailureKind::MissingCredential);
    }

    #[test]
    fn tampered_jwt() {
        let token = TokenIssuer::new("svc-secret")
            .issue("u", Duration::minutes(5))
            .unwrap();
        let tampered = format!("{}x", token);
        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": tampered }));
        assert_eq!(kind(service().handle(&cmd)), FailureKind::InvalidCredential);
    }

    #[test]
    fn wrong_payload_shape() {
        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": 42 }));
        assert_eq!(kind(service().handle(&cmd)), FailureKind::InvalidPayload);
    }

    #[test]
    fn valid_jwt_returns_expiry() {
        let expiry = Utc::now() + Duration::minutes(5);
        let token = TokenIssuer::new("svc-secret")
            .issue_with_expiry("u", expiry)
            .unwrap();
        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": token }));

        let value = service().handle(&cmd).unwrap();
        let verified: VerifiedToken = serde_json::from_value(value).unwrap();
        assert_eq!(verified.expiry.timestamp(), expiry.timestamp());
    }
}
