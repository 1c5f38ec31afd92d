//! Signature checking and claim decoding.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::claims::{CredentialClaims, VerifiedToken};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no credential presented")]
    Missing,

    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// Checks a credential and returns what the caller needs to decide on it.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedToken, VerificationError>;
}

/// HMAC-SHA256 verifier with a shared secret.
///
/// Expiry is decoded but not enforced here; see [`VerifiedToken::is_valid_at`].
#[derive(Clone)]
pub struct Hs256Verifier {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }
}

impl core::fmt::Debug for Hs256Verifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hs256Verifier").finish_non_exhaustive()
    }
}

impl CredentialVerifier for Hs256Verifier {
    fn verify(&self, token: &str) -> Result<VerifiedToken, VerificationError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VerificationError::Missing);
        }

        let data = jsonwebtoken::decode::<CredentialClaims>(token, &self.key, &self.validation)
            .map_err(|e| VerificationError::Invalid(describe(e.kind())))?;

        let claims = data.claims;
        let expiry = claims
            .expiry()
            .ok_or_else(|| VerificationError::Invalid("expiry out of range".to_string()))?;

        let verified = VerifiedToken::new(expiry);
        Ok(match claims.sub {
            Some(sub) => verified.with_subject(sub),
            None => verified,
        })
    }
}

fn describe(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::InvalidSignature => "signature mismatch".to_string(),
        ErrorKind::InvalidAlgorithm => "unexpected signing algorithm".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing claim '{claim}'"),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
            "malformed token".to_string()
        }
        ErrorKind::Json(_) => "malformed claims".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::TokenIssuer;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn valid_token_yields_expiry_and_subject() {
        let issuer = TokenIssuer::new(SECRET);
        let token = issuer.issue("user-7", Duration::minutes(10)).unwrap();

        let verified = Hs256Verifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(verified.subject.as_deref(), Some("user-7"));
        assert!(verified.expiry > Utc::now());
    }

    #[test]
    fn expired_token_still_verifies() {
        let issuer = TokenIssuer::new(SECRET);
        let expiry = Utc::now() - Duration::hours(1);
        let token = issuer.issue_with_expiry("user-7", expiry).unwrap();

        let verified = Hs256Verifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(verified.expiry.timestamp(), expiry.timestamp());
        assert!(!verified.is_valid_at(Utc::now()));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = TokenIssuer::new("other-secret")
            .issue("user-7", Duration::minutes(10))
            .unwrap();

        let err = Hs256Verifier::new(SECRET).verify(&token).unwrap_err();
        assert_eq!(err, VerificationError::Invalid("signature mismatch".into()));
    }

    #[test]
    fn garbage_is_invalid() {
        let err = Hs256Verifier::new(SECRET).verify("not-a-jwt").unwrap_err();
        assert!(matches!(err, VerificationError::Invalid(_)));
    }

    #[test]
    fn blank_token_is_missing() {
        assert_eq!(
            Hs256Verifier::new(SECRET).verify("   ").unwrap_err(),
            VerificationError::Missing
        );
    }

    #[test]
    fn token_without_exp_is_invalid() {
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &serde_json::json!({ "sub": "user-7" }),
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let err = Hs256Verifier::new(SECRET).verify(&token).unwrap_err();
        assert!(matches!(err, VerificationError::Invalid(_)));
    }

    proptest! {
        #[test]
        fn signed_token_verifies_to_its_own_claims(
            subject in "[a-z0-9-]{1,24}",
            exp in 1i64..4_000_000_000i64,
        ) {
            let expiry = DateTime::from_timestamp(exp, 0).unwrap();
            let token = TokenIssuer::new(SECRET).issue_with_expiry(&subject, expiry).unwrap();

            let verified = Hs256Verifier::new(SECRET).verify(&token).unwrap();
            prop_assert_eq!(verified.expiry, expiry);
            prop_assert_eq!(verified.subject, Some(subject));
        }

        #[test]
        fn arbitrary_text_is_never_accepted(token in "[A-Za-z0-9_.=+/-]{1,128}") {
            let err = Hs256Verifier::new(SECRET).verify(&token).unwrap_err();
            prop_assert!(matches!(err, VerificationError::Invalid(_)));
        }
    }
}
