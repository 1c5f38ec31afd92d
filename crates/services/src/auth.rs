use std::sync::Arc;

use relaygate_auth::{CredentialVerifier, Hs256Verifier, VerificationService};
use relaygate_core::VERIFY_TOKEN;
use relaygate_infra::DispatchTable;

/// Dispatch table of the authentication service.
pub fn table(verifier: Arc<dyn CredentialVerifier>) -> DispatchTable {
    let service = VerificationService::new(verifier);
    DispatchTable::new().register_fn(VERIFY_TOKEN, move |command| {
        let service = service.clone();
        async move { service.handle(&command) }
    })
}

/// Table for an HS256 shared secret.
pub fn hs256_table(secret: &str) -> DispatchTable {
    table(Arc::new(Hs256Verifier::new(secret)))
}
