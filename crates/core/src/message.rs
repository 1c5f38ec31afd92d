//! Commands and replies (the request/reply payloads).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Command answered by the authentication service: verify a bearer credential.
pub const VERIFY_TOKEN: &str = "verify-token";

/// Command answered by the presence service.
pub const GET_PRESENCE: &str = "get-presence";

/// A named request sent over a queue.
///
/// `cmd` is the routing key; the receiving dispatcher matches it exactly
/// against its handler table. Wire shape: `{ "cmd": "...", "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    cmd: String,
    #[serde(default)]
    payload: JsonValue,
}

impl Command {
    pub fn new(cmd: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            cmd: cmd.into(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.cmd
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload into a handler-specific input type.
    ///
    /// A payload that does not fit `T` is an `InvalidPayload` failure for the caller.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CommandError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CommandError::invalid_payload(format!("{}: {e}", self.cmd)))
    }
}

/// Discriminator of a failure reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler is registered for the command name.
    UnknownCommand,
    /// The handler failed (returned an error or panicked).
    HandlerError,
    /// The payload did not match what the handler expects.
    InvalidPayload,
    /// The credential to verify was absent or empty.
    MissingCredential,
    /// The credential failed signature or structural checks.
    InvalidCredential,
    /// The message exceeded its delivery budget and was moved to the dead-letter queue.
    DeadLettered,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::UnknownCommand => "unknown_command",
            FailureKind::HandlerError => "handler_error",
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::MissingCredential => "missing_credential",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::DeadLettered => "dead_lettered",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported back to a caller.
///
/// Handlers return this instead of acknowledging or replying themselves; the
/// dispatcher turns it into `Reply::Failure`.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: FailureKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_command(cmd: &str) -> Self {
        Self::new(FailureKind::UnknownCommand, format!("no handler for '{cmd}'"))
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerError, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidPayload, message)
    }

    pub fn missing_credential(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MissingCredential, message)
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidCredential, message)
    }

    pub fn dead_lettered(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DeadLettered, message)
    }
}

/// The single response correlated to a command.
///
/// Wire shape: `{ "outcome": "success", "value": ... }` or
/// `{ "outcome": "failure", "kind": "...", "message": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reply {
    Success { value: JsonValue },
    Failure { kind: FailureKind, message: String },
}

impl Reply {
    pub fn success(value: JsonValue) -> Self {
        Reply::Success { value }
    }

    pub fn failure(error: CommandError) -> Self {
        Reply::Failure {
            kind: error.kind,
            message: error.message,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Reply::Success { .. } => None,
            Reply::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn into_result(self) -> Result<JsonValue, CommandError> {
        match self {
            Reply::Success { value } => Ok(value),
            Reply::Failure { kind, message } => Err(CommandError { kind, message }),
        }
    }
}

impl From<Result<JsonValue, CommandError>> for Reply {
    fn from(value: Result<JsonValue, CommandError>) -> Self {
        match value {
            Ok(v) => Reply::success(v),
            Err(e) => Reply::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn command_wire_shape_uses_cmd_key() {
        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": "abc" }));
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire, json!({ "cmd": "verify-token", "payload": { "jwt": "abc" } }));
    }

    #[test]
    fn command_without_payload_decodes_to_null() {
        let cmd: Command = serde_json::from_value(json!({ "cmd": "get-presence" })).unwrap();
        assert_eq!(cmd.name(), GET_PRESENCE);
        assert!(cmd.payload().is_null());
    }

    #[test]
    fn failure_reply_carries_kind_discriminator() {
        let reply = Reply::failure(CommandError::missing_credential("token is missing"));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            wire,
            json!({ "outcome": "failure", "kind": "missing_credential", "message": "token is missing" })
        );
    }

    #[test]
    fn decode_payload_mismatch_is_invalid_payload() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Input {
            jwt: String,
        }

        let cmd = Command::new(VERIFY_TOKEN, json!({ "jwt": 42 }));
        let err = cmd.decode_payload::<Input>().unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidPayload);
    }

    #[test]
    fn into_result_preserves_failure() {
        let reply = Reply::failure(CommandError::unknown_command("nope"));
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, FailureKind::UnknownCommand);
        assert_eq!(err.message, "no handler for 'nope'");
    }

    fn any_kind() -> impl Strategy<Value = FailureKind> {
        prop_oneof![
            Just(FailureKind::UnknownCommand),
            Just(FailureKind::HandlerError),
            Just(FailureKind::InvalidPayload),
            Just(FailureKind::MissingCredential),
            Just(FailureKind::InvalidCredential),
            Just(FailureKind::DeadLettered),
        ]
    }

    proptest! {
        #[test]
        fn kind_wire_name_matches_as_str(kind in any_kind()) {
            let wire = serde_json::to_value(kind).unwrap();
            prop_assert_eq!(wire, json!(kind.as_str()));
        }
    }
}
