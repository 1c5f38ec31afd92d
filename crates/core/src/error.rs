//! Protocol error model.

use thiserror::Error;

/// Result type used for wire-level operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Wire-level error.
///
/// Covers failures to read or write the message schema itself. Failures a
/// handler reports back to a caller are `CommandError`s carried inside a `Reply`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// An envelope could not be decoded (not JSON, missing fields, unknown type).
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
