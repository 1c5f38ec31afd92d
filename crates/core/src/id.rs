//! Strongly-typed identifiers used on the wire.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Declares a UUIDv7 id that travels on the wire as its bare hyphenated string.
///
/// Parse errors name the id kind so a bad header or stream field is easy to trace.
macro_rules! wire_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh id; v7 ids sort by creation time in logs and streams.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::try_parse(s.trim())
                    .map(Self)
                    .map_err(|e| ProtocolError::invalid_id(format!("{}: {e}", stringify!($name))))
            }
        }
    };
}

wire_id! {
    /// Identifier of a single published envelope (one per publish, never reused).
    ///
    /// Redeliveries and dead-letter copies keep it, so it is the deduplication key.
    MessageId
}

wire_id! {
    /// Links a command to the reply it produces.
    ///
    /// Generated by the caller for each call; a reply carries the same value back.
    CorrelationId
}
