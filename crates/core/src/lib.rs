//! `relaygate-core` — message model shared by every relaygate crate.
//!
//! This crate contains **pure protocol** types (no transport or runtime concerns):
//! commands, replies, envelopes, identifiers and queue bindings.

pub mod envelope;
pub mod error;
pub mod id;
pub mod message;
pub mod queue;

pub use envelope::{Envelope, Message};
pub use error::{ProtocolError, ProtocolResult};
pub use id::{CorrelationId, MessageId};
pub use message::{Command, CommandError, FailureKind, Reply, GET_PRESENCE, VERIFY_TOKEN};
pub use queue::{DEAD_LETTER_SUFFIX, QueueBinding};
