use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::{CorrelationId, MessageId};
use crate::message::{Command, Reply};

/// Body of an envelope: either a command or a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Command(Command),
    Reply(Reply),
}

/// Envelope for a command or reply, containing routing + correlation metadata.
///
/// This is the unit you publish to a queue.
///
/// Notes:
/// - `message_id` is fresh per publish; a redelivery carries the same id.
/// - `correlation_id` + `reply_to` are set on commands that expect a reply.
/// - A reply carries the `correlation_id` of the command it answers and no `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,

    /// Queue the reply must be published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,

    sent_at: DateTime<Utc>,

    message: Message,
}

impl Envelope {
    /// A command that expects a correlated reply on `reply_to`.
    pub fn request(command: Command, correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to.into()),
            sent_at: Utc::now(),
            message: Message::Command(command),
        }
    }

    /// A command nobody waits for (no reply is published).
    pub fn notification(command: Command) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: None,
            reply_to: None,
            sent_at: Utc::now(),
            message: Message::Command(command),
        }
    }

    pub fn reply(correlation_id: CorrelationId, reply: Reply) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: Some(correlation_id),
            reply_to: None,
            sent_at: Utc::now(),
            message: Message::Reply(reply),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Short label for logs (`cmd` name or reply outcome).
    pub fn label(&self) -> &str {
        match &self.message {
            Message::Command(c) => c.name(),
            Message::Reply(Reply::Success { .. }) => "reply:success",
            Message::Reply(Reply::Failure { .. }) => "reply:failure",
        }
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> ProtocolResult<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let correlation_id = CorrelationId::new();
        let env = Envelope::request(
            Command::new("verify-token", json!({ "jwt": "t" })),
            correlation_id,
            "gateway.reply.1",
        );

        let wire: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(wire["correlation_id"], json!(correlation_id.to_string()));
        assert_eq!(wire["reply_to"], json!("gateway.reply.1"));
        assert_eq!(wire["message"]["type"], json!("command"));
        assert_eq!(wire["message"]["cmd"], json!("verify-token"));
        assert_eq!(wire["message"]["payload"], json!({ "jwt": "t" }));
    }

    #[test]
    fn reply_decodes_with_outcome() {
        let correlation_id = CorrelationId::new();
        let env = Envelope::reply(correlation_id, Reply::success(json!({ "ok": true })));
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded.correlation_id(), Some(correlation_id));
        assert!(decoded.reply_to().is_none());
        assert!(matches!(decoded.message(), Message::Reply(r) if r.is_success()));
    }

    #[test]
    fn notification_has_no_reply_address() {
        let env = Envelope::notification(Command::new("get-presence", json!(null)));
        assert!(env.reply_to().is_none());
        assert!(env.correlation_id().is_none());
        assert_eq!(env.label(), "get-presence");
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let raw = json!({
            "message_id": MessageId::new(),
            "sent_at": "2024-01-01T00:00:00Z",
            "message": { "type": "event", "name": "x" }
        })
        .to_string();

        assert!(matches!(Envelope::decode(&raw), Err(ProtocolError::Malformed(_))));
    }
}
