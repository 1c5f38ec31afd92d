use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use relaygate_core::{Command, CommandError, GET_PRESENCE};
use relaygate_infra::DispatchTable;

/// Optional payload of `get-presence`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceQuery {
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub service: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub checked_at: DateTime<Utc>,
}

pub fn table() -> DispatchTable {
    DispatchTable::new().register_fn(GET_PRESENCE, |command| async move { get_presence(&command) })
}

fn get_presence(command: &Command) -> Result<JsonValue, CommandError> {
    let query = if command.payload().is_null() {
        PresenceQuery::default()
    } else {
        command.decode_payload::<PresenceQuery>()?
    };

    let status = PresenceStatus {
        service: "presence".to_string(),
        status: "online".to_string(),
        subject: query.subject,
        checked_at: Utc::now(),
    };
    serde_json::to_value(status).map_err(|e| CommandError::handler(e.to_string()))
}
