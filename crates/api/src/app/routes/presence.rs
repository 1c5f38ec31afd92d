use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};
use serde_json::json;

use relaygate_core::{Command, GET_PRESENCE};

use crate::app::errors::{call_error_to_response, command_error_to_response};
use crate::app::services::AppServices;
use crate::context::CredentialContext;

/// Forward `get-presence` to the presence service on behalf of the caller.
pub async fn get_presence(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(credential): Extension<CredentialContext>,
) -> axum::response::Response {
    let command = Command::new(GET_PRESENCE, json!({ "subject": credential.subject() }));

    match services.call(&services.presence_queue, command).await {
        Ok(reply) => match reply.into_result() {
            Ok(value) => Json(value).into_response(),
            Err(err) => command_error_to_response(err),
        },
        Err(err) => call_error_to_response(err),
    }
}
