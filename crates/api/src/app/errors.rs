use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use relaygate_channel::CallError;
use relaygate_core::CommandError;

/// Map a failed downstream call to a gateway response.
pub fn call_error_to_response(err: CallError) -> axum::response::Response {
    match err {
        CallError::TimedOut { .. } => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "the service did not answer in time",
        ),
        CallError::Publish(_) | CallError::Closed => json_error(
            StatusCode::BAD_GATEWAY,
            "upstream_unavailable",
            "the service could not be reached",
        ),
    }
}

/// Map a failure reply to a gateway response; only the kind is exposed.
pub fn command_error_to_response(err: CommandError) -> axum::response::Response {
    json_error(
        StatusCode::BAD_GATEWAY,
        "upstream_failure",
        err.kind.as_str(),
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
