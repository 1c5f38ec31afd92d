//! Authorization guard: a blocking allow/deny over an asynchronous authority.
//!
//! ```text
//! InboundRequest
//!   ↓  wrong transport / no header / not "Bearer <token>"  → Deny (no call made)
//! call(auth_queue, verify-token { jwt }, timeout)
//!   ↓  TimedOut / client error                              → Deny
//!   ↓  failure(*)                                           → Deny
//!   ↓  success { expiry }                                   → Allow iff now < expiry
//! ```
//!
//! Every path ends in a [`Decision`]; nothing here returns an error or panics
//! into the request pipeline. The deny reason is for logs only and must not be
//! shown to the caller.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use relaygate_auth::{VerifiedToken, VerifyTokenRequest};
use relaygate_channel::{CallError, CommandSender};
use relaygate_core::{Command, FailureKind, Reply, VERIFY_TOKEN};

/// Transport an inbound request arrived on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    Rpc,
    WebSocket,
}

/// The parts of an inbound request the guard looks at.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub kind: TransportKind,
    pub headers: &'a HeaderMap,
}

impl<'a> InboundRequest<'a> {
    pub fn new(kind: TransportKind, headers: &'a HeaderMap) -> Self {
        Self { kind, headers }
    }

    pub fn http(headers: &'a HeaderMap) -> Self {
        Self::new(TransportKind::Http, headers)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DenyReason {
    #[error("unexpected transport {0:?}")]
    UnexpectedTransport(TransportKind),

    #[error("no authorization header")]
    MissingHeader,

    #[error("authorization header is not 'Bearer <token>'")]
    MalformedHeader,

    #[error("authority did not answer in time")]
    TimedOut,

    #[error("authority unreachable: {0}")]
    Unavailable(String),

    #[error("credential rejected ({0})")]
    Rejected(FailureKind),

    #[error("unreadable verification reply")]
    MalformedReply,

    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(VerifiedToken),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Queue of the credential verification service.
    pub auth_queue: String,
    /// Budget for one verification call.
    pub timeout: Duration,
    /// Only requests of this kind can be authorized.
    pub expected: TransportKind,
}

impl GuardConfig {
    pub fn new(auth_queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            auth_queue: auth_queue.into(),
            timeout,
            expected: TransportKind::Http,
        }
    }

    pub fn with_expected(mut self, kind: TransportKind) -> Self {
        self.expected = kind;
        self
    }
}

pub struct AuthorizationGuard {
    sender: Arc<dyn CommandSender>,
    config: GuardConfig,
}

impl AuthorizationGuard {
    pub fn new(sender: Arc<dyn CommandSender>, config: GuardConfig) -> Self {
        Self { sender, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Decide on `request`, comparing the expiry against the clock at the
    /// moment the reply arrives.
    pub async fn authorize(&self, request: &InboundRequest<'_>) -> Decision {
        self.decide(request, Utc::now).await
    }

    /// Decide on `request` against a fixed `now`.
    pub async fn authorize_at(&self, request: &InboundRequest<'_>, now: DateTime<Utc>) -> Decision {
        self.decide(request, move || now).await
    }

    #[instrument(skip_all, fields(transport = ?request.kind))]
    async fn decide<C>(&self, request: &InboundRequest<'_>, clock: C) -> Decision
    where
        C: FnOnce() -> DateTime<Utc>,
    {
        let decision = match self.check(request, clock).await {
            Ok(token) => Decision::Allow(token),
            Err(reason) => Decision::Deny(reason),
        };

        match &decision {
            Decision::Allow(token) => debug!(subject = ?token.subject, "request authorized"),
            Decision::Deny(reason) => info!(reason = %reason, "request denied"),
        }
        decision
    }

    async fn check<C>(&self, request: &InboundRequest<'_>, clock: C) -> Result<VerifiedToken, DenyReason>
    where
        C: FnOnce() -> DateTime<Utc>,
    {
        if request.kind != self.config.expected {
            return Err(DenyReason::UnexpectedTransport(request.kind));
        }

        let token = extract_bearer(request.headers)?;

        let payload = serde_json::to_value(VerifyTokenRequest::new(token))
            .map_err(|_| DenyReason::MalformedHeader)?;
        let reply = self
            .sender
            .call(
                &self.config.auth_queue,
                Command::new(VERIFY_TOKEN, payload),
                self.config.timeout,
            )
            .await
            .map_err(|e| match e {
                CallError::TimedOut { .. } => DenyReason::TimedOut,
                other => DenyReason::Unavailable(other.to_string()),
            })?;

        let verified = interpret(reply)?;

        let now = clock();
        if verified.is_valid_at(now) {
            Ok(verified)
        } else {
            Err(DenyReason::Expired(verified.expiry))
        }
    }
}

fn interpret(reply: Reply) -> Result<VerifiedToken, DenyReason> {
    match reply {
        Reply::Success { value } => {
            serde_json::from_value(value).map_err(|_| DenyReason::MalformedReply)
        }
        Reply::Failure { kind, .. } => Err(DenyReason::Rejected(kind)),
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
///
/// The scheme is matched case-insensitively; the token must be a single
/// non-empty segment.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, DenyReason> {
    let header = headers.get(AUTHORIZATION).ok_or(DenyReason::MissingHeader)?;
    let header = header.to_str().map_err(|_| DenyReason::MalformedHeader)?;

    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or(DenyReason::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(DenyReason::MalformedHeader);
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(DenyReason::MalformedHeader);
    }
    Ok(token)
}
