//! The guard against a real authentication service over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use chrono::{Duration as ChronoDuration, DurationRound, Utc};

use relaygate_api::{AuthorizationGuard, Decision, DenyReason, GuardConfig, InboundRequest};
use relaygate_auth::TokenIssuer;
use relaygate_channel::{CommandChannel, InMemoryChannel, RpcClient, RpcConfig};
use relaygate_infra::{DispatcherHandle, RelayConfig};

const SECRET: &str = "scenario-secret";

struct Harness {
    broker: InMemoryChannel,
    rpc: Arc<RpcClient>,
    guard: AuthorizationGuard,
    dispatchers: Vec<DispatcherHandle>,
}

impl Harness {
    async fn start(timeout: Duration) -> Self {
        let config = RelayConfig::from_lookup(|k| match k {
            "BROKER_URL" => Some("memory://".to_string()),
            "JWT_SECRET" => Some(SECRET.to_string()),
            _ => None,
        })
        .unwrap();

        let broker = InMemoryChannel::new();
        let channel: Arc<dyn CommandChannel> = Arc::new(broker.clone());
        let dispatchers = relaygate_services::start_embedded(Arc::clone(&channel), &config)
            .await
            .unwrap();
        let rpc = Arc::new(RpcClient::connect(channel, RpcConfig::default()).await.unwrap());
        let guard = AuthorizationGuard::new(rpc.clone(), GuardConfig::new(config.auth_queue.clone(), timeout));

        Self {
            broker,
            rpc,
            guard,
            dispatchers,
        }
    }

    async fn stop(self) {
        self.rpc.close().await;
        for d in self.dispatchers {
            d.shutdown().await;
        }
    }
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
    headers
}

#[tokio::test]
async fn credential_valid_for_an_hour_is_allowed() {
    let h = Harness::start(Duration::from_secs(2)).await;
    let now = Utc::now().duration_trunc(ChronoDuration::seconds(1)).unwrap();
    let expiry = now + ChronoDuration::seconds(3600);
    let token = TokenIssuer::new(SECRET).issue_with_expiry("alice", expiry).unwrap();

    let decision = h.guard.authorize_at(&InboundRequest::http(&bearer(&token)), now).await;

    match decision {
        Decision::Allow(verified) => {
            assert_eq!(verified.expiry, expiry);
            assert_eq!(verified.subject.as_deref(), Some("alice"));
        }
        other => panic!("expected allow, got {other:?}"),
    }
    h.stop().await;
}

#[tokio::test]
async fn credential_expired_ten_seconds_ago_is_denied() {
    let h = Harness::start(Duration::from_secs(2)).await;
    let now = Utc::now().duration_trunc(ChronoDuration::seconds(1)).unwrap();
    let expiry = now - ChronoDuration::seconds(10);
    let token = TokenIssuer::new(SECRET).issue_with_expiry("alice", expiry).unwrap();

    let decision = h.guard.authorize_at(&InboundRequest::http(&bearer(&token)), now).await;

    assert_eq!(decision, Decision::Deny(DenyReason::Expired(expiry)));
    h.stop().await;
}

#[tokio::test]
async fn wrong_scheme_is_denied_without_a_call() {
    let h = Harness::start(Duration::from_secs(2)).await;
    let published_before = h.broker.published_count();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
    let decision = h.guard.authorize(&InboundRequest::http(&headers)).await;

    assert_eq!(decision, Decision::Deny(DenyReason::MalformedHeader));
    assert_eq!(h.broker.published_count(), published_before);
    assert_eq!(h.rpc.stats().registered, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn broker_outage_denies_after_the_call_timeout() {
    let h = Harness::start(Duration::from_secs(2)).await;
    let token = TokenIssuer::new(SECRET)
        .issue("alice", ChronoDuration::hours(1))
        .unwrap();
    h.broker.disconnect();

    let started = tokio::time::Instant::now();
    let decision = h.guard.authorize(&InboundRequest::http(&bearer(&token))).await;
    let elapsed = started.elapsed();

    assert_eq!(decision, Decision::Deny(DenyReason::TimedOut));
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2200), "blocked too long: {elapsed:?}");
    assert_eq!(h.rpc.stats().in_flight, 0);

    h.broker.reconnect();
    h.stop().await;
}
