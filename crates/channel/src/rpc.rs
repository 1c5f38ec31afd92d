//! Request/reply over a command channel.
//!
//! `RpcClient::call` turns a fire-and-forget publish into a correlated,
//! timeout-bounded call:
//!
//! ```text
//! call(queue, command, timeout)
//!   ↓
//! 1. Register a pending call (fresh correlation ID)
//!   ↓
//! 2. Publish the command with `reply_to` = this client's private reply queue
//!   ↓
//! 3. Await the reply, racing the timeout
//!   ↓
//! reply listener ── reply with matching correlation ID ──▶ caller resumes
//! ```
//!
//! Transport failures while publishing are retried until the call's deadline,
//! so callers only ever observe them as `CallError::TimedOut`. A reply that
//! arrives after its call timed out is discarded by the pending-call table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use relaygate_core::{Command, Envelope, Message, QueueBinding, Reply};

use crate::channel::{ChannelError, CommandChannel, Subscription};
use crate::pending::{PendingCalls, PendingSnapshot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No reply arrived within the call's budget (includes broker outages).
    #[error("no reply to '{cmd}' within {timeout:?}")]
    TimedOut { cmd: String, timeout: Duration },

    /// The command could not be published for a non-transport reason.
    #[error("publish failed: {0}")]
    Publish(ChannelError),

    /// The client was closed while the call was waiting.
    #[error("rpc client closed")]
    Closed,
}

/// Anything that can send a command and wait for its correlated reply.
///
/// The authorization guard depends on this seam rather than on `RpcClient`
/// directly.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn call(&self, queue: &str, command: Command, timeout: Duration) -> Result<Reply, CallError>;
}

#[async_trait]
impl<S> CommandSender for Arc<S>
where
    S: CommandSender + ?Sized,
{
    async fn call(&self, queue: &str, command: Command, timeout: Duration) -> Result<Reply, CallError> {
        (**self).call(queue, command, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Prefix of the private reply queue (`<prefix>.reply.<uuid>`).
    pub reply_prefix: String,
    /// Pause between publish attempts while the broker is unreachable.
    pub publish_retry: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            reply_prefix: "relaygate".to_string(),
            publish_retry: Duration::from_millis(100),
        }
    }
}

impl RpcConfig {
    pub fn with_reply_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reply_prefix = prefix.into();
        self
    }

    pub fn with_publish_retry(mut self, retry: Duration) -> Self {
        self.publish_retry = retry;
        self
    }
}

/// RPC client multiplexing concurrent calls over one channel.
///
/// Owns a private, non-durable reply queue and a listener task that routes
/// replies to waiting callers by correlation ID.
pub struct RpcClient {
    channel: Arc<dyn CommandChannel>,
    reply_queue: String,
    pending: Arc<PendingCalls>,
    listener: JoinHandle<()>,
    config: RpcConfig,
    closed: AtomicBool,
}

impl RpcClient {
    /// Declare the reply queue and start listening on it.
    pub async fn connect(channel: Arc<dyn CommandChannel>, config: RpcConfig) -> Result<Self, ChannelError> {
        let reply_queue = format!("{}.reply.{}", config.reply_prefix, Uuid::now_v7());
        channel.declare(&QueueBinding::transient(&reply_queue)).await?;
        let subscription = channel.consume(&reply_queue).await?;

        let pending = Arc::new(PendingCalls::new());
        let listener = tokio::spawn(listen(subscription, pending.clone()));

        debug!(reply_queue = %reply_queue, "rpc client connected");

        Ok(Self {
            channel,
            reply_queue,
            pending,
            listener,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn stats(&self) -> PendingSnapshot {
        self.pending.snapshot()
    }

    /// Send `command` to `queue` and wait up to `timeout` for its reply.
    #[instrument(skip(self, command), fields(cmd = %command.name(), correlation_id = tracing::field::Empty))]
    pub async fn call(&self, queue: &str, command: Command, timeout: Duration) -> Result<Reply, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }

        let cmd = command.name().to_string();
        let mut pending = self.pending.register(&cmd);
        let correlation_id = pending.correlation_id();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let envelope = Envelope::request(command, correlation_id, &self.reply_queue);

        let outcome = tokio::time::timeout(timeout, async {
            self.publish_until_accepted(queue, envelope).await?;
            Ok::<_, ChannelError>(pending.wait().await)
        })
        .await;

        match outcome {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(CallError::Closed),
            Ok(Err(e)) => Err(CallError::Publish(e)),
            Err(_) => {
                warn!(queue = queue, timeout_ms = timeout.as_millis() as u64, "rpc call timed out");
                Err(CallError::TimedOut { cmd, timeout })
            }
        }
    }

    async fn publish_until_accepted(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError> {
        loop {
            match self.channel.publish(queue, envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() => {
                    warn!(queue = queue, error = %e, "publish failed; retrying");
                    tokio::time::sleep(self.config.publish_retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop listening, fail waiting calls and delete the reply queue.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.listener.abort();
        self.pending.clear();

        if let Err(e) = self.channel.delete(&self.reply_queue).await {
            warn!(reply_queue = %self.reply_queue, error = %e, "failed to delete reply queue");
        }
        debug!(reply_queue = %self.reply_queue, "rpc client closed");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl CommandSender for RpcClient {
    async fn call(&self, queue: &str, command: Command, timeout: Duration) -> Result<Reply, CallError> {
        RpcClient::call(self, queue, command, timeout).await
    }
}

async fn listen(mut subscription: Subscription, pending: Arc<PendingCalls>) {
    while let Some(delivery) = subscription.recv().await {
        let (envelope, ack) = delivery.into_parts();
        let message_id = envelope.message_id();

        // Replies are consumed the moment they are read; a redelivered duplicate
        // would find no pending call and be dropped as an orphan.
        if let Err(e) = ack.ack().await {
            warn!(message_id = %message_id, error = %e, "failed to acknowledge reply");
        }

        let correlation_id = envelope.correlation_id();
        match (correlation_id, envelope.into_message()) {
            (Some(correlation_id), Message::Reply(reply)) => {
                pending.complete(correlation_id, reply);
            }
            (_, other) => {
                warn!(
                    message_id = %message_id,
                    message = ?other,
                    "ignoring non-reply message on reply queue"
                );
            }
        }
    }

    debug!(queue = subscription.queue(), "reply listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryChannel;
    use relaygate_core::{CommandError, FailureKind};
    use serde_json::json;

    /// Replies to every command on `queue` after `delay`, echoing its payload.
    async fn spawn_echo(channel: InMemoryChannel, queue: &'static str, delay: Duration) -> JoinHandle<()> {
        let mut sub = channel.consume(queue).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                let channel = channel.clone();
                tokio::spawn(async move {
                    let (envelope, ack) = delivery.into_parts();
                    ack.ack().await.unwrap();
                    tokio::time::sleep(delay).await;

                    let reply_to = envelope.reply_to().unwrap().to_string();
                    let correlation_id = envelope.correlation_id().unwrap();
                    let Message::Command(command) = envelope.into_message() else {
                        return;
                    };
                    let reply = Envelope::reply(correlation_id, Reply::success(command.payload().clone()));
                    channel.publish(&reply_to, reply).await.unwrap();
                });
            }
        })
    }

    async fn client(channel: &InMemoryChannel) -> RpcClient {
        RpcClient::connect(Arc::new(channel.clone()), RpcConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn call_resolves_with_reply() {
        let channel = InMemoryChannel::new();
        let _echo = spawn_echo(channel.clone(), "svc", Duration::ZERO).await;
        let client = client(&channel).await;

        let reply = client
            .call("svc", Command::new("echo", json!({ "n": 7 })), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply, Reply::success(json!({ "n": 7 })));
        assert_eq!(client.stats().completed, 1);
        assert_eq!(client.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn failure_reply_is_passed_through() {
        let channel = InMemoryChannel::new();
        let responder = channel.clone();
        let mut sub = responder.consume("svc").await.unwrap();
        tokio::spawn(async move {
            let delivery = sub.recv().await.unwrap();
            let (envelope, ack) = delivery.into_parts();
            ack.ack().await.unwrap();
            let reply = Envelope::reply(
                envelope.correlation_id().unwrap(),
                Reply::failure(CommandError::unknown_command("nope")),
            );
            responder.publish(envelope.reply_to().unwrap(), reply).await.unwrap();
        });
        let client = client(&channel).await;

        let reply = client
            .call("svc", Command::new("nope", json!(null)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.failure_kind(), Some(FailureKind::UnknownCommand));
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_replies() {
        let channel = InMemoryChannel::new();
        let _echo = spawn_echo(channel.clone(), "svc", Duration::from_millis(5)).await;
        let client = Arc::new(client(&channel).await);

        let calls = (0..50u64).map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let reply = client
                    .call("svc", Command::new("echo", json!({ "n": n })), Duration::from_secs(5))
                    .await
                    .unwrap();
                (n, reply)
            })
        });

        for call in calls.collect::<Vec<_>>() {
            let (n, reply) = call.await.unwrap();
            assert_eq!(reply, Reply::success(json!({ "n": n })));
        }
        assert_eq!(client.stats().completed, 50);
        assert_eq!(client.stats().orphaned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_discarded_not_misattributed() {
        let channel = InMemoryChannel::new();
        let _echo = spawn_echo(channel.clone(), "slow", Duration::from_millis(500)).await;
        let client = client(&channel).await;

        let err = client
            .call("slow", Command::new("echo", json!("late")), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::TimedOut { ref cmd, .. } if cmd == "echo"));

        // Let the late reply land.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.stats().orphaned, 1);

        let _fast = spawn_echo(channel.clone(), "fast", Duration::ZERO).await;
        let reply = client
            .call("fast", Command::new("echo", json!("fresh")), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::success(json!("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_outage_surfaces_as_timeout() {
        let channel = InMemoryChannel::new();
        let client = client(&channel).await;
        channel.disconnect();

        let started = tokio::time::Instant::now();
        let err = client
            .call("svc", Command::new("echo", json!(null)), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::TimedOut { .. }));
        assert!(started.elapsed() <= Duration::from_millis(2100));
        assert_eq!(client.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_recovers_after_reconnect() {
        let channel = InMemoryChannel::new();
        let _echo = spawn_echo(channel.clone(), "svc", Duration::ZERO).await;
        let client = client(&channel).await;
        channel.disconnect();

        let reconnecting = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            reconnecting.reconnect();
        });

        let reply = client
            .call("svc", Command::new("echo", json!(1)), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Reply::success(json!(1)));
    }

    #[tokio::test]
    async fn close_deletes_reply_queue_and_rejects_calls() {
        let channel = InMemoryChannel::new();
        let client = client(&channel).await;
        let reply_queue = client.reply_queue().to_string();
        assert!(channel.queue_binding(&reply_queue).is_some());

        client.close().await;

        assert!(channel.queue_binding(&reply_queue).is_none());
        let err = client
            .call("svc", Command::new("echo", json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Closed);
    }
}
