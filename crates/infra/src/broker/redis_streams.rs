//! Redis Streams-backed command channel (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `<prefix>:<queue>`, one stream per queue
//! - **Consumer group**: `relaygate`, one per stream; every message goes to one consumer
//! - **Consumers**: one per subscription, named `<queue>-<uuid>`
//! - **Dead letters**: the `<queue>.dead-letter` stream, written by the dispatcher
//!
//! ## Delivery
//!
//! - `XADD` publishes (`NOMKSTREAM` for replies); `XREADGROUP ... >` hands a
//!   new entry to one consumer, and only when that consumer asks for one
//! - `XACK` + `XDEL` acknowledge; an entry never acked stays in the group's
//!   pending list
//! - Entries pending longer than `claim_idle` (crashed consumer, failed ack)
//!   are taken over with `XCLAIM`; their delivery count becomes the attempt
//!
//! All queue operations share one multiplexed `ConnectionManager`, which
//! reconnects on its own. Reads never use `BLOCK` (a blocked command would
//! stall the shared connection); consumers poll every `poll_interval` instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use relaygate_channel::{
    AckHandle, Acknowledger, ChannelError, CommandChannel, Delivery, Feed, Subscription,
};
use relaygate_core::{DEAD_LETTER_SUFFIX, Envelope, Message, QueueBinding};

/// Consumer group used on every stream.
const GROUP: &str = "relaygate";

/// Field holding the encoded envelope.
const ENVELOPE_FIELD: &str = "envelope";

#[derive(Debug, Clone)]
pub struct RedisStreamsOptions {
    /// Prefix of every stream key
    pub key_prefix: String,
    /// How long an entry may sit unacknowledged before another consumer claims it
    pub claim_idle: Duration,
    /// Pause between reads when a stream is empty
    pub poll_interval: Duration,
}

impl Default for RedisStreamsOptions {
    fn default() -> Self {
        Self {
            key_prefix: "relaygate".to_string(),
            claim_idle: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl RedisStreamsOptions {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    fn claim_check_interval(&self) -> Duration {
        (self.claim_idle / 2).max(self.poll_interval)
    }
}

#[derive(Clone)]
pub struct RedisStreamsChannel {
    conn: ConnectionManager,
    options: Arc<RedisStreamsOptions>,
}

impl core::fmt::Debug for RedisStreamsChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsChannel")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsChannel {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(url: &str, options: RedisStreamsOptions) -> Result<Self, ChannelError> {
        let client = redis::Client::open(url).map_err(channel_error)?;
        let conn = ConnectionManager::new(client).await.map_err(channel_error)?;

        Ok(Self {
            conn,
            options: Arc::new(options),
        })
    }

    fn key(&self, queue: &str) -> String {
        stream_key(&self.options.key_prefix, queue)
    }

    /// Create the stream and its consumer group (idempotent).
    ///
    /// The group starts at `0`, so entries published before the first consumer
    /// attached are still delivered.
    async fn ensure_group(&self, key: &str) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(channel_error(e)),
        }
    }

    /// Next never-delivered entry for this consumer, if any.
    async fn read_next(
        &self,
        queue: &str,
        key: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, ChannelError> {
        let mut conn = self.conn.clone();
        let read: redis::RedisResult<Option<StreamReadReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(key)
            .arg(">")
            .query_async(&mut conn)
            .await;

        let reply = match read {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                // The stream was deleted underneath us; recreate and try again later.
                self.ensure_group(key).await?;
                return Ok(None);
            }
            Err(e) => return Err(channel_error(e)),
        };

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        match entry {
            Some(entry) => self.into_delivery(queue, key, entry, 1).await,
            None => Ok(None),
        }
    }

    /// Take over the oldest entry that has been pending longer than `claim_idle`.
    async fn claim_next(
        &self,
        queue: &str,
        key: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, ChannelError> {
        let min_idle_ms = self.options.claim_idle.as_millis() as u64;
        let mut conn = self.conn.clone();

        // [entry id, owner, idle ms, delivery count]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(key)
            .arg(GROUP)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(channel_error)?;

        let Some((entry_id, owner, idle_ms, deliveries)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: redis::RedisResult<StreamClaimReply> = redis::cmd("XCLAIM")
            .arg(key)
            .arg(GROUP)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&entry_id)
            .query_async(&mut conn)
            .await;

        let entry = match claimed {
            Ok(reply) => reply.ids.into_iter().next(),
            Err(e) if e.kind() == redis::ErrorKind::TypeError => {
                // Pending entry whose payload was deleted; nothing left to deliver.
                warn!(stream = %key, entry_id = %entry_id, "dropping pending entry with no payload");
                self.acknowledge(key, &entry_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(channel_error(e)),
        };

        // Another consumer claimed it first.
        let Some(entry) = entry else {
            return Ok(None);
        };

        debug!(
            stream = %key,
            entry_id = %entry_id,
            previous_owner = %owner,
            idle_ms = idle_ms,
            "claimed idle entry"
        );

        let attempt = u32::try_from(deliveries.saturating_add(1)).unwrap_or(u32::MAX);
        self.into_delivery(queue, key, entry, attempt).await
    }

    async fn into_delivery(
        &self,
        queue: &str,
        key: &str,
        entry: StreamId,
        attempt: u32,
    ) -> Result<Option<Delivery>, ChannelError> {
        let raw: Option<String> = entry.get(ENVELOPE_FIELD);
        let decoded = raw
            .as_deref()
            .ok_or_else(|| "missing envelope field".to_string())
            .and_then(|raw| Envelope::decode(raw).map_err(|e| e.to_string()));

        match decoded {
            Ok(envelope) => {
                let ack = AckHandle::new(
                    envelope.message_id(),
                    StreamAck {
                        conn: self.conn.clone(),
                        key: key.to_string(),
                        entry_id: entry.id,
                    },
                );
                Ok(Some(Delivery::new(envelope, attempt, ack)))
            }
            Err(reason) => {
                // Nobody can answer an envelope nobody can read: park it and move on.
                warn!(stream = %key, entry_id = %entry.id, reason = %reason, "malformed entry dead-lettered");
                self.park_malformed(queue, &entry.id, raw.as_deref().unwrap_or(""), &reason)
                    .await?;
                self.acknowledge(key, &entry.id).await?;
                Ok(None)
            }
        }
    }

    async fn park_malformed(
        &self,
        queue: &str,
        entry_id: &str,
        raw: &str,
        reason: &str,
    ) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let dead_letter = self.key(&format!("{queue}{DEAD_LETTER_SUFFIX}"));
        let _: String = redis::cmd("XADD")
            .arg(&dead_letter)
            .arg("*")
            .arg("original_entry_id")
            .arg(entry_id)
            .arg("reason")
            .arg(reason)
            .arg("raw")
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn acknowledge(&self, key: &str, entry_id: &str) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        acknowledge(&mut conn, key, entry_id).await
    }
}

async fn acknowledge(
    conn: &mut ConnectionManager,
    key: &str,
    entry_id: &str,
) -> Result<(), ChannelError> {
    // Single group per stream, so an acked entry can be deleted outright.
    redis::pipe()
        .atomic()
        .cmd("XACK")
        .arg(key)
        .arg(GROUP)
        .arg(entry_id)
        .ignore()
        .cmd("XDEL")
        .arg(key)
        .arg(entry_id)
        .ignore()
        .query_async::<_, ()>(conn)
        .await
        .map_err(channel_error)
}

/// Acknowledgment of one stream entry.
///
/// Releasing is a no-op: the entry stays in the pending list and is claimed
/// again once it has been idle for `claim_idle`.
struct StreamAck {
    conn: ConnectionManager,
    key: String,
    entry_id: String,
}

#[async_trait]
impl Acknowledger for StreamAck {
    async fn ack(&self) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        acknowledge(&mut conn, &self.key, &self.entry_id).await
    }
}

#[async_trait]
impl CommandChannel for RedisStreamsChannel {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), ChannelError> {
        self.ensure_group(&self.key(&binding.name)).await
    }

    async fn delete(&self, queue: &str) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(queue))
            .query_async(&mut conn)
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    #[instrument(
        skip(self, envelope),
        fields(message_id = %envelope.message_id(), label = %envelope.label()),
        err
    )]
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError> {
        let payload = envelope.encode()?;
        let mut conn = self.conn.clone();

        let mut xadd = redis::cmd("XADD");
        xadd.arg(self.key(queue));
        // Replies never recreate a reply stream its owner has deleted.
        let is_reply = matches!(envelope.message(), Message::Reply(_));
        if is_reply {
            xadd.arg("NOMKSTREAM");
        }

        let entry_id: Option<String> = xadd
            .arg("*")
            .arg("message_id")
            .arg(envelope.message_id().to_string())
            .arg("label")
            .arg(envelope.label())
            .arg(ENVELOPE_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(channel_error)?;

        if entry_id.is_none() {
            debug!(queue = queue, "reply stream is gone; reply dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, ChannelError> {
        let key = self.key(queue);
        self.ensure_group(&key).await?;

        let consumer = format!("{queue}-{}", Uuid::now_v7());
        let (subscription, feed) = Subscription::channel(queue);
        let pump = tokio::spawn(pump(self.clone(), queue.to_string(), key, consumer, feed));

        Ok(subscription.with_pump(pump))
    }
}

/// Feed one subscription, one entry at a time.
///
/// An entry is read (or claimed) only after the subscriber has asked for one,
/// so idle entries stay on the stream for competing consumers.
async fn pump(
    channel: RedisStreamsChannel,
    queue: String,
    key: String,
    consumer: String,
    mut feed: Feed,
) {
    let poll = channel.options.poll_interval;
    let claim_every = channel.options.claim_check_interval();
    let mut next_claim = Instant::now();

    while feed.wanted().await {
        let delivery = loop {
            if Instant::now() >= next_claim {
                match channel.claim_next(&queue, &key, &consumer).await {
                    // Keep claiming while there is a backlog of idle entries.
                    Ok(Some(delivery)) => break delivery,
                    Ok(None) => next_claim = Instant::now() + claim_every,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "claiming idle entries failed");
                        next_claim = Instant::now() + claim_every;
                    }
                }
            }

            match channel.read_next(&queue, &key, &consumer).await {
                Ok(Some(delivery)) => break delivery,
                Ok(None) => tokio::time::sleep(poll).await,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "stream read failed; retrying");
                    tokio::time::sleep(poll).await;
                }
            }
        };

        if feed.deliver(delivery).await.is_err() {
            return;
        }
    }
}

fn stream_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:{queue}")
}

/// Connection-level failures heal on reconnect; anything else is the server
/// refusing the command.
fn channel_error(e: redis::RedisError) -> ChannelError {
    if e.is_io_error()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || e.is_timeout()
        || e.kind() == redis::ErrorKind::IoError
    {
        ChannelError::transport(e.to_string())
    } else {
        ChannelError::Broker(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_prefixed_per_queue() {
        assert_eq!(stream_key("relaygate", "auth_queue"), "relaygate:auth_queue");
        assert_eq!(
            stream_key("relaygate", "auth_queue.dead-letter"),
            "relaygate:auth_queue.dead-letter"
        );
    }

    #[test]
    fn connection_errors_are_transport() {
        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(channel_error(refused).is_transport());
    }

    #[test]
    fn server_errors_are_broker_rejections() {
        let wrongtype = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(channel_error(wrongtype), ChannelError::Broker(_)));
    }

    #[test]
    fn claim_check_never_outpaces_polling() {
        let options = RedisStreamsOptions::default()
            .with_claim_idle(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(100));
        assert_eq!(options.claim_check_interval(), Duration::from_millis(100));

        let options = RedisStreamsOptions::default();
        assert_eq!(options.claim_check_interval(), Duration::from_secs(15));
    }
}
