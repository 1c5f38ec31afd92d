//! Command channel abstraction (mechanics only).
//!
//! A command channel is a set of named queues on a broker. Unlike a pub/sub bus,
//! every message is delivered to **one** consumer of its queue and stays on the
//! queue until that consumer acknowledges it.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery whose `AckHandle` is dropped without `ack()`
//!   (consumer crash, lost connection) becomes redeliverable, to this or another consumer
//! - **Manual acknowledgment**: `AckHandle::ack` consumes the handle, so a delivery
//!   can be acknowledged at most once
//! - **No negative acknowledgment**: consumers that fail a message acknowledge it
//!   and report the failure in a reply instead of requeueing it
//!
//! Durable queues keep unacknowledged messages across consumer restarts.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relaygate_core::{Envelope, ProtocolError, QueueBinding};

use crate::delivery::Delivery;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The broker is unreachable (connection refused, dropped, timed out).
    #[error("broker transport failure: {0}")]
    Transport(String),

    /// The broker refused a command (wrong type, missing group, ...).
    #[error("broker rejected command: {0}")]
    Broker(String),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Internal state lock was poisoned by a panicking thread.
    #[error("channel state poisoned")]
    Poisoned,

    /// The channel (or subscription) has been shut down.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Transport failures are expected to heal (reconnect, redelivery).
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Transport(_))
    }
}

/// A consumer's view of one queue.
///
/// Deliveries are pulled: a backend takes a message off the queue only when
/// `recv` asks for one, so a consumer never holds a message it has not asked
/// for. Dropping the subscription stops the consumer; a delivery still buffered
/// is released back to the queue.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
    demand: mpsc::Sender<()>,
    /// A request was sent and its delivery has not been received yet.
    awaiting: bool,
    pump: Option<JoinHandle<()>>,
}

/// Backend side of a [`Subscription`].
#[derive(Debug)]
pub struct Feed {
    demand: mpsc::Receiver<()>,
    deliveries: mpsc::Sender<Delivery>,
}

impl Feed {
    /// Wait until the subscriber asks for a delivery.
    ///
    /// `false` once the subscription is gone.
    pub async fn wanted(&mut self) -> bool {
        self.demand.recv().await.is_some()
    }

    /// Hand over the delivery that was asked for. A delivery that cannot be
    /// handed over is dropped, which releases it.
    pub async fn deliver(&self, delivery: Delivery) -> Result<(), ChannelError> {
        self.deliveries
            .send(delivery)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

impl Subscription {
    /// A subscription and the feed its backend pump serves.
    pub fn channel(queue: impl Into<String>) -> (Self, Feed) {
        let (demand_tx, demand_rx) = mpsc::channel(1);
        let (delivery_tx, delivery_rx) = mpsc::channel(1);
        let subscription = Self {
            queue: queue.into(),
            receiver: delivery_rx,
            demand: demand_tx,
            awaiting: false,
            pump: None,
        };
        let feed = Feed {
            demand: demand_rx,
            deliveries: delivery_tx,
        };
        (subscription, feed)
    }

    /// Attach the background task feeding this subscription; it is aborted on drop.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask for the next delivery and wait for it. `None` once the channel side
    /// has shut down.
    ///
    /// Cancel-safe: a request left outstanding by a cancelled call is reused by
    /// the next one.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if !self.awaiting {
            self.demand.send(()).await.ok()?;
            self.awaiting = true;
        }

        let delivery = self.receiver.recv().await;
        if delivery.is_some() {
            self.awaiting = false;
        }
        delivery
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Broker-agnostic command channel.
///
/// ## Architecture Role
///
/// ```text
/// RpcClient ──publish──▶ service queue ──consume──▶ CommandDispatcher
///     ▲                                                   │
///     └────consume──── reply queue ◀────publish───────────┘
/// ```
///
/// Implementations must be safe to share across tasks; all calls multiplex over
/// the implementation's single broker connection.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Create the queue if it does not exist (idempotent).
    async fn declare(&self, binding: &QueueBinding) -> Result<(), ChannelError>;

    /// Remove a queue and everything on it.
    async fn delete(&self, queue: &str) -> Result<(), ChannelError>;

    /// Append an envelope to a queue. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Subscription, ChannelError>;
}

#[async_trait]
impl<C> CommandChannel for Arc<C>
where
    C: CommandChannel + ?Sized,
{
    async fn declare(&self, binding: &QueueBinding) -> Result<(), ChannelError> {
        (**self).declare(binding).await
    }

    async fn delete(&self, queue: &str) -> Result<(), ChannelError> {
        (**self).delete(queue).await
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError> {
        (**self).publish(queue, envelope).await
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, ChannelError> {
        (**self).consume(queue).await
    }
}
