//! In-memory command channel for tests/dev.
//!
//! - No IO
//! - Competing consumers per queue; a consumer is handed a message only when it asks for one
//! - Publishing a command creates its queue; a reply to a missing queue is dropped
//! - Unacknowledged deliveries are redelivered when their handle is dropped
//! - Can be disconnected to simulate a broker outage

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error};

use relaygate_core::{Envelope, Message, MessageId, QueueBinding};

use crate::channel::{ChannelError, CommandChannel, Feed, Subscription};
use crate::delivery::{AckHandle, Acknowledger, Delivery};

/// Process-local broker.
///
/// Cloning is cheap; clones share the same queues (like connections to one broker).
#[derive(Debug, Clone)]
pub struct InMemoryChannel {
    broker: Arc<Broker>,
}

#[derive(Debug)]
struct Broker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    connected: AtomicBool,
    /// Acknowledgment calls per message id.
    acks: Mutex<HashMap<MessageId, u32>>,
    published: AtomicU64,
}

#[derive(Debug)]
struct Queue {
    binding: QueueBinding,
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<MessageId, Stored>,
}

#[derive(Debug, Clone)]
struct Stored {
    envelope: Envelope,
    deliveries: u32,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the broker connection: publish, consume and ack fail
    /// with `ChannelError::Transport` and nothing is delivered.
    pub fn disconnect(&self) {
        self.broker.connected.store(false, Ordering::SeqCst);
        debug!("in-memory broker disconnected");
    }

    pub fn reconnect(&self) {
        self.broker.connected.store(true, Ordering::SeqCst);
        if let Ok(queues) = self.broker.queues.lock() {
            for queue in queues.values() {
                queue.notify.notify_waiters();
            }
        }
        debug!("in-memory broker reconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Number of acknowledgment calls recorded for a message.
    pub fn ack_count(&self, message_id: MessageId) -> u32 {
        self.broker
            .acks
            .lock()
            .map(|acks| acks.get(&message_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total acknowledgment calls across all queues.
    pub fn total_acks(&self) -> u64 {
        self.broker
            .acks
            .lock()
            .map(|acks| acks.values().map(|n| u64::from(*n)).sum())
            .unwrap_or(0)
    }

    /// Total envelopes accepted by `publish`.
    pub fn published_count(&self) -> u64 {
        self.broker.published.load(Ordering::SeqCst)
    }

    /// Envelopes waiting on a queue (not yet delivered, or released for redelivery).
    pub fn ready(&self, queue: &str) -> Vec<Envelope> {
        self.broker
            .existing(queue)
            .and_then(|q| {
                q.state
                    .lock()
                    .ok()
                    .map(|s| s.ready.iter().map(|m| m.envelope.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.broker
            .existing(queue)
            .and_then(|q| q.state.lock().ok().map(|s| s.unacked.len()))
            .unwrap_or(0)
    }

    pub fn queue_binding(&self, queue: &str) -> Option<QueueBinding> {
        self.broker.existing(queue).map(|q| q.binding.clone())
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self {
            broker: Arc::new(Broker {
                queues: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                acks: Mutex::new(HashMap::new()),
                published: AtomicU64::new(0),
            }),
        }
    }
}

impl Broker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChannelError::transport("in-memory broker is disconnected"))
        }
    }

    fn existing(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().ok()?.get(name).cloned()
    }

    fn queue(&self, binding: &QueueBinding) -> Result<Arc<Queue>, ChannelError> {
        let mut queues = self.queues.lock().map_err(|_| ChannelError::Poisoned)?;
        let queue = queues.entry(binding.name.clone()).or_insert_with(|| {
            Arc::new(Queue {
                binding: binding.clone(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            })
        });
        Ok(queue.clone())
    }

    fn record_ack(&self, message_id: MessageId) -> Result<(), ChannelError> {
        let mut acks = self.acks.lock().map_err(|_| ChannelError::Poisoned)?;
        *acks.entry(message_id).or_insert(0) += 1;
        Ok(())
    }
}

impl Queue {
    /// Move the next ready message to the unacked set and hand it out.
    fn take_next(queue: &Arc<Queue>, broker: &Arc<Broker>) -> Result<Option<Delivery>, ChannelError> {
        let mut state = queue.state.lock().map_err(|_| ChannelError::Poisoned)?;
        let Some(mut stored) = state.ready.pop_front() else {
            return Ok(None);
        };

        stored.deliveries += 1;
        let message_id = stored.envelope.message_id();
        let attempt = stored.deliveries;
        let envelope = stored.envelope.clone();
        state.unacked.insert(message_id, stored);

        let ack = AckHandle::new(
            message_id,
            InMemoryAck {
                broker: broker.clone(),
                queue: queue.clone(),
                message_id,
            },
        );
        Ok(Some(Delivery::new(envelope, attempt, ack)))
    }
}

struct InMemoryAck {
    broker: Arc<Broker>,
    queue: Arc<Queue>,
    message_id: MessageId,
}

#[async_trait]
impl Acknowledger for InMemoryAck {
    async fn ack(&self) -> Result<(), ChannelError> {
        self.broker.ensure_connected()?;

        self.queue
            .state
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .unacked
            .remove(&self.message_id);

        self.broker.record_ack(self.message_id)
    }

    fn release(&self) {
        let Ok(mut state) = self.queue.state.lock() else {
            return;
        };

        // Back to the head of the queue so ordering survives a consumer crash.
        if let Some(stored) = state.unacked.remove(&self.message_id) {
            state.ready.push_front(stored);
            drop(state);
            debug!(
                queue = %self.queue.binding.name,
                message_id = %self.message_id,
                "delivery released for redelivery"
            );
            self.queue.notify.notify_waiters();
        }
    }
}

async fn pump(broker: Arc<Broker>, queue: Arc<Queue>, mut feed: Feed) {
    // A message leaves the ready list only when the subscriber asks for it.
    while feed.wanted().await {
        let delivery = loop {
            let notified = queue.notify.notified();
            if broker.is_connected() {
                match Queue::take_next(&queue, &broker) {
                    Ok(Some(delivery)) => break delivery,
                    Ok(None) => {}
                    Err(e) => {
                        error!(queue = %queue.binding.name, error = %e, "in-memory consumer stopped");
                        return;
                    }
                }
            }
            notified.await;
        };

        if feed.deliver(delivery).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl CommandChannel for InMemoryChannel {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), ChannelError> {
        self.broker.ensure_connected()?;
        self.broker.queue(binding)?;
        Ok(())
    }

    async fn delete(&self, queue: &str) -> Result<(), ChannelError> {
        self.broker.ensure_connected()?;
        self.broker
            .queues
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError> {
        self.broker.ensure_connected()?;

        let message_id = envelope.message_id();
        let target = match self.broker.existing(queue) {
            Some(target) => target,
            // The owner of a reply queue deletes it when it stops listening.
            None if matches!(envelope.message(), Message::Reply(_)) => {
                debug!(queue = queue, message_id = %message_id, "reply queue is gone; reply dropped");
                return Ok(());
            }
            None => self.broker.queue(&QueueBinding::durable(queue))?,
        };
        target
            .state
            .lock()
            .map_err(|_| ChannelError::Poisoned)?
            .ready
            .push_back(Stored {
                envelope,
                deliveries: 0,
            });
        target.notify.notify_waiters();
        self.broker.published.fetch_add(1, Ordering::SeqCst);

        debug!(queue = queue, message_id = %message_id, "published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, ChannelError> {
        self.broker.ensure_connected()?;

        let target = self.broker.queue(&QueueBinding::durable(queue))?;
        let (subscription, feed) = Subscription::channel(queue);
        let pump = tokio::spawn(pump(self.broker.clone(), target, feed));

        Ok(subscription.with_pump(pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::{Command, CorrelationId, Reply};
    use serde_json::json;
    use std::time::Duration;

    fn command(n: u64) -> Envelope {
        Envelope::notification(Command::new("test", json!({ "n": n })))
    }

    #[tokio::test]
    async fn delivers_and_records_single_ack() {
        let channel = InMemoryChannel::new();
        let env = command(1);
        let id = env.message_id();
        channel.publish("q", env).await.unwrap();

        let mut sub = channel.consume("q").await.unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(channel.unacked_count("q"), 1);

        let (_, ack) = delivery.into_parts();
        ack.ack().await.unwrap();

        assert_eq!(channel.ack_count(id), 1);
        assert_eq!(channel.unacked_count("q"), 0);
        assert!(channel.ready("q").is_empty());
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered_with_next_attempt() {
        let channel = InMemoryChannel::new();
        let env = command(1);
        let id = env.message_id();
        channel.publish("q", env).await.unwrap();

        let mut sub = channel.consume("q").await.unwrap();
        let first = sub.recv().await.unwrap();
        drop(first);

        let second = sub.recv().await.unwrap();
        assert_eq!(second.envelope().message_id(), id);
        assert_eq!(second.attempt(), 2);
        assert_eq!(channel.ack_count(id), 0);
    }

    #[tokio::test]
    async fn competing_consumers_split_messages() {
        let channel = InMemoryChannel::new();
        let mut a = channel.consume("q").await.unwrap();
        let mut b = channel.consume("q").await.unwrap();

        channel.publish("q", command(1)).await.unwrap();
        channel.publish("q", command(2)).await.unwrap();

        let da = tokio::time::timeout(Duration::from_secs(1), a.recv()).await.unwrap().unwrap();
        let db = tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_ne!(da.envelope().message_id(), db.envelope().message_id());
    }

    #[tokio::test]
    async fn held_delivery_does_not_starve_a_competing_consumer() {
        let channel = InMemoryChannel::new();
        let mut a = channel.consume("q").await.unwrap();
        channel.publish("q", command(1)).await.unwrap();
        let held = tokio::time::timeout(Duration::from_secs(1), a.recv()).await.unwrap().unwrap();

        let second = command(2);
        let second_id = second.message_id();
        channel.publish("q", second).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // `a` has not asked again, so only the delivery it holds is out.
        assert_eq!(channel.unacked_count("q"), 1);
        assert_eq!(channel.ready("q").len(), 1);

        let mut b = channel.consume("q").await.unwrap();
        let other = tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_eq!(other.envelope().message_id(), second_id);
        drop(held);
    }

    #[tokio::test]
    async fn cancelled_recv_does_not_take_a_second_message() {
        let channel = InMemoryChannel::new();
        let mut sub = channel.consume("q").await.unwrap();

        // Nothing to deliver yet: the request stays outstanding.
        assert!(tokio::time::timeout(Duration::from_millis(20), sub.recv()).await.is_err());

        channel.publish("q", command(1)).await.unwrap();
        channel.publish("q", command(2)).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first.attempt(), 1);
        assert_eq!(channel.unacked_count("q"), 1);
        assert_eq!(channel.ready("q").len(), 1);
    }

    #[tokio::test]
    async fn reply_to_a_deleted_queue_is_dropped() {
        let channel = InMemoryChannel::new();
        channel.declare(&QueueBinding::transient("reply.1")).await.unwrap();
        channel.delete("reply.1").await.unwrap();

        let reply = Envelope::reply(CorrelationId::new(), Reply::success(json!(1)));
        channel.publish("reply.1", reply).await.unwrap();

        assert!(channel.queue_binding("reply.1").is_none());
        assert_eq!(channel.published_count(), 0);
    }

    #[tokio::test]
    async fn command_to_an_undeclared_queue_is_kept() {
        let channel = InMemoryChannel::new();
        channel.publish("later", command(1)).await.unwrap();

        assert_eq!(channel.queue_binding("later"), Some(QueueBinding::durable("later")));
        assert_eq!(channel.ready("later").len(), 1);
    }

    #[tokio::test]
    async fn disconnected_broker_rejects_publish() {
        let channel = InMemoryChannel::new();
        channel.disconnect();

        let err = channel.publish("q", command(1)).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(channel.published_count(), 0);
    }

    #[tokio::test]
    async fn failed_ack_leaves_message_for_redelivery() {
        let channel = InMemoryChannel::new();
        let env = command(1);
        let id = env.message_id();
        channel.publish("q", env).await.unwrap();

        let mut sub = channel.consume("q").await.unwrap();
        let delivery = sub.recv().await.unwrap();

        channel.disconnect();
        let (_, ack) = delivery.into_parts();
        assert!(ack.ack().await.unwrap_err().is_transport());
        assert_eq!(channel.ack_count(id), 0);
        assert_eq!(channel.ready("q").len(), 1);

        channel.reconnect();
        let again = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(again.envelope().message_id(), id);
        assert_eq!(again.attempt(), 2);
    }

    #[tokio::test]
    async fn delete_removes_queue() {
        let channel = InMemoryChannel::new();
        channel.declare(&QueueBinding::transient("reply.1")).await.unwrap();
        assert_eq!(channel.queue_binding("reply.1"), Some(QueueBinding::transient("reply.1")));

        channel.delete("reply.1").await.unwrap();
        assert!(channel.queue_binding("reply.1").is_none());
    }
}
