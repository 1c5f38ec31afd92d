//! Deliveries and their acknowledgment handles.

use async_trait::async_trait;

use relaygate_core::{Envelope, MessageId};

use crate::channel::ChannelError;

/// Backend-specific acknowledgment of one delivered message.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the queue for good.
    async fn ack(&self) -> Result<(), ChannelError>;

    /// The handle was dropped (or the ack failed) without acknowledging.
    ///
    /// The message must stay redeliverable. Backends that redeliver on their own
    /// (e.g. by reclaiming idle pending entries) keep the default no-op.
    fn release(&self) {}
}

/// Single-use acknowledgment handle.
///
/// `ack` consumes the handle, so a delivery is acknowledged at most once.
/// Dropping an unacknowledged handle releases the message for redelivery.
pub struct AckHandle {
    message_id: MessageId,
    inner: Option<Box<dyn Acknowledger>>,
}

impl AckHandle {
    pub fn new(message_id: MessageId, acker: impl Acknowledger + 'static) -> Self {
        Self {
            message_id,
            inner: Some(Box::new(acker)),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Acknowledge the delivery.
    ///
    /// On a transport failure the message is left unacknowledged (released) and
    /// will be redelivered once the broker is reachable again.
    pub async fn ack(mut self) -> Result<(), ChannelError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };

        match inner.ack().await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.release();
                Err(e)
            }
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl core::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AckHandle")
            .field("message_id", &self.message_id)
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

/// A message handed to a consumer, together with its acknowledgment handle.
#[derive(Debug)]
pub struct Delivery {
    envelope: Envelope,
    /// 1 on first delivery, incremented on every redelivery.
    attempt: u32,
    ack: AckHandle,
}

impl Delivery {
    pub fn new(envelope: Envelope, attempt: u32, ack: AckHandle) -> Self {
        Self {
            envelope,
            attempt,
            ack,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn into_parts(self) -> (Envelope, AckHandle) {
        (self.envelope, self.ack)
    }
}
