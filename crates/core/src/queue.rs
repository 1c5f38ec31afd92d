use serde::{Deserialize, Serialize};

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Queue declaration.
///
/// Durable queues keep unacknowledged messages across consumer (and broker)
/// restarts; every service queue is durable. Transient queues are private
/// reply queues that are deleted when their owner shuts down.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub name: String,
    pub durable: bool,
}

impl QueueBinding {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
        }
    }

    /// Dead-letter queue paired with this queue (always durable).
    pub fn dead_letter(&self) -> QueueBinding {
        QueueBinding::durable(format!("{}{}", self.name, DEAD_LETTER_SUFFIX))
    }
}
