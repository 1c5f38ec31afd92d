//! Command dispatcher: the consuming side of the RPC protocol.
//!
//! ## Per-message state machine
//!
//! ```text
//! Received
//!   ↓  attempt > max_deliveries? → publish to <queue>.dead-letter, ack, reply DeadLettered
//!   ↓
//! Acknowledged   (ack failed → leave the message for redelivery, run nothing)
//!   ↓
//! handler lookup → UnknownCommand
//! handler run    → Ok(value) | Err(kind) | panic → HandlerError
//!   ↓
//! Replied        (to the envelope's reply_to, under its correlation id)
//! ```
//!
//! The message is acknowledged *before* the handler runs, so the broker never
//! redelivers a command that is still executing. A crash between ack and reply
//! is visible to the caller as a timeout.
//!
//! Handlers run on their own task: a panic is caught as a `JoinError` and
//! reported in the reply instead of taking down the consumer. A semaphore caps
//! how many handlers run at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use relaygate_channel::{AckHandle, ChannelError, CommandChannel, Delivery, Subscription};
use relaygate_core::{
    Command, CommandError, CorrelationId, Envelope, FailureKind, Message, QueueBinding, Reply,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A named unit of remote behavior.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<JsonValue, CommandError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, CommandError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<JsonValue, CommandError> {
        (self.0)(command).await
    }
}

/// Static command-name → handler table, built once at startup.
///
/// Names match exactly; there is no wildcard or fallback handler.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration under the same name replaces the first.
    pub fn register(mut self, cmd: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        let cmd = cmd.into();
        if self.handlers.insert(cmd.clone(), Arc::new(handler)).is_some() {
            warn!(cmd = %cmd, "replacing previously registered handler");
        }
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(self, cmd: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, CommandError>> + Send + 'static,
    {
        self.register(cmd, FnHandler(handler))
    }

    pub fn get(&self, cmd: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(cmd).cloned()
    }

    pub fn contains(&self, cmd: &str) -> bool {
        self.handlers.contains_key(cmd)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("commands", &self.commands())
            .finish()
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue to consume.
    pub queue: QueueBinding,
    /// Maximum handlers running at once
    pub max_concurrent: usize,
    /// Deliveries allowed before a message is dead-lettered
    pub max_deliveries: u32,
    /// Name for logging
    pub name: String,
}

impl DispatcherConfig {
    pub fn new(queue: QueueBinding) -> Self {
        Self {
            name: queue.name.clone(),
            queue,
            max_concurrent: 4,
            max_deliveries: 5,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledged and handled. `failure` is the reply's failure kind, if any;
    /// `replied` is false when the command had no reply address or publishing the reply failed.
    Completed {
        failure: Option<FailureKind>,
        replied: bool,
    },
    /// Moved to the dead-letter queue and acknowledged.
    DeadLettered,
    /// Acknowledgment failed; nothing ran and the broker will redeliver.
    Unacknowledged,
    /// Not a command (e.g. a stray reply); acknowledged and dropped.
    Discarded,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unknown_commands: AtomicU64,
    dead_lettered: AtomicU64,
    unacknowledged: AtomicU64,
    discarded: AtomicU64,
    replies_sent: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Completed { failure, replied } => {
                if *replied {
                    self.replies_sent.fetch_add(1, Ordering::Relaxed);
                }
                match failure {
                    None => &self.succeeded,
                    Some(FailureKind::UnknownCommand) => &self.unknown_commands,
                    Some(_) => &self.failed,
                }
            }
            DispatchOutcome::DeadLettered => &self.dead_lettered,
            DispatchOutcome::Unacknowledged => &self.unacknowledged,
            DispatchOutcome::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unknown_commands: u64,
    pub dead_lettered: u64,
    pub unacknowledged: u64,
    pub discarded: u64,
    pub replies_sent: u64,
    pub uptime_secs: u64,
}

/// Consumes one service queue and answers every command on it.
pub struct CommandDispatcher {
    channel: Arc<dyn CommandChannel>,
    table: DispatchTable,
    config: DispatcherConfig,
    counters: Arc<Counters>,
    started_at: Instant,
}

impl CommandDispatcher {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        table: DispatchTable,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            channel,
            table,
            config,
            counters: Arc::new(Counters::default()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        snapshot(&self.counters, self.started_at)
    }

    /// Declare the queue and its dead-letter queue, start consuming, and run
    /// the dispatch loop in the background.
    ///
    /// Returns once the consumer is registered, so commands published after
    /// this point are picked up.
    pub async fn start(self) -> Result<DispatcherHandle, DispatchError> {
        self.channel.declare(&self.config.queue).await?;
        self.channel
            .declare(&self.config.queue.dead_letter())
            .await?;
        let subscription = self.channel.consume(&self.config.queue.name).await?;

        info!(
            dispatcher = %self.config.name,
            queue = %self.config.queue.name,
            commands = ?self.table.commands(),
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::clone(&self.counters);
        let started_at = self.started_at;
        let join = tokio::spawn(Arc::new(self).run(subscription, shutdown_rx));

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            counters,
            started_at,
        })
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!(dispatcher = %self.config.name, "subscription closed");
                        break;
                    }
                },
            };

            let this = Arc::clone(&self);
            in_flight.spawn(async move {
                this.process(delivery).await;
                drop(permit);
            });

            while in_flight.try_join_next().is_some() {}
        }

        // Stop taking deliveries; anything still buffered goes back to the queue.
        drop(subscription);
        while in_flight.join_next().await.is_some() {}

        info!(dispatcher = %self.config.name, "dispatcher stopped");
    }

    /// Take one delivery through the state machine.
    #[instrument(
        skip(self, delivery),
        fields(
            queue = %self.config.queue.name,
            message_id = %delivery.envelope().message_id(),
            cmd = %delivery.envelope().label(),
            attempt = delivery.attempt()
        )
    )]
    pub async fn process(&self, delivery: Delivery) -> DispatchOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = self.dispatch(delivery).await;

        self.counters.record(&outcome);
        debug!(
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "delivery processed"
        );
        outcome
    }

    async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let attempt = delivery.attempt();
        let (envelope, ack) = delivery.into_parts();

        if attempt > self.config.max_deliveries {
            return self.dead_letter(envelope, ack, attempt).await;
        }

        if let Err(e) = ack.ack().await {
            warn!(error = %e, "acknowledgment failed; leaving message for redelivery");
            return DispatchOutcome::Unacknowledged;
        }

        let correlation_id = envelope.correlation_id();
        let reply_to = envelope.reply_to().map(str::to_string);

        let command = match envelope.into_message() {
            Message::Command(command) => command,
            Message::Reply(_) => {
                warn!("discarding reply delivered to a command queue");
                return DispatchOutcome::Discarded;
            }
        };

        let result = self.invoke(command).await;
        let failure = result.as_ref().err().map(|e| e.kind);
        if let Err(e) = &result {
            debug!(kind = %e.kind, error = %e.message, "command failed");
        }

        let replied = self
            .send_reply(reply_to, correlation_id, Reply::from(result))
            .await;

        DispatchOutcome::Completed { failure, replied }
    }

    async fn invoke(&self, command: Command) -> Result<JsonValue, CommandError> {
        let name = command.name().to_string();
        let Some(handler) = self.table.get(&name) else {
            warn!(cmd = %name, "no handler registered");
            return Err(CommandError::unknown_command(&name));
        };

        match tokio::spawn(async move { handler.handle(command).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                warn!(cmd = %name, "handler panicked");
                Err(CommandError::handler(format!("handler for '{name}' panicked")))
            }
            Err(join) => Err(CommandError::handler(join.to_string())),
        }
    }

    /// Move an exhausted message to `<queue>.dead-letter`.
    ///
    /// The dead-letter entry is the original envelope, message id included.
    /// If the ack fails after the publish, the message is redelivered and
    /// dead-lettered again; consumers of the dead-letter queue deduplicate on
    /// the message id.
    async fn dead_letter(&self, envelope: Envelope, ack: AckHandle, attempt: u32) -> DispatchOutcome {
        let dead_letter = self.config.queue.dead_letter();
        let correlation_id = envelope.correlation_id();
        let reply_to = envelope.reply_to().map(str::to_string);
        let label = envelope.label().to_string();

        // Publish before acking so the message exists somewhere at all times.
        if let Err(e) = self.channel.publish(&dead_letter.name, envelope).await {
            warn!(error = %e, "failed to dead-letter message; leaving it for redelivery");
            return DispatchOutcome::Unacknowledged;
        }
        if let Err(e) = ack.ack().await {
            warn!(error = %e, "dead-lettered message could not be acknowledged");
            return DispatchOutcome::Unacknowledged;
        }

        warn!(
            dead_letter_queue = %dead_letter.name,
            attempt = attempt,
            max_deliveries = self.config.max_deliveries,
            "message moved to dead-letter queue"
        );

        let error = CommandError::dead_lettered(format!(
            "'{label}' exceeded {} deliveries",
            self.config.max_deliveries
        ));
        self.send_reply(reply_to, correlation_id, Reply::failure(error))
            .await;

        DispatchOutcome::DeadLettered
    }

    async fn send_reply(
        &self,
        reply_to: Option<String>,
        correlation_id: Option<CorrelationId>,
        reply: Reply,
    ) -> bool {
        let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) else {
            debug!("command carried no reply address");
            return false;
        };

        match self
            .channel
            .publish(&reply_to, Envelope::reply(correlation_id, reply))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    reply_to = %reply_to,
                    correlation_id = %correlation_id,
                    error = %e,
                    "failed to publish reply; caller will time out"
                );
                false
            }
        }
    }
}

fn snapshot(counters: &Counters, started_at: Instant) -> DispatcherStats {
    DispatcherStats {
        received: counters.received.load(Ordering::Relaxed),
        succeeded: counters.succeeded.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        unknown_commands: counters.unknown_commands.load(Ordering::Relaxed),
        dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
        unacknowledged: counters.unacknowledged.load(Ordering::Relaxed),
        discarded: counters.discarded.load(Ordering::Relaxed),
        replies_sent: counters.replies_sent.load(Ordering::Relaxed),
        uptime_secs: started_at.elapsed().as_secs(),
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    started_at: Instant,
}

impl DispatcherHandle {
    /// Stop consuming, wait for in-flight handlers, and return the final counters.
    pub async fn shutdown(mut self) -> DispatcherStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
        self.stats()
    }

    pub fn stats(&self) -> DispatcherStats {
        snapshot(&self.counters, self.started_at)
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}
