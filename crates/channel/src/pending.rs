//! Pending-call table: the async bridge between a caller and its reply.
//!
//! Maps correlation IDs to callers waiting for a reply envelope.
//!
//! Flow:
//! 1. `RpcClient::call` registers a fresh correlation ID and gets a `PendingGuard`
//! 2. The command is published with that correlation ID
//! 3. The reply listener receives the reply and calls `complete()`
//! 4. The caller awaits the guard, or gives up when its timer fires
//!
//! Each entry is removed exactly once: either by `complete()` (the caller is
//! woken with the reply) or by the guard going away (timeout, cancelled
//! request). A reply that finds no entry is an orphan and is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use relaygate_core::{CorrelationId, Reply};

struct PendingCall {
    sender: oneshot::Sender<Reply>,
    created_at: Instant,
    cmd: String,
}

#[derive(Debug, Default)]
struct PendingStats {
    registered: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    orphaned: AtomicU64,
}

/// Point-in-time copy of the pending-call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    /// Calls registered.
    pub registered: u64,
    /// Calls resolved with their reply.
    pub completed: u64,
    /// Calls removed without a reply (timed out or cancelled).
    pub abandoned: u64,
    /// Replies that arrived for no pending call (late or duplicate).
    pub orphaned: u64,
    /// Calls currently waiting.
    pub in_flight: usize,
}

#[derive(Default)]
pub struct PendingCalls {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: PendingStats,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call under a fresh correlation ID.
    pub fn register(self: &Arc<Self>, cmd: &str) -> PendingGuard {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
                cmd: cmd.to_string(),
            },
        );
        self.stats.registered.fetch_add(1, Ordering::Relaxed);

        debug!(correlation_id = %correlation_id, cmd = cmd, "registered pending call");

        PendingGuard {
            correlation_id,
            receiver: rx,
            table: Arc::clone(self),
        }
    }

    /// Resolve a pending call with its reply.
    ///
    /// Returns false when no call is waiting under that ID (late or duplicate
    /// reply); the reply is dropped.
    pub fn complete(&self, correlation_id: CorrelationId, reply: Reply) -> bool {
        let Some((_, call)) = self.pending.remove(&correlation_id) else {
            self.stats.orphaned.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "discarding reply with no pending call");
            return false;
        };

        let elapsed = call.created_at.elapsed();
        match call.sender.send(reply) {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    cmd = %call.cmd,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "completed pending call"
                );
                true
            }
            Err(_) => {
                // Caller went away between removal and send.
                self.stats.orphaned.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Remove a call that will never be completed (timeout, cancellation).
    pub fn abandon(&self, correlation_id: CorrelationId) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, call)) => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    cmd = %call.cmd,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "abandoned pending call"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every waiting call; their callers observe a closed channel.
    pub fn clear(&self) {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.abandon(id);
        }
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            registered: self.stats.registered.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            abandoned: self.stats.abandoned.load(Ordering::Relaxed),
            orphaned: self.stats.orphaned.load(Ordering::Relaxed),
            in_flight: self.pending.len(),
        }
    }
}

/// A registered call. Dropping it removes the entry if no reply arrived.
pub struct PendingGuard {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Reply>,
    table: Arc<PendingCalls>,
}

impl PendingGuard {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the reply. `None` if the entry was removed without one.
    pub async fn wait(&mut self) -> Option<Reply> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.abandon(self.correlation_id);
    }
}
