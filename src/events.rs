//! Typed event hub
//!
//! Cross-component notification is a broadcast stream of discriminated
//! event records. Subscribers register on the hub and observe events in
//! FIFO order; a slow subscriber that falls behind the channel capacity
//! loses the oldest events (tokio broadcast semantics) but never blocks
//! the engine.

use crate::persistence::CheckpointKind;
use crate::types::{ErrorKind, TaskId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Events emitted by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FabricEvent {
    /// Task accepted into the scheduling queue
    TaskQueued { task_id: TaskId },
    /// Task dispatched to a worker
    TaskStarted { task_id: TaskId },
    /// Task finished successfully
    TaskCompleted { task_id: TaskId, duration_ms: u64 },
    /// Task reached a terminal failure (or was cancelled)
    TaskFailed {
        task_id: TaskId,
        error_kind: ErrorKind,
        message: String,
    },
    /// Task became blocked on unsatisfied dependencies
    DependencyBlocked {
        task_id: TaskId,
        blockers: Vec<TaskId>,
    },
    /// Ledger rejected a reservation during dispatch
    ResourceConstraint {
        task_id: TaskId,
        pool: String,
        needed: u64,
        available: u64,
    },
    /// The queue ran empty with no tasks running
    QueueDrained,
    /// A checkpoint was written
    CheckpointCreated {
        checkpoint_id: Uuid,
        kind: CheckpointKind,
    },
    /// A crashed session's state was restored at boot
    CrashRecovery {
        session_id: Uuid,
        recovered: usize,
    },
    /// Concurrent-session conflict surfaced by the `manual` policy
    ConflictDetected { task_id: TaskId },
}

/// Broadcast hub owned by one engine instance
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<FabricEvent>,
}

impl EventHub {
    /// Create a hub with the given per-subscriber buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber; events emitted after this call are
    /// delivered in order
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: FabricEvent) {
        debug!(?event, "emit");
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
