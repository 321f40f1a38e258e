use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::state::{StateOperation, StateUpdate, WorkflowCheckpoint, WorkflowState};

/// Lifecycle notifications published after the matching durable write
/// succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StateEvent {
    #[serde(rename = "state:created")]
    StateCreated {
        state: WorkflowState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "state:retrieved")]
    StateRetrieved {
        state: WorkflowState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "state:updated")]
    StateUpdated {
        previous: WorkflowState,
        state: WorkflowState,
        updates: StateUpdate,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "state:deleted", rename_all = "camelCase")]
    StateDeleted {
        state_id: String,
        workflow_id: String,
        deleted_by: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "checkpoint:created")]
    CheckpointCreated {
        checkpoint: WorkflowCheckpoint,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "state:restored", rename_all = "camelCase")]
    StateRestored {
        state: WorkflowState,
        checkpoint_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "transaction:committed", rename_all = "camelCase")]
    TransactionCommitted {
        transaction_id: String,
        operations: Vec<StateOperation>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "transaction:rolledback", rename_all = "camelCase")]
    TransactionRolledBack {
        transaction_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl StateEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::StateCreated { .. } => "state:created",
            StateEvent::StateRetrieved { .. } => "state:retrieved",
            StateEvent::StateUpdated { .. } => "state:updated",
            StateEvent::StateDeleted { .. } => "state:deleted",
            StateEvent::CheckpointCreated { .. } => "checkpoint:created",
            StateEvent::StateRestored { .. } => "state:restored",
            StateEvent::TransactionCommitted { .. } => "transaction:committed",
            StateEvent::TransactionRolledBack { .. } => "transaction:rolledback",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StateEvent::StateCreated { timestamp, .. }
            | StateEvent::StateRetrieved { timestamp, .. }
            | StateEvent::StateUpdated { timestamp, .. }
            | StateEvent::StateDeleted { timestamp, .. }
            | StateEvent::CheckpointCreated { timestamp, .. }
            | StateEvent::StateRestored { timestamp, .. }
            | StateEvent::TransactionCommitted { timestamp, .. }
            | StateEvent::TransactionRolledBack { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of `StateEvent`s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: StateEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers = receivers, "Published state event"),
            Err(_) => trace!(event = name, "No subscribers for state event"),
        }
    }
}
