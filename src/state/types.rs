use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::WorkflowStatus;

/// Audit fields carried by every state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 and grows by one on every mutation.
    pub version: u64,
    pub created_by: String,
    pub updated_by: String,
}

/// One entry of a state's bounded transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransitionRecord {
    pub id: String,
    pub previous_status: WorkflowStatus,
    pub new_status: WorkflowStatus,
    pub previous_step: String,
    pub new_step: String,
    pub timestamp: DateTime<Utc>,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Versioned record of a workflow instance's status, step and working data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_step: String,
    #[serde(default)]
    pub data: Value,
    pub metadata: StateMetadata,
    #[serde(default)]
    pub history: Vec<StateTransitionRecord>,
    /// Most recent checkpoint taken of this state, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl WorkflowState {
    /// Build a fresh version-1 state with a generated id and empty history.
    pub fn new(
        workflow_id: impl Into<String>,
        status: WorkflowStatus,
        current_step: impl Into<String>,
        data: Value,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let created_by = created_by.into();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status,
            current_step: current_step.into(),
            data,
            metadata: StateMetadata {
                created_at: now,
                updated_at: now,
                version: 1,
                created_by: created_by.clone(),
                updated_by: created_by,
            },
            history: Vec::new(),
            checkpoint_id: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Append a history entry and drop the oldest entries beyond `max_entries`.
    /// Returns how many entries were dropped.
    pub fn push_history(&mut self, record: StateTransitionRecord, max_entries: usize) -> usize {
        self.history.push(record);
        if self.history.len() > max_entries {
            let excess = self.history.len() - max_entries;
            self.history.drain(0..excess);
            excess
        } else {
            0
        }
    }

    /// History newest first, at most `limit` entries.
    pub fn recent_history(&self, limit: usize) -> Vec<StateTransitionRecord> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}

/// Partial update merged into a state by `update_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.current_step.is_none() && self.data.is_none()
    }
}

/// A requested status change, checked against the transition table and rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub triggered_by: String,
    /// Caller-supplied fields checked by transition rules.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl StateTransition {
    pub fn new(from: WorkflowStatus, to: WorkflowStatus) -> Self {
        Self {
            from,
            to,
            step: None,
            reason: None,
            triggered_by: "system".to_string(),
            payload: Map::new(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = actor.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Immutable point-in-time copy of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub state_id: String,
    pub snapshot: WorkflowState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WorkflowCheckpoint {
    pub fn of(state: &WorkflowState, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state_id: state.id.clone(),
            snapshot: state.clone(),
            created_at: Utc::now(),
            description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// A unit of work applied atomically by `StateStore::execute_transaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub state_id: String,
    /// Full state for create/update; absent for delete.
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<WorkflowState>,
    pub timestamp: DateTime<Utc>,
}

impl StateOperation {
    pub fn create(state: WorkflowState) -> Self {
        Self {
            kind: OperationKind::Create,
            state_id: state.id.clone(),
            state: Some(state),
            timestamp: Utc::now(),
        }
    }

    pub fn update(state: WorkflowState) -> Self {
        Self {
            kind: OperationKind::Update,
            state_id: state.id.clone(),
            state: Some(state),
            timestamp: Utc::now(),
        }
    }

    pub fn delete(state_id: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            state_id: state_id.into(),
            state: None,
            timestamp: Utc::now(),
        }
    }
}
