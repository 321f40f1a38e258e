use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

use super::error::StoreError;
use crate::state::{StateOperation, WorkflowCheckpoint, WorkflowState, WorkflowStatus};

/// Aggregate counts over the durable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_states: u64,
    pub total_checkpoints: u64,
    pub by_status: BTreeMap<WorkflowStatus, u64>,
    pub oldest_state_at: Option<DateTime<Utc>>,
    pub newest_state_at: Option<DateTime<Utc>>,
}

/// Durable tier of the state store.
///
/// Implementations own their transactional boundaries: every write method is
/// atomic on its own, and `apply_operations`/`compensate_operations` apply
/// their whole batch or nothing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Round trip to verify connectivity
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create the schema if it does not exist
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Insert or replace a state. Rejects the write with `VersionConflict`
    /// unless the stored version is lower than `state.metadata.version`.
    async fn upsert_state(&self, state: &WorkflowState) -> Result<(), StoreError>;

    async fn fetch_state(&self, id: &str) -> Result<Option<WorkflowState>, StoreError>;

    async fn fetch_states_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowState>, StoreError>;

    /// Returns the number of deleted rows
    async fn delete_state(&self, id: &str) -> Result<u64, StoreError>;

    /// Point a state at its latest checkpoint without touching its version.
    /// Returns the number of updated rows
    async fn link_checkpoint(
        &self,
        state_id: &str,
        checkpoint_id: &str,
    ) -> Result<u64, StoreError>;

    async fn insert_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError>;

    async fn fetch_checkpoint(&self, id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError>;

    /// Checkpoints of one state, newest first
    async fn fetch_checkpoints_for_state(
        &self,
        state_id: &str,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError>;

    async fn apply_operations(&self, operations: &[StateOperation]) -> Result<(), StoreError>;

    /// Undo what can be undone for a batch. Returns the number of rows removed
    async fn compensate_operations(
        &self,
        operations: &[StateOperation],
    ) -> Result<u64, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
