//! Orchestration of validated, observable and optionally transactional state
//! mutations.

pub mod error;
pub mod events;
pub mod locks;
pub mod transactions;

pub use error::{Result, StateError, TransactionOutcome};
pub use events::{EventBus, StateEvent};
pub use locks::StateLocks;
pub use transactions::{TransactionInfo, TransactionRegistry};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{ManagerConfig, StateCoreConfig};
use crate::observability::StoreMetricsSnapshot;
use crate::state::{
    StateOperation, StateTransition, StateTransitionRecord, StateUpdate, WorkflowCheckpoint,
    WorkflowState, WorkflowStatus,
};
use crate::store::{StateStore, StoreError, StoreStats};
use crate::telemetry::{create_state_span, generate_correlation_id};
use crate::time_operation;
use crate::validation::{StateValidator, TransitionRule, ValidationResult, ValidationRule};

const INITIAL_CHECKPOINT: &str = "Initial state";

/// Combined view of store counts, tier metrics and manager bookkeeping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub store: StoreStats,
    pub metrics: StoreMetricsSnapshot,
    pub active_transactions: usize,
    pub subscribers: usize,
}

/// Public entry point for workflow state lifecycle operations.
///
/// Cloning is cheap and every clone shares the same store, validator, event
/// bus and transaction registry.
#[derive(Debug, Clone)]
pub struct WorkflowStateManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: StateStore,
    validator: RwLock<StateValidator>,
    config: ManagerConfig,
    events: EventBus,
    locks: StateLocks,
    transactions: TransactionRegistry,
    closed: AtomicBool,
}

impl WorkflowStateManager {
    pub fn new(store: StateStore, validator: StateValidator, config: ManagerConfig) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                validator: RwLock::new(validator),
                config,
                events,
                locks: StateLocks::new(),
                transactions: TransactionRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect and initialize the store described by `config` and build a
    /// manager over it with the built-in validation rules.
    pub async fn from_config(config: &StateCoreConfig) -> Result<Self> {
        let store = StateStore::connect(config).await?;
        store.initialize().await?;
        let validator = StateValidator::new(&config.validator);
        Ok(Self::new(store, validator, config.manager.clone()))
    }

    pub async fn initialize(&self) -> Result<()> {
        self.inner.store.initialize().await?;
        Ok(())
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(StateError::Closed)
        } else {
            Ok(())
        }
    }

    async fn validate(&self, state: &WorkflowState) -> Result<()> {
        let result = self.inner.validator.read().await.validate_state(state);
        reject_invalid(result)
    }

    /// Load a state for mutation from the durable store, never the cache.
    /// Unknown ids are `StateNotFound`.
    async fn load(&self, id: &str) -> Result<WorkflowState> {
        self.inner
            .store
            .get_latest_state(id)
            .await?
            .ok_or_else(|| StateError::StateNotFound(id.to_string()))
    }

    pub async fn create_state(
        &self,
        workflow_id: impl Into<String>,
        status: WorkflowStatus,
        current_step: impl Into<String>,
        data: Value,
        created_by: impl Into<String>,
    ) -> Result<WorkflowState> {
        let workflow_id = workflow_id.into();
        let correlation_id = generate_correlation_id();
        let span = create_state_span(
            "create_state",
            None,
            Some(workflow_id.as_str()),
            Some(correlation_id.as_str()),
        );

        let state = WorkflowState::new(
            workflow_id.clone(),
            status,
            current_step,
            data,
            created_by,
        );
        self.create_state_inner(state)
            .instrument(span)
            .await
            .map_err(|e| {
                error!(workflow_id = %workflow_id, error = %e, "Failed to create workflow state");
                StateError::CreationFailed {
                    workflow_id,
                    source: Box::new(e),
                }
            })
    }

    async fn create_state_inner(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        self.ensure_open()?;
        time_operation!("manager.create_state");

        self.validate(&state).await?;
        self.inner.store.save_state(&state).await?;

        let checkpoint = WorkflowCheckpoint::of(&state, Some(INITIAL_CHECKPOINT.to_string()));
        if let Err(e) = self.save_initial_checkpoint(&checkpoint).await {
            // a state without its initial checkpoint is not left behind
            if let Err(cleanup) = self.inner.store.delete_state(&state.id).await {
                error!(
                    state_id = %state.id,
                    error = %cleanup,
                    "Failed to remove state after checkpoint failure"
                );
            }
            return Err(e);
        }
        state.checkpoint_id = Some(checkpoint.id.clone());

        info!(
            state_id = %state.id,
            workflow_id = %state.workflow_id,
            status = %state.status,
            "Created workflow state"
        );
        let timestamp = Utc::now();
        self.inner.events.publish(StateEvent::CheckpointCreated {
            checkpoint,
            timestamp,
        });
        self.inner.events.publish(StateEvent::StateCreated {
            state: state.clone(),
            timestamp,
        });
        Ok(state)
    }

    async fn save_initial_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        self.inner.store.save_checkpoint(checkpoint).await?;
        self.inner
            .store
            .link_checkpoint(&checkpoint.state_id, &checkpoint.id)
            .await?;
        Ok(())
    }

    /// `Ok(None)` for unknown ids
    pub async fn get_state(&self, id: &str) -> Result<Option<WorkflowState>> {
        self.ensure_open()?;
        let state = self
            .inner
            .store
            .get_state(id)
            .await
            .map_err(|source| StateError::RetrievalFailed {
                state_id: id.to_string(),
                source,
            })?;

        if let Some(state) = &state {
            self.inner.events.publish(StateEvent::StateRetrieved {
                state: state.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(state)
    }

    pub async fn list_workflow_states(&self, workflow_id: &str) -> Result<Vec<WorkflowState>> {
        self.ensure_open()?;
        Ok(self.inner.store.get_states_by_workflow(workflow_id).await?)
    }

    /// Merge `updates` into the state, bump its version and record a history
    /// entry. `data`, when present, replaces the previous payload.
    pub async fn update_state(
        &self,
        id: &str,
        updates: StateUpdate,
        updated_by: &str,
        reason: Option<String>,
    ) -> Result<WorkflowState> {
        self.ensure_open()?;
        let _guard = self.inner.locks.acquire(id).await;
        let current = self.load(id).await?;
        self.apply_update(current, updates, updated_by, reason).await
    }

    /// Read-modify-write shared by updates and transitions. Callers hold the
    /// state's lock.
    async fn apply_update(
        &self,
        current: WorkflowState,
        updates: StateUpdate,
        updated_by: &str,
        reason: Option<String>,
    ) -> Result<WorkflowState> {
        let now = Utc::now();
        let mut next = current.clone();
        if let Some(status) = updates.status {
            next.status = status;
        }
        if let Some(step) = &updates.current_step {
            next.current_step = step.clone();
        }
        if let Some(data) = &updates.data {
            next.data = data.clone();
        }
        next.metadata.version += 1;
        next.metadata.updated_at = now;
        next.metadata.updated_by = updated_by.to_string();

        let record = StateTransitionRecord {
            id: Uuid::new_v4().to_string(),
            previous_status: current.status,
            new_status: next.status,
            previous_step: current.current_step.clone(),
            new_step: next.current_step.clone(),
            timestamp: now,
            triggered_by: updated_by.to_string(),
            reason,
        };
        let dropped = next.push_history(record, self.inner.config.max_history_entries);
        if dropped > 0 {
            debug!(state_id = %next.id, dropped = dropped, "Trimmed state history");
        }

        self.validate(&next).await?;
        self.inner.store.save_state(&next).await?;

        debug!(
            state_id = %next.id,
            version = next.metadata.version,
            "Updated workflow state"
        );
        self.inner.events.publish(StateEvent::StateUpdated {
            previous: current,
            state: next.clone(),
            updates,
            timestamp: now,
        });
        Ok(next)
    }

    /// Validate `transition` against the stored state and apply it.
    pub async fn transition_state(
        &self,
        id: &str,
        transition: StateTransition,
    ) -> Result<WorkflowState> {
        self.ensure_open()?;
        let correlation_id = generate_correlation_id();
        let span = create_state_span(
            "transition_state",
            Some(id),
            None,
            Some(correlation_id.as_str()),
        );
        self.transition_state_inner(id, transition)
            .instrument(span)
            .await
    }

    async fn transition_state_inner(
        &self,
        id: &str,
        transition: StateTransition,
    ) -> Result<WorkflowState> {
        let _guard = self.inner.locks.acquire(id).await;
        let current = self.load(id).await?;

        let result = self
            .inner
            .validator
            .read()
            .await
            .validate_transition(&current, &transition);
        if !result.is_valid {
            warn!(
                state_id = id,
                from = %transition.from,
                to = %transition.to,
                errors = %result.summary(),
                "Rejected state transition"
            );
            return Err(StateError::ValidationFailed { result });
        }

        let updates = StateUpdate {
            status: Some(transition.to),
            current_step: transition.step.clone(),
            data: None,
        };
        info!(
            state_id = id,
            from = %transition.from,
            to = %transition.to,
            "Transitioning workflow state"
        );
        self.apply_update(current, updates, &transition.triggered_by, transition.reason)
            .await
    }

    /// Statuses the state can move to next
    pub async fn allowed_transitions(&self, id: &str) -> Result<Vec<WorkflowStatus>> {
        self.ensure_open()?;
        let state = self.load(id).await?;
        Ok(self
            .inner
            .validator
            .read()
            .await
            .get_allowed_transitions(state.status))
    }

    /// Snapshot the current state and link it as the state's latest
    /// checkpoint. Version and history are left alone.
    pub async fn create_checkpoint(
        &self,
        state_id: &str,
        description: Option<String>,
    ) -> Result<WorkflowCheckpoint> {
        self.ensure_open()?;
        let _guard = self.inner.locks.acquire(state_id).await;
        let state = self.load(state_id).await?;

        let checkpoint = WorkflowCheckpoint::of(&state, description);
        self.inner.store.save_checkpoint(&checkpoint).await?;
        self.inner
            .store
            .link_checkpoint(state_id, &checkpoint.id)
            .await?;

        info!(
            checkpoint_id = %checkpoint.id,
            state_id = state_id,
            version = state.metadata.version,
            "Created checkpoint"
        );
        self.inner.events.publish(StateEvent::CheckpointCreated {
            checkpoint: checkpoint.clone(),
            timestamp: Utc::now(),
        });
        Ok(checkpoint)
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<WorkflowCheckpoint> {
        self.ensure_open()?;
        self.inner
            .store
            .get_checkpoint(checkpoint_id)
            .await
            .map_err(|e| match e {
                StoreError::CheckpointNotFound(id) => StateError::CheckpointNotFound(id),
                other => other.into(),
            })
    }

    /// Checkpoints of one state, newest first
    pub async fn list_checkpoints(&self, state_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        self.ensure_open()?;
        Ok(self.inner.store.list_checkpoints(state_id).await?)
    }

    /// Rewind a state to a checkpoint's snapshot. The restored record gets a
    /// version above both the snapshot and the live record, so versions never
    /// go backwards. Works for deleted states too.
    pub async fn restore_from_checkpoint(
        &self,
        checkpoint_id: &str,
        restored_by: &str,
    ) -> Result<WorkflowState> {
        self.ensure_open()?;
        let checkpoint = self.get_checkpoint(checkpoint_id).await?;
        let _guard = self.inner.locks.acquire(&checkpoint.state_id).await;

        let live = self
            .inner
            .store
            .get_latest_state(&checkpoint.state_id)
            .await?;
        let snapshot = &checkpoint.snapshot;
        let base_version = live
            .as_ref()
            .map_or(snapshot.metadata.version, |live| {
                live.metadata.version.max(snapshot.metadata.version)
            });

        let now = Utc::now();
        let mut restored = snapshot.clone();
        restored.metadata.version = base_version + 1;
        restored.metadata.updated_at = now;
        restored.metadata.updated_by = restored_by.to_string();
        restored.checkpoint_id = Some(checkpoint.id.clone());

        let (previous_status, previous_step) = match &live {
            Some(live) => (live.status, live.current_step.clone()),
            None => (snapshot.status, snapshot.current_step.clone()),
        };
        restored.push_history(
            StateTransitionRecord {
                id: Uuid::new_v4().to_string(),
                previous_status,
                new_status: snapshot.status,
                previous_step,
                new_step: snapshot.current_step.clone(),
                timestamp: now,
                triggered_by: restored_by.to_string(),
                reason: Some(format!("Restored from checkpoint {}", checkpoint.id)),
            },
            self.inner.config.max_history_entries,
        );

        self.validate(&restored).await?;
        self.inner.store.save_state(&restored).await?;

        info!(
            state_id = %restored.id,
            checkpoint_id = %checkpoint.id,
            version = restored.metadata.version,
            "Restored workflow state from checkpoint"
        );
        self.inner.events.publish(StateEvent::StateRestored {
            state: restored.clone(),
            checkpoint_id: checkpoint.id.clone(),
            timestamp: now,
        });
        Ok(restored)
    }

    pub async fn delete_state(&self, id: &str, deleted_by: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.locks.acquire(id).await;
        let state = self.load(id).await?;

        self.inner.store.delete_state(id).await.map_err(|e| match e {
            StoreError::StateNotFound(id) => StateError::StateNotFound(id),
            other => other.into(),
        })?;

        info!(
            state_id = id,
            workflow_id = %state.workflow_id,
            deleted_by = deleted_by,
            "Deleted workflow state"
        );
        self.inner.events.publish(StateEvent::StateDeleted {
            state_id: state.id,
            workflow_id: state.workflow_id,
            deleted_by: deleted_by.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// History newest first, at most `limit` entries
    pub async fn get_state_history(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<StateTransitionRecord>> {
        self.ensure_open()?;
        Ok(self.load(id).await?.recent_history(limit))
    }

    /// Open a transaction. Unless committed first, it is rolled back once
    /// `timeout` (or the configured default) elapses.
    pub async fn start_transaction(&self, timeout: Option<Duration>) -> Result<String> {
        self.ensure_open()?;
        let id = Uuid::new_v4().to_string();
        let timeout = timeout.unwrap_or_else(|| self.inner.config.transaction_timeout());
        self.inner.transactions.begin(&id, timeout).await;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let transaction_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_transaction(&transaction_id).await;
            }
        });
        self.inner.transactions.attach_timer(&id, timer).await;

        info!(transaction_id = %id, timeout_ms = timeout.as_millis() as u64, "Started transaction");
        Ok(id)
    }

    /// Queue an operation. States carried by create/update operations are
    /// validated now. Returns the number of queued operations.
    pub async fn queue_operation(
        &self,
        transaction_id: &str,
        operation: StateOperation,
    ) -> Result<usize> {
        self.ensure_open()?;
        if let Some(state) = &operation.state {
            self.validate(state).await?;
        }
        self.inner
            .transactions
            .queue(transaction_id, operation)
            .await
    }

    /// Apply every queued operation atomically. Returns the number applied.
    pub async fn commit_transaction(&self, transaction_id: &str) -> Result<usize> {
        self.ensure_open()?;
        let transaction = self
            .inner
            .transactions
            .claim(transaction_id, TransactionOutcome::Committed)
            .await?;
        let operations = transaction.operations;

        match self.inner.store.execute_transaction(&operations).await {
            Ok(()) => {
                info!(
                    transaction_id = transaction_id,
                    operations = operations.len(),
                    "Committed transaction"
                );
                let applied = operations.len();
                self.inner.events.publish(StateEvent::TransactionCommitted {
                    transaction_id: transaction_id.to_string(),
                    operations,
                    timestamp: Utc::now(),
                });
                Ok(applied)
            }
            Err(source) => {
                // the batch ran in one database transaction, so nothing of it
                // was persisted and there is nothing to compensate
                error!(
                    transaction_id = transaction_id,
                    error = %source,
                    "Transaction commit failed, batch rolled back"
                );
                self.inner
                    .transactions
                    .record(transaction_id, TransactionOutcome::RolledBack);
                self.inner.discard(transaction_id, &operations, &source.to_string());
                Err(StateError::TransactionFailed {
                    id: transaction_id.to_string(),
                    source,
                })
            }
        }
    }

    pub async fn rollback_transaction(&self, transaction_id: &str) -> Result<()> {
        self.ensure_open()?;
        let transaction = self
            .inner
            .transactions
            .claim(transaction_id, TransactionOutcome::RolledBack)
            .await?;
        self.inner.discard(transaction_id, &transaction.operations, "Rolled back by caller");
        Ok(())
    }

    pub async fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.inner.transactions.active().await
    }

    pub fn transaction_outcome(&self, transaction_id: &str) -> Option<TransactionOutcome> {
        self.inner.transactions.outcome(transaction_id)
    }

    /// Register a validation rule, replacing any rule with the same name
    pub async fn add_validation_rule(&self, rule: Box<dyn ValidationRule>) {
        info!(rule = rule.name(), "Registering validation rule");
        self.inner.validator.write().await.add_rule(rule);
    }

    pub async fn remove_validation_rule(&self, name: &str) -> bool {
        self.inner.validator.write().await.remove_rule(name)
    }

    pub async fn add_transition_rule(&self, rule: TransitionRule) {
        info!(rule = %rule.name, "Registering transition rule");
        self.inner.validator.write().await.add_transition_rule(rule);
    }

    pub async fn remove_transition_rule(&self, name: &str) -> bool {
        self.inner
            .validator
            .write()
            .await
            .remove_transition_rule(name)
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        self.ensure_open()?;
        Ok(ManagerStats {
            store: self.inner.store.get_stats().await?,
            metrics: self.inner.store.metrics().get_stats(),
            active_transactions: self.inner.transactions.active().await.len(),
            subscribers: self.inner.events.subscriber_count(),
        })
    }

    /// Roll back every open transaction, then close the store. Later calls
    /// are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing workflow state manager");

        for id in self.inner.transactions.pending_ids().await {
            if let Ok(transaction) = self
                .inner
                .transactions
                .claim(&id, TransactionOutcome::RolledBack)
                .await
            {
                self.inner.discard(&id, &transaction.operations, "Manager closed");
            }
        }

        self.inner.store.close().await?;
        Ok(())
    }
}

impl Inner {
    /// Timer path. Does nothing if the transaction was already resolved.
    async fn expire_transaction(&self, transaction_id: &str) {
        match self
            .transactions
            .claim(transaction_id, TransactionOutcome::TimedOut)
            .await
        {
            Ok(transaction) => {
                warn!(
                    transaction_id = transaction_id,
                    operations = transaction.operations.len(),
                    "Transaction timed out"
                );
                self.discard(transaction_id, &transaction.operations, "Transaction timeout");
            }
            Err(e) => debug!(
                transaction_id = transaction_id,
                reason = %e,
                "Timer found transaction resolved"
            ),
        }
    }

    /// Drop a transaction's queued operations and announce the rollback.
    /// Queued operations only reach the store on commit, so the database is
    /// never touched here.
    fn discard(&self, transaction_id: &str, operations: &[StateOperation], reason: &str) {
        info!(
            transaction_id = transaction_id,
            discarded = operations.len(),
            reason = reason,
            "Rolled back transaction"
        );
        self.events.publish(StateEvent::TransactionRolledBack {
            transaction_id: transaction_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn reject_invalid(result: ValidationResult) -> Result<()> {
    if result.is_valid {
        for warning in &result.warnings {
            warn!(code = %warning.code, message = %warning.message, "State validation warning");
        }
        Ok(())
    } else {
        Err(StateError::ValidationFailed { result })
    }
}
