// Workflow State Library - versioned workflow state with validated transitions,
// checkpoints and transactional persistence

pub mod config;
pub mod manager;
pub mod observability;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod validation;

// Re-export key types for easy access
pub use config::StateCoreConfig;
pub use manager::{
    ManagerStats, StateError, StateEvent, TransactionInfo, TransactionOutcome,
    WorkflowStateManager,
};
pub use observability::{OperationTimer, StoreMetrics, StoreMetricsSnapshot};
pub use state::{
    OperationKind, StateMetadata, StateOperation, StateTransition, StateTransitionRecord,
    StateUpdate, WorkflowCheckpoint, WorkflowState, WorkflowStatus,
};
pub use store::{
    CacheError, DurableBackend, MokaStateCache, SqliteBackend, StateCache, StateStore,
    StoreError, StoreStats,
};
pub use telemetry::{create_state_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use validation::{
    Condition, ConditionError, ConditionOperator, FnRule, StateValidator, TransitionRule,
    ValidationCode, ValidationIssue, ValidationResult, ValidationRule,
};
