//! Workflow state data model: statuses, state records, transitions,
//! checkpoints and transactional operations.

pub mod status;
pub mod types;

pub use status::{ParseStatusError, WorkflowStatus};
pub use types::{
    OperationKind, StateMetadata, StateOperation, StateTransition, StateTransitionRecord,
    StateUpdate, WorkflowCheckpoint, WorkflowState,
};
