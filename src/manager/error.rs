use thiserror::Error;

use crate::store::StoreError;
use crate::validation::ValidationResult;

/// How a transaction was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    TimedOut,
}

impl std::fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransactionOutcome::Committed => "committed",
            TransactionOutcome::RolledBack => "rolled back",
            TransactionOutcome::TimedOut => "rolled back after timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to create state for workflow {workflow_id}: {source}")]
    CreationFailed {
        workflow_id: String,
        #[source]
        source: Box<StateError>,
    },

    #[error("failed to retrieve state {state_id}: {source}")]
    RetrievalFailed {
        state_id: String,
        #[source]
        source: StoreError,
    },

    #[error("state validation failed: {}", result.summary())]
    ValidationFailed { result: ValidationResult },

    #[error("state {0} not found")]
    StateNotFound(String),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("transaction {id} already {outcome}")]
    TransactionResolved {
        id: String,
        outcome: TransactionOutcome,
    },

    #[error("transaction {id} failed and was rolled back: {source}")]
    TransactionFailed {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("state manager is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StateError {
    /// Validation details when this error, or the error it wraps, is a
    /// validation failure.
    pub fn validation(&self) -> Option<&ValidationResult> {
        match self {
            StateError::ValidationFailed { result } => Some(result),
            StateError::CreationFailed { source, .. } => source.validation(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StateError::StateNotFound(_)
            | StateError::CheckpointNotFound(_)
            | StateError::TransactionNotFound(_) => true,
            StateError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
