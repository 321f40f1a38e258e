use thiserror::Error;

/// Errors raised by the cache tier. Always degrading, never fatal on reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur in the durable store or the store facade
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store is not initialized")]
    NotInitialized,

    #[error("state store initialization failed: {0}")]
    Initialization(#[source] Box<StoreError>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("state {0} not found")]
    StateNotFound(String),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("version conflict on state {state_id}: version {version} is not newer than the stored record")]
    VersionConflict { state_id: String, version: u64 },

    #[error("invalid {kind} operation on state {state_id}: {reason}")]
    InvalidOperation {
        kind: &'static str,
        state_id: String,
        reason: String,
    },

    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("failed to close store (durable: {durable:?}, cache: {cache:?})")]
    Close {
        durable: Option<String>,
        cache: Option<String>,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::StateNotFound(_) | StoreError::CheckpointNotFound(_)
        )
    }
}
