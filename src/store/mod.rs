//! Cache-aside persistence for workflow states, checkpoints and operation
//! batches.
//!
//! The durable tier is the source of truth. The cache tier only accelerates
//! reads: a failing cache is logged and counted, never surfaced to callers.

pub mod backend;
pub mod cache;
pub mod error;
pub mod sqlite;

pub use backend::{DurableBackend, StoreStats};
pub use cache::{state_cache_key, MokaStateCache, StateCache};
pub use error::{CacheError, StoreError};
pub use sqlite::SqliteBackend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::StateCoreConfig;
use crate::observability::{OperationTimer, StoreMetrics};
use crate::state::{OperationKind, StateOperation, WorkflowCheckpoint, WorkflowState};

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct StateStore {
    backend: Arc<dyn DurableBackend>,
    cache: Arc<dyn StateCache>,
    initialized: AtomicBool,
    closed: AtomicBool,
    metrics: Arc<StoreMetrics>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("metrics", &self.metrics.get_stats())
            .finish()
    }
}

impl StateStore {
    pub fn new(backend: Arc<dyn DurableBackend>, cache: Arc<dyn StateCache>) -> Self {
        Self {
            backend,
            cache,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics: Arc::new(StoreMetrics::new()),
        }
    }

    /// Build the SQLite + moka store described by the configuration.
    /// The returned store still needs `initialize`.
    pub async fn connect(config: &StateCoreConfig) -> Result<Self> {
        let backend = SqliteBackend::connect(&config.database).await?;
        let cache = MokaStateCache::new(&config.cache);
        Ok(Self::new(Arc::new(backend), Arc::new(cache)))
    }

    /// Verify both tiers and create the schema. Failures are fatal and not
    /// retried.
    pub async fn initialize(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::NotInitialized);
        }
        if self.initialized.load(Ordering::Acquire) {
            debug!("State store already initialized");
            return Ok(());
        }

        let wrap = |e: StoreError| {
            error!(error = %e, "State store initialization failed");
            StoreError::Initialization(Box::new(e))
        };

        self.backend.ping().await.map_err(wrap)?;
        self.backend.migrate().await.map_err(wrap)?;
        self.cache
            .ping()
            .await
            .map_err(|e| wrap(StoreError::Cache(e)))?;

        self.initialized.store(true, Ordering::Release);
        info!("State store initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Arc<StoreMetrics> {
        Arc::clone(&self.metrics)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn durable_failure(&self, operation: &'static str, e: StoreError) -> StoreError {
        self.metrics.record_durable_error();
        error!(operation = operation, error = %e, "Durable store operation failed");
        e
    }

    async fn cache_put(&self, state: &WorkflowState) {
        if let Err(e) = self.cache.set(&state_cache_key(&state.id), state).await {
            self.metrics.record_cache_error();
            warn!(state_id = %state.id, error = %e, "Failed to refresh cache entry");
        }
    }

    /// Populate the cache after a miss unless a writer already stored the
    /// same or a newer version meanwhile.
    async fn cache_fill(&self, state: &WorkflowState) {
        if let Ok(Some(cached)) = self.cache.get(&state_cache_key(&state.id)).await {
            if cached.metadata.version >= state.metadata.version {
                debug!(state_id = %state.id, "Cache already holds a newer version");
                return;
            }
        }
        self.cache_put(state).await;
    }

    async fn cache_evict(&self, state_id: &str) {
        if let Err(e) = self.cache.delete(&state_cache_key(state_id)).await {
            self.metrics.record_cache_error();
            warn!(state_id = state_id, error = %e, "Failed to evict cache entry");
        }
    }

    /// Durable upsert followed by a best-effort cache refresh
    pub async fn save_state(&self, state: &WorkflowState) -> Result<()> {
        self.ensure_ready()?;
        let _timer = OperationTimer::new("store.save_state");

        if let Err(e) = self.backend.upsert_state(state).await {
            if matches!(e, StoreError::VersionConflict { .. }) {
                // the cached copy is what the caller built on, so it is stale
                self.cache_evict(&state.id).await;
            }
            return Err(self.durable_failure("save_state", e));
        }
        self.metrics.record_durable_write();

        self.cache_put(state).await;
        debug!(state_id = %state.id, version = state.metadata.version, "Saved workflow state");
        Ok(())
    }

    /// Cache-first read. Unknown ids yield `Ok(None)`.
    pub async fn get_state(&self, id: &str) -> Result<Option<WorkflowState>> {
        self.ensure_ready()?;
        let key = state_cache_key(id);

        match self.cache.get(&key).await {
            Ok(Some(state)) => {
                self.metrics.record_cache_hit();
                debug!(state_id = id, "Cache hit");
                return Ok(Some(state));
            }
            Ok(None) => {
                self.metrics.record_cache_miss();
                debug!(state_id = id, "Cache miss");
            }
            Err(e) => {
                self.metrics.record_cache_error();
                warn!(
                    state_id = id,
                    error = %e,
                    "Cache read failed, falling back to durable store"
                );
            }
        }

        let state = self
            .backend
            .fetch_state(id)
            .await
            .map_err(|e| self.durable_failure("get_state", e))?;
        self.metrics.record_durable_read();

        if let Some(state) = &state {
            self.cache_fill(state).await;
        }
        Ok(state)
    }

    /// Durable read that bypasses the cache, for read-modify-write paths.
    /// The cache is refreshed with the result.
    pub async fn get_latest_state(&self, id: &str) -> Result<Option<WorkflowState>> {
        self.ensure_ready()?;
        let state = self
            .backend
            .fetch_state(id)
            .await
            .map_err(|e| self.durable_failure("get_latest_state", e))?;
        self.metrics.record_durable_read();

        match &state {
            Some(state) => self.cache_put(state).await,
            None => self.cache_evict(id).await,
        }
        Ok(state)
    }

    pub async fn get_states_by_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowState>> {
        self.ensure_ready()?;
        let states = self
            .backend
            .fetch_states_by_workflow(workflow_id)
            .await
            .map_err(|e| self.durable_failure("get_states_by_workflow", e))?;
        self.metrics.record_durable_read();
        Ok(states)
    }

    pub async fn delete_state(&self, id: &str) -> Result<()> {
        self.ensure_ready()?;
        let deleted = self
            .backend
            .delete_state(id)
            .await
            .map_err(|e| self.durable_failure("delete_state", e))?;
        if deleted == 0 {
            return Err(StoreError::StateNotFound(id.to_string()));
        }
        self.metrics.record_durable_write();

        self.cache_evict(id).await;
        info!(state_id = id, "Deleted workflow state");
        Ok(())
    }

    pub async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        self.ensure_ready()?;
        self.backend
            .insert_checkpoint(checkpoint)
            .await
            .map_err(|e| self.durable_failure("save_checkpoint", e))?;
        self.metrics.record_durable_write();
        debug!(checkpoint_id = %checkpoint.id, state_id = %checkpoint.state_id, "Saved checkpoint");
        Ok(())
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<WorkflowCheckpoint> {
        self.ensure_ready()?;
        let checkpoint = self
            .backend
            .fetch_checkpoint(id)
            .await
            .map_err(|e| self.durable_failure("get_checkpoint", e))?;
        self.metrics.record_durable_read();
        checkpoint.ok_or_else(|| StoreError::CheckpointNotFound(id.to_string()))
    }

    /// Checkpoints of one state, newest first
    pub async fn list_checkpoints(&self, state_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        self.ensure_ready()?;
        let checkpoints = self
            .backend
            .fetch_checkpoints_for_state(state_id)
            .await
            .map_err(|e| self.durable_failure("list_checkpoints", e))?;
        self.metrics.record_durable_read();
        Ok(checkpoints)
    }

    /// Record `checkpoint_id` as the state's latest checkpoint. Neither the
    /// version nor the history changes.
    pub async fn link_checkpoint(&self, state_id: &str, checkpoint_id: &str) -> Result<()> {
        self.ensure_ready()?;
        let updated = self
            .backend
            .link_checkpoint(state_id, checkpoint_id)
            .await
            .map_err(|e| self.durable_failure("link_checkpoint", e))?;
        if updated == 0 {
            return Err(StoreError::StateNotFound(state_id.to_string()));
        }
        self.metrics.record_durable_write();
        self.cache_evict(state_id).await;
        Ok(())
    }

    /// Apply a batch atomically. On failure nothing in the batch is persisted.
    pub async fn execute_transaction(&self, operations: &[StateOperation]) -> Result<()> {
        self.ensure_ready()?;
        let _timer = OperationTimer::new("store.execute_transaction");

        self.backend
            .apply_operations(operations)
            .await
            .map_err(|e| self.durable_failure("execute_transaction", e))?;
        self.metrics.record_durable_write();

        for operation in operations {
            match (&operation.kind, &operation.state) {
                (OperationKind::Create | OperationKind::Update, Some(state)) => {
                    self.cache_put(state).await
                }
                _ => self.cache_evict(&operation.state_id).await,
            }
        }
        info!(operations = operations.len(), "Transaction executed");
        Ok(())
    }

    /// Compensate a batch that may have been applied. Returns the number of
    /// rows removed.
    pub async fn rollback_transaction(&self, operations: &[StateOperation]) -> Result<u64> {
        self.ensure_ready()?;
        let removed = self
            .backend
            .compensate_operations(operations)
            .await
            .map_err(|e| self.durable_failure("rollback_transaction", e))?;

        for operation in operations
            .iter()
            .filter(|op| op.kind == OperationKind::Create)
        {
            self.cache_evict(&operation.state_id).await;
        }
        info!(
            operations = operations.len(),
            removed = removed,
            "Transaction compensated"
        );
        Ok(removed)
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        self.ensure_ready()?;
        self.backend
            .stats()
            .await
            .map_err(|e| self.durable_failure("get_stats", e))
    }

    /// Release both tiers. Errors from either tier are reported together.
    /// Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("State store already closed");
            return Ok(());
        }
        self.initialized.store(false, Ordering::Release);

        let durable = self.backend.close().await.err().map(|e| e.to_string());
        let cache = self.cache.close().await.err().map(|e| e.to_string());
        self.metrics.log_stats();

        if durable.is_some() || cache.is_some() {
            error!(?durable, ?cache, "State store closed with errors");
            return Err(StoreError::Close { durable, cache });
        }
        info!("State store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::backend::MockDurableBackend;
    use super::cache::MockStateCache;
    use super::*;
    use crate::state::WorkflowStatus;
    use serde_json::json;

    fn sample() -> WorkflowState {
        WorkflowState::new("wf-1", WorkflowStatus::Pending, "start", json!({}), "tester")
    }

    fn healthy_backend() -> MockDurableBackend {
        let mut backend = MockDurableBackend::new();
        backend.expect_ping().returning(|| Ok(()));
        backend.expect_migrate().returning(|| Ok(()));
        backend
    }

    fn healthy_cache() -> MockStateCache {
        let mut cache = MockStateCache::new();
        cache.expect_ping().returning(|| Ok(()));
        cache
    }

    async fn ready(backend: MockDurableBackend, cache: MockStateCache) -> StateStore {
        let store = StateStore::new(Arc::new(backend), Arc::new(cache));
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail_fast() {
        let store = StateStore::new(
            Arc::new(MockDurableBackend::new()),
            Arc::new(MockStateCache::new()),
        );
        assert!(matches!(
            store.get_state("x").await,
            Err(StoreError::NotInitialized)
        ));
        assert!(matches!(
            store.save_state(&sample()).await,
            Err(StoreError::NotInitialized)
        ));
        assert!(matches!(
            store.get_stats().await,
            Err(StoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_initialize_failure_propagates() {
        let mut backend = MockDurableBackend::new();
        backend
            .expect_ping()
            .returning(|| Err(StoreError::StateNotFound("db".to_string())));
        let store = StateStore::new(Arc::new(backend), Arc::new(MockStateCache::new()));

        let err = store.initialize().await.unwrap_err();
        assert!(matches!(err, StoreError::Initialization(_)));
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn test_unreachable_cache_fails_initialize() {
        let mut cache = MockStateCache::new();
        cache
            .expect_ping()
            .returning(|| Err(CacheError::Unavailable("refused".to_string())));
        let store = StateStore::new(Arc::new(healthy_backend()), Arc::new(cache));

        let err = store.initialize().await.unwrap_err();
        match err {
            StoreError::Initialization(inner) => {
                assert!(matches!(*inner, StoreError::Cache(CacheError::Unavailable(_))))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_durable_store() {
        let state = sample();
        let cached = state.clone();
        let mut backend = healthy_backend();
        backend.expect_fetch_state().times(0);
        let mut cache = healthy_cache();
        cache
            .expect_get()
            .times(2)
            .returning(move |_| Ok(Some(cached.clone())));

        let store = ready(backend, cache).await;
        let first = store.get_state(&state.id).await.unwrap();
        let second = store.get_state(&state.id).await.unwrap();
        assert_eq!(first, Some(state));
        assert_eq!(first, second);

        let metrics = store.metrics().get_stats();
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.durable_reads, 0);
    }

    #[tokio::test]
    async fn test_cache_miss_populates_cache() {
        let state = sample();
        let stored = state.clone();
        let mut backend = healthy_backend();
        backend
            .expect_fetch_state()
            .times(1)
            .returning(move |_| Ok(Some(stored.clone())));
        let mut cache = healthy_cache();
        cache.expect_get().times(2).returning(|_| Ok(None));
        cache.expect_set().times(1).returning(|_, _| Ok(()));

        let store = ready(backend, cache).await;
        assert_eq!(store.get_state(&state.id).await.unwrap(), Some(state));
        assert_eq!(store.metrics().get_stats().cache_misses, 1);
    }

    #[tokio::test]
    async fn test_miss_does_not_overwrite_newer_cached_version() {
        let stale = sample();
        let mut newer = stale.clone();
        newer.metadata.version = 2;
        let stored = stale.clone();
        let mut backend = healthy_backend();
        backend
            .expect_fetch_state()
            .times(1)
            .returning(move |_| Ok(Some(stored.clone())));

        // a writer fills the cache between the miss and the fill
        let mut cache = healthy_cache();
        let mut calls = 0;
        cache.expect_get().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(None)
            } else {
                Ok(Some(newer.clone()))
            }
        });
        cache.expect_set().times(0);

        let store = ready(backend, cache).await;
        assert_eq!(store.get_state(&stale.id).await.unwrap(), Some(stale));
    }

    #[tokio::test]
    async fn test_latest_read_bypasses_cache() {
        let state = sample();
        let stored = state.clone();
        let mut backend = healthy_backend();
        backend
            .expect_fetch_state()
            .times(1)
            .returning(move |_| Ok(Some(stored.clone())));
        let mut cache = healthy_cache();
        cache.expect_get().times(0);
        cache.expect_set().times(1).returning(|_, _| Ok(()));

        let store = ready(backend, cache).await;
        assert_eq!(store.get_latest_state(&state.id).await.unwrap(), Some(state));
        assert_eq!(store.metrics().get_stats().durable_reads, 1);
    }

    #[tokio::test]
    async fn test_cache_errors_fall_through_to_durable_store() {
        let state = sample();
        let stored = state.clone();
        let mut backend = healthy_backend();
        backend
            .expect_fetch_state()
            .times(1)
            .returning(move |_| Ok(Some(stored.clone())));
        let mut cache = healthy_cache();
        cache
            .expect_get()
            .returning(|_| Err(CacheError::Unavailable("timeout".to_string())));
        cache
            .expect_set()
            .returning(|_, _| Err(CacheError::Unavailable("timeout".to_string())));

        let store = ready(backend, cache).await;
        assert_eq!(store.get_state(&state.id).await.unwrap(), Some(state));
        assert_eq!(store.metrics().get_stats().cache_errors, 2);
    }

    #[tokio::test]
    async fn test_unknown_state_is_none() {
        let mut backend = healthy_backend();
        backend.expect_fetch_state().returning(|_| Ok(None));
        let mut cache = healthy_cache();
        cache.expect_get().returning(|_| Ok(None));
        cache.expect_set().times(0);

        let store = ready(backend, cache).await;
        assert_eq!(store.get_state("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_tolerates_cache_write_failure() {
        let mut backend = healthy_backend();
        backend.expect_upsert_state().times(1).returning(|_| Ok(()));
        let mut cache = healthy_cache();
        cache
            .expect_set()
            .returning(|_, _| Err(CacheError::Closed));

        let store = ready(backend, cache).await;
        store.save_state(&sample()).await.unwrap();
        let metrics = store.metrics().get_stats();
        assert_eq!(metrics.durable_writes, 1);
        assert_eq!(metrics.cache_errors, 1);
    }

    #[tokio::test]
    async fn test_save_surfaces_durable_failure_without_caching() {
        let mut backend = healthy_backend();
        backend.expect_upsert_state().returning(|state| {
            Err(StoreError::VersionConflict {
                state_id: state.id.clone(),
                version: state.metadata.version,
            })
        });
        let mut cache = healthy_cache();
        cache.expect_set().times(0);
        cache.expect_delete().times(1).returning(|_| Ok(()));

        let store = ready(backend, cache).await;
        let err = store.save_state(&sample()).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { version: 1, .. }));
        assert_eq!(store.metrics().get_stats().durable_errors, 1);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_state_is_not_found() {
        let mut backend = healthy_backend();
        backend.expect_delete_state().returning(|_| Ok(0));
        let mut cache = healthy_cache();
        cache.expect_delete().times(0);

        let store = ready(backend, cache).await;
        let err = store.delete_state("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::StateNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_typed_error() {
        let mut backend = healthy_backend();
        backend.expect_fetch_checkpoint().returning(|_| Ok(None));
        let store = ready(backend, healthy_cache()).await;

        let err = store.get_checkpoint("cp-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_close_reports_both_tiers() {
        let mut backend = healthy_backend();
        backend
            .expect_close()
            .times(1)
            .returning(|| Err(StoreError::StateNotFound("pool".to_string())));
        let mut cache = healthy_cache();
        cache
            .expect_close()
            .times(1)
            .returning(|| Err(CacheError::Closed));

        let store = ready(backend, cache).await;
        match store.close().await {
            Err(StoreError::Close { durable, cache }) => {
                assert!(durable.is_some());
                assert_eq!(cache.as_deref(), Some("cache is closed"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // second close does not reach the backends again
        store.close().await.unwrap();
        assert!(matches!(
            store.get_state("x").await,
            Err(StoreError::NotInitialized)
        ));
    }
}
