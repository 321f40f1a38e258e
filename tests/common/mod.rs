//! Shared fixtures for the integration tests: file-backed SQLite stores in a
//! temporary directory and hand-written cache doubles.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use workflow_state::config::{CacheConfig, DatabaseConfig, ManagerConfig};
use workflow_state::{
    CacheError, MokaStateCache, SqliteBackend, StateCache, StateEvent, StateStore,
    StateValidator, WorkflowState, WorkflowStateManager,
};

/// Cache whose every data call fails, counting the failures
#[derive(Debug, Default)]
pub struct FailingCache {
    pub failures: AtomicUsize,
}

impl FailingCache {
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn fail(&self) -> CacheError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        CacheError::Unavailable("connection reset".to_string())
    }
}

#[async_trait]
impl StateCache for FailingCache {
    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<WorkflowState>, CacheError> {
        Err(self.fail())
    }

    async fn set(&self, _key: &str, _state: &WorkflowState) -> Result<(), CacheError> {
        Err(self.fail())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(self.fail())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

pub fn database_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}/state.db", dir.path().display()),
        ..DatabaseConfig::default()
    }
}

pub async fn sqlite_store(dir: &TempDir, cache: Arc<dyn StateCache>) -> StateStore {
    let backend = SqliteBackend::connect(&database_config(dir))
        .await
        .expect("connect sqlite");
    let store = StateStore::new(Arc::new(backend), cache);
    store.initialize().await.expect("initialize store");
    store
}

pub async fn moka_store(dir: &TempDir) -> StateStore {
    sqlite_store(dir, Arc::new(MokaStateCache::new(&CacheConfig::default()))).await
}

pub async fn manager_with(dir: &TempDir, config: ManagerConfig) -> WorkflowStateManager {
    WorkflowStateManager::new(moka_store(dir).await, StateValidator::default(), config)
}

pub async fn manager(dir: &TempDir) -> WorkflowStateManager {
    manager_with(dir, ManagerConfig::default()).await
}

/// Wait for the first event with the given wire name
pub async fn next_event(
    events: &mut broadcast::Receiver<StateEvent>,
    name: &str,
    within: Duration,
) -> Option<StateEvent> {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if event.name() == name => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
