use async_trait::async_trait;
use moka::future::Cache;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::error::CacheError;
use crate::config::CacheConfig;
use crate::state::WorkflowState;

/// Key under which a state is cached
pub fn state_cache_key(state_id: &str) -> String {
    format!("workflow_state:{}", state_id)
}

/// Best-effort cache tier. Entries expire after the configured TTL.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn ping(&self) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<WorkflowState>, CacheError>;

    async fn set(&self, key: &str, state: &WorkflowState) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

/// In-process cache backed by moka
#[derive(Debug)]
pub struct MokaStateCache {
    cache: Cache<String, WorkflowState>,
    closed: AtomicBool,
}

impl MokaStateCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl())
            .build();

        Self {
            cache,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl StateCache for MokaStateCache {
    async fn ping(&self) -> Result<(), CacheError> {
        self.ensure_open()
    }

    async fn get(&self, key: &str) -> Result<Option<WorkflowState>, CacheError> {
        self.ensure_open()?;
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, key: &str, state: &WorkflowState) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.cache.insert(key.to_string(), state.clone()).await;
        debug!(key = key, version = state.metadata.version, "Cached workflow state");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Closed);
        }
        self.cache.invalidate_all();
        info!("State cache closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowStatus;
    use serde_json::json;
    use std::time::Duration;

    fn sample() -> WorkflowState {
        WorkflowState::new("wf-1", WorkflowStatus::Pending, "start", json!({"k": 1}), "tester")
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MokaStateCache::new(&CacheConfig::default());
        let state = sample();
        let key = state_cache_key(&state.id);

        assert_eq!(cache.get(&key).await.unwrap(), None);
        cache.set(&key, &state).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(state.clone()));
        cache.delete(&key).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = MokaStateCache::new(&CacheConfig {
            ttl_seconds: 1,
            max_capacity: 10,
        });
        let state = sample();
        let key = state_cache_key(&state.id);
        cache.set(&key, &state).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_calls() {
        let cache = MokaStateCache::new(&CacheConfig::default());
        cache.close().await.unwrap();
        assert_eq!(cache.ping().await, Err(CacheError::Closed));
        assert_eq!(cache.get("workflow_state:x").await, Err(CacheError::Closed));
        assert_eq!(cache.close().await, Err(CacheError::Closed));
    }
}
