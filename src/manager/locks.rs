use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// Per-state mutual exclusion for read-modify-write paths.
///
/// Mutations of one id queue behind each other; different ids never share a
/// lock.
#[derive(Debug, Default)]
pub struct StateLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub type StateLockGuard = OwnedMutexGuard<()>;

impl StateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `state_id`. Held until the guard drops.
    pub async fn acquire(&self, state_id: &str) -> StateLockGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.len() >= PRUNE_THRESHOLD {
                // only the table itself holds idle locks
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(
                table
                    .entry(state_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(StateLocks::new());
        let guard = locks.acquire("s-1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("s-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = StateLocks::new();
        let _first = locks.acquire("s-1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("s-2")).await;
        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_idle_locks_are_pruned() {
        tokio_test::block_on(async {
            let locks = StateLocks::new();
            let held = locks.acquire("held").await;
            for n in 1..PRUNE_THRESHOLD {
                drop(locks.acquire(&format!("idle-{}", n)).await);
            }
            assert_eq!(locks.len(), PRUNE_THRESHOLD);

            let _fresh = locks.acquire("fresh").await;
            assert_eq!(locks.len(), 2);
            drop(held);
        });
    }
}
