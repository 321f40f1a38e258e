use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::{Result, StateError, TransactionOutcome};
use crate::state::StateOperation;

/// Resolved transactions remembered for "already resolved" answers
pub const RESOLVED_MEMORY: usize = 1024;

/// An open transaction: queued operations plus the timer racing its commit.
#[derive(Debug)]
pub struct PendingTransaction {
    pub operations: Vec<StateOperation>,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    resolved: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

/// Public view of an open transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    pub operations: usize,
    pub started_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// Bookkeeping for client-managed transactions.
///
/// Exactly one caller can resolve a transaction: `claim` flips the
/// transaction's resolved flag with a compare-exchange and only the winner
/// gets the queued operations back.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    pending: Mutex<HashMap<String, PendingTransaction>>,
    resolved: StdMutex<VecDeque<(String, TransactionOutcome)>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, id: &str, timeout: Duration) {
        let transaction = PendingTransaction {
            operations: Vec::new(),
            started_at: Utc::now(),
            timeout,
            resolved: Arc::new(AtomicBool::new(false)),
            timer: None,
        };
        self.pending.lock().await.insert(id.to_string(), transaction);
        debug!(transaction_id = id, timeout_ms = timeout.as_millis() as u64, "Transaction started");
    }

    /// Attach the timeout task. If the timer already resolved the
    /// transaction the handle is dropped and the task runs to completion.
    pub async fn attach_timer(&self, id: &str, timer: JoinHandle<()>) {
        if let Some(transaction) = self.pending.lock().await.get_mut(id) {
            transaction.timer = Some(timer);
        }
    }

    pub async fn queue(&self, id: &str, operation: StateOperation) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(id) {
            Some(transaction) if !transaction.resolved.load(Ordering::Acquire) => {
                transaction.operations.push(operation);
                Ok(transaction.operations.len())
            }
            _ => Err(self.missing(id)),
        }
    }

    /// Take ownership of a transaction for resolution. Fails for unknown or
    /// already resolved ids.
    pub async fn claim(&self, id: &str, outcome: TransactionOutcome) -> Result<PendingTransaction> {
        let mut pending = self.pending.lock().await;
        let won = pending.get(id).is_some_and(|transaction| {
            transaction
                .resolved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        if !won {
            return Err(self.missing(id));
        }

        let Some(mut transaction) = pending.remove(id) else {
            return Err(self.missing(id));
        };
        drop(pending);

        if outcome != TransactionOutcome::TimedOut {
            if let Some(timer) = transaction.timer.take() {
                timer.abort();
            }
        }
        self.record(id, outcome);
        Ok(transaction)
    }

    /// Remember (or correct) how a transaction ended
    pub fn record(&self, id: &str, outcome: TransactionOutcome) {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = resolved.iter_mut().find(|(known, _)| known == id) {
            entry.1 = outcome;
            return;
        }
        if resolved.len() >= RESOLVED_MEMORY {
            resolved.pop_front();
        }
        resolved.push_back((id.to_string(), outcome));
    }

    pub fn outcome(&self, id: &str) -> Option<TransactionOutcome> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, outcome)| *outcome)
    }

    fn missing(&self, id: &str) -> StateError {
        match self.outcome(id) {
            Some(outcome) => StateError::TransactionResolved {
                id: id.to_string(),
                outcome,
            },
            None => StateError::TransactionNotFound(id.to_string()),
        }
    }

    pub async fn active(&self) -> Vec<TransactionInfo> {
        let pending = self.pending.lock().await;
        let mut active: Vec<TransactionInfo> = pending
            .iter()
            .map(|(id, transaction)| TransactionInfo {
                id: id.clone(),
                operations: transaction.operations.len(),
                started_at: transaction.started_at,
                timeout_ms: transaction.timeout.as_millis() as u64,
            })
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateOperation;

    #[tokio::test]
    async fn test_only_one_claim_wins() {
        let registry = TransactionRegistry::new();
        registry.begin("tx-1", Duration::from_secs(30)).await;
        registry
            .queue("tx-1", StateOperation::delete("s-1"))
            .await
            .unwrap();

        let won = registry
            .claim("tx-1", TransactionOutcome::TimedOut)
            .await
            .unwrap();
        assert_eq!(won.operations.len(), 1);

        let lost = registry
            .claim("tx-1", TransactionOutcome::Committed)
            .await
            .unwrap_err();
        assert!(matches!(
            lost,
            StateError::TransactionResolved {
                outcome: TransactionOutcome::TimedOut,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_queue_on_unknown_transaction() {
        let registry = TransactionRegistry::new();
        let err = registry
            .queue("nope", StateOperation::delete("s-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn test_claim_aborts_timer() {
        let registry = TransactionRegistry::new();
        registry.begin("tx-1", Duration::from_secs(30)).await;
        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let abort = timer.abort_handle();
        registry.attach_timer("tx-1", timer).await;

        registry
            .claim("tx-1", TransactionOutcome::Committed)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(abort.is_finished());
        assert!(registry.active().await.is_empty());
    }

    #[test]
    fn test_resolved_memory_is_bounded() {
        let registry = TransactionRegistry::new();
        for n in 0..(RESOLVED_MEMORY + 10) {
            registry.record(&format!("tx-{}", n), TransactionOutcome::Committed);
        }
        assert_eq!(registry.outcome("tx-0"), None);
        assert_eq!(
            registry.outcome(&format!("tx-{}", RESOLVED_MEMORY + 9)),
            Some(TransactionOutcome::Committed)
        );

        registry.record("tx-1030", TransactionOutcome::RolledBack);
        assert_eq!(
            registry.outcome("tx-1030"),
            Some(TransactionOutcome::RolledBack)
        );
    }
}
