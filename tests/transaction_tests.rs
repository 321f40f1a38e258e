//! Client-managed transactions: commit, explicit rollback, commit failure and
//! the timeout race.

use serde_json::json;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use workflow_state::{
    StateError, StateEvent, StateOperation, StoreError, TransactionOutcome, ValidationCode,
    WorkflowState, WorkflowStatus,
};

mod common;

const WAIT: Duration = Duration::from_secs(3);

fn sample(workflow_id: &str) -> WorkflowState {
    WorkflowState::new(workflow_id, WorkflowStatus::Pending, "queued", json!({}), "tx-test")
}

#[tokio::test]
async fn test_commit_applies_operations_and_emits_event() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let tx = manager.start_transaction(None).await.unwrap();
    let first = sample("wf-tx");
    let second = sample("wf-tx");
    manager
        .queue_operation(&tx, StateOperation::create(first.clone()))
        .await
        .unwrap();
    let queued = manager
        .queue_operation(&tx, StateOperation::create(second.clone()))
        .await
        .unwrap();
    assert_eq!(queued, 2);
    assert_eq!(manager.active_transactions().await.len(), 1);

    assert_eq!(manager.commit_transaction(&tx).await.unwrap(), 2);
    assert!(manager.active_transactions().await.is_empty());
    assert_eq!(
        manager.transaction_outcome(&tx),
        Some(TransactionOutcome::Committed)
    );

    match common::next_event(&mut events, "transaction:committed", WAIT).await {
        Some(StateEvent::TransactionCommitted {
            transaction_id,
            operations,
            ..
        }) => {
            assert_eq!(transaction_id, tx);
            assert_eq!(operations.len(), 2);
        }
        other => panic!("expected transaction:committed, got {other:?}"),
    }

    assert!(manager.get_state(&first.id).await.unwrap().is_some());
    assert!(manager.get_state(&second.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_timeout_rolls_back_and_commit_loses() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let started = Instant::now();
    let tx = manager
        .start_transaction(Some(Duration::from_millis(1000)))
        .await
        .unwrap();
    manager
        .queue_operation(&tx, StateOperation::create(sample("wf-timeout")))
        .await
        .unwrap();

    match common::next_event(&mut events, "transaction:rolledback", WAIT).await {
        Some(StateEvent::TransactionRolledBack {
            transaction_id,
            reason,
            ..
        }) => {
            assert_eq!(transaction_id, tx);
            assert_eq!(reason, "Transaction timeout");
        }
        other => panic!("expected transaction:rolledback, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(1000));

    let err = manager.commit_transaction(&tx).await.unwrap_err();
    assert!(matches!(
        err,
        StateError::TransactionResolved {
            outcome: TransactionOutcome::TimedOut,
            ..
        }
    ));
    assert!(manager
        .list_workflow_states("wf-timeout")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_commit_before_timeout_cancels_timer() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let tx = manager
        .start_transaction(Some(Duration::from_millis(300)))
        .await
        .unwrap();
    let state = sample("wf-race");
    manager
        .queue_operation(&tx, StateOperation::create(state.clone()))
        .await
        .unwrap();
    manager.commit_transaction(&tx).await.unwrap();

    // past the timeout nothing is rolled back
    assert!(
        common::next_event(&mut events, "transaction:rolledback", Duration::from_millis(600))
            .await
            .is_none()
    );
    assert!(manager.get_state(&state.id).await.unwrap().is_some());
    assert!(matches!(
        manager.rollback_transaction(&tx).await,
        Err(StateError::TransactionResolved {
            outcome: TransactionOutcome::Committed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_failed_commit_rolls_back_and_reports_cause() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let tx = manager.start_transaction(None).await.unwrap();
    let created = sample("wf-fail");
    manager
        .queue_operation(&tx, StateOperation::create(created.clone()))
        .await
        .unwrap();
    manager
        .queue_operation(&tx, StateOperation::delete("does-not-exist"))
        .await
        .unwrap();

    let err = manager.commit_transaction(&tx).await.unwrap_err();
    match &err {
        StateError::TransactionFailed { id, source } => {
            assert_eq!(id, &tx);
            assert!(source.is_not_found());
        }
        other => panic!("unexpected error: {other}"),
    }

    match common::next_event(&mut events, "transaction:rolledback", WAIT).await {
        Some(StateEvent::TransactionRolledBack { reason, .. }) => {
            assert!(reason.contains("does-not-exist"))
        }
        other => panic!("expected transaction:rolledback, got {other:?}"),
    }
    assert!(manager.get_state(&created.id).await.unwrap().is_none());
    assert_eq!(
        manager.transaction_outcome(&tx),
        Some(TransactionOutcome::RolledBack)
    );
}

#[tokio::test]
async fn test_explicit_rollback() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let tx = manager.start_transaction(None).await.unwrap();
    manager
        .queue_operation(&tx, StateOperation::create(sample("wf-rb")))
        .await
        .unwrap();
    manager.rollback_transaction(&tx).await.unwrap();

    match common::next_event(&mut events, "transaction:rolledback", WAIT).await {
        Some(StateEvent::TransactionRolledBack { reason, .. }) => {
            assert_eq!(reason, "Rolled back by caller")
        }
        other => panic!("expected transaction:rolledback, got {other:?}"),
    }
    assert!(matches!(
        manager.commit_transaction(&tx).await,
        Err(StateError::TransactionResolved { .. })
    ));
    assert!(matches!(
        manager
            .queue_operation(&tx, StateOperation::delete("x"))
            .await,
        Err(StateError::TransactionResolved { .. })
    ));
}

#[tokio::test]
async fn test_unknown_transaction() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    assert!(matches!(
        manager.commit_transaction("nope").await,
        Err(StateError::TransactionNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_state_rejected_at_queue_time() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let tx = manager.start_transaction(None).await.unwrap();

    let mut invalid = sample("wf-q");
    invalid.workflow_id = String::new();
    let err = manager
        .queue_operation(&tx, StateOperation::create(invalid))
        .await
        .unwrap_err();
    assert!(err
        .validation()
        .unwrap()
        .has_error(ValidationCode::MissingWorkflowId));
    assert_eq!(manager.active_transactions().await[0].operations, 0);
}

#[tokio::test]
async fn test_close_rolls_back_open_transactions() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();

    let tx = manager.start_transaction(None).await.unwrap();
    manager.close().await.unwrap();

    match common::next_event(&mut events, "transaction:rolledback", WAIT).await {
        Some(StateEvent::TransactionRolledBack {
            transaction_id,
            reason,
            ..
        }) => {
            assert_eq!(transaction_id, tx);
            assert_eq!(reason, "Manager closed");
        }
        other => panic!("expected transaction:rolledback, got {other:?}"),
    }
    assert_eq!(
        manager.transaction_outcome(&tx),
        Some(TransactionOutcome::RolledBack)
    );
}

async fn committed(manager: &workflow_state::WorkflowStateManager, state: &WorkflowState) {
    let tx = manager.start_transaction(None).await.unwrap();
    manager
        .queue_operation(&tx, StateOperation::create(state.clone()))
        .await
        .unwrap();
    manager.commit_transaction(&tx).await.unwrap();
}

#[tokio::test]
async fn test_timeout_leaves_previously_committed_record() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let mut events = manager.subscribe();
    let state = sample("wf-retry");
    committed(&manager, &state).await;

    // the same create sent again, then abandoned
    let retry = manager
        .start_transaction(Some(Duration::from_millis(200)))
        .await
        .unwrap();
    manager
        .queue_operation(&retry, StateOperation::create(state.clone()))
        .await
        .unwrap();

    match common::next_event(&mut events, "transaction:rolledback", WAIT).await {
        Some(StateEvent::TransactionRolledBack { transaction_id, .. }) => {
            assert_eq!(transaction_id, retry)
        }
        other => panic!("expected transaction:rolledback, got {other:?}"),
    }
    assert_eq!(manager.get_state(&state.id).await.unwrap(), Some(state));
}

#[tokio::test]
async fn test_caller_rollback_leaves_previously_committed_record() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let state = sample("wf-retry");
    committed(&manager, &state).await;

    let retry = manager.start_transaction(None).await.unwrap();
    manager
        .queue_operation(&retry, StateOperation::create(state.clone()))
        .await
        .unwrap();
    manager.rollback_transaction(&retry).await.unwrap();

    assert_eq!(manager.get_state(&state.id).await.unwrap(), Some(state));
}

#[tokio::test]
async fn test_failed_duplicate_commit_leaves_existing_record() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let state = sample("wf-retry");
    committed(&manager, &state).await;

    let retry = manager.start_transaction(None).await.unwrap();
    manager
        .queue_operation(&retry, StateOperation::create(state.clone()))
        .await
        .unwrap();
    let err = manager.commit_transaction(&retry).await.unwrap_err();
    assert!(matches!(err, StateError::TransactionFailed { .. }));

    assert_eq!(manager.get_state(&state.id).await.unwrap(), Some(state));
}

#[tokio::test]
async fn test_stale_update_operation_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = common::manager(&dir).await;
    let original = manager
        .create_state("wf-upd", WorkflowStatus::Running, "s0", json!({}), "alice")
        .await
        .unwrap();
    for n in 1..=3 {
        manager
            .update_state(
                &original.id,
                workflow_state::StateUpdate::new().step(format!("s{}", n)),
                "bob",
                None,
            )
            .await
            .unwrap();
    }

    let tx = manager.start_transaction(None).await.unwrap();
    manager
        .queue_operation(&tx, StateOperation::update(original.clone()))
        .await
        .unwrap();
    let err = manager.commit_transaction(&tx).await.unwrap_err();
    match err {
        StateError::TransactionFailed { source, .. } => {
            assert!(matches!(source, StoreError::VersionConflict { version: 1, .. }))
        }
        other => panic!("unexpected error: {other}"),
    }

    let stored = manager.get_state(&original.id).await.unwrap().unwrap();
    assert_eq!(stored.version(), 4);
    assert_eq!(stored.current_step, "s3");
}
