use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{DurableBackend, StoreStats};
use super::error::StoreError;
use crate::config::DatabaseConfig;
use crate::state::{
    OperationKind, StateMetadata, StateOperation, WorkflowCheckpoint, WorkflowState, WorkflowStatus,
};

const STATE_COLUMNS: &str = "id, workflow_id, status, current_step, data, history, version, \
     created_at, updated_at, created_by, updated_by, checkpoint_id";

/// SQLite-backed durable tier
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    auto_migrate: bool,
}

impl SqliteBackend {
    /// Connect using the database settings. File databases are created along
    /// with their parent directory when missing.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds));

        if in_memory {
            // every connection to :memory: is a separate database
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            pool_options = pool_options.max_connections(config.max_connections.max(1));
        }

        info!(url = %config.url, "Connecting to workflow state database");
        let pool = pool_options.connect_with(options).await?;

        Ok(Self {
            pool,
            auto_migrate: config.auto_migrate,
        })
    }

    pub fn from_pool(pool: SqlitePool, auto_migrate: bool) -> Self {
        Self { pool, auto_migrate }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    // fixed width keeps lexicographic order equal to time order
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn state_from_row(row: &SqliteRow) -> Result<WorkflowState, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<WorkflowStatus>()
        .map_err(|e| StoreError::CorruptRecord {
            id: id.clone(),
            reason: e.to_string(),
        })?;
    let data: String = row.try_get("data")?;
    let history: String = row.try_get("history")?;
    let version: i64 = row.try_get("version")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkflowState {
        workflow_id: row.try_get("workflow_id")?,
        status,
        current_step: row.try_get("current_step")?,
        data: serde_json::from_str(&data)?,
        metadata: StateMetadata {
            created_at: parse_timestamp(&id, &created_at)?,
            updated_at: parse_timestamp(&id, &updated_at)?,
            version: u64::try_from(version).map_err(|_| StoreError::CorruptRecord {
                id: id.clone(),
                reason: format!("negative version {}", version),
            })?,
            created_by: row.try_get("created_by")?,
            updated_by: row.try_get("updated_by")?,
        },
        history: serde_json::from_str(&history)?,
        checkpoint_id: row.try_get("checkpoint_id")?,
        id,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<WorkflowCheckpoint, StoreError> {
    let id: String = row.try_get("id")?;
    let snapshot: String = row.try_get("snapshot")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(WorkflowCheckpoint {
        state_id: row.try_get("state_id")?,
        snapshot: serde_json::from_str(&snapshot)?,
        created_at: parse_timestamp(&id, &created_at)?,
        description: row.try_get("description")?,
        id,
    })
}

async fn upsert_state_row(
    conn: &mut SqliteConnection,
    state: &WorkflowState,
) -> Result<u64, StoreError> {
    let sql = format!(
        r#"
        INSERT INTO workflow_states ({STATE_COLUMNS})
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            workflow_id = excluded.workflow_id,
            status = excluded.status,
            current_step = excluded.current_step,
            data = excluded.data,
            history = excluded.history,
            version = excluded.version,
            updated_at = excluded.updated_at,
            updated_by = excluded.updated_by,
            checkpoint_id = excluded.checkpoint_id
        WHERE workflow_states.version < excluded.version
        "#
    );
    let result = bind_state(sqlx::query(&sql), state)?
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

async fn insert_state_row(
    conn: &mut SqliteConnection,
    state: &WorkflowState,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO workflow_states ({STATE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    );
    bind_state(sqlx::query(&sql), state)?
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn replace_state_row(
    conn: &mut SqliteConnection,
    state: &WorkflowState,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_states SET
            workflow_id = ?2, status = ?3, current_step = ?4, data = ?5, history = ?6,
            version = ?7, updated_at = ?8, updated_by = ?9, checkpoint_id = ?10
        WHERE id = ?1 AND version < ?7
        "#,
    )
    .bind(&state.id)
    .bind(&state.workflow_id)
    .bind(state.status.as_str())
    .bind(&state.current_step)
    .bind(serde_json::to_string(&state.data)?)
    .bind(serde_json::to_string(&state.history)?)
    .bind(state.metadata.version as i64)
    .bind(format_timestamp(&state.metadata.updated_at))
    .bind(&state.metadata.updated_by)
    .bind(&state.checkpoint_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Explain why a guarded update matched no row
async fn rejected_update(
    conn: &mut SqliteConnection,
    state: &WorkflowState,
) -> Result<StoreError, StoreError> {
    let exists = sqlx::query("SELECT 1 FROM workflow_states WHERE id = ?1")
        .bind(&state.id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    Ok(if exists {
        StoreError::VersionConflict {
            state_id: state.id.clone(),
            version: state.metadata.version,
        }
    } else {
        StoreError::StateNotFound(state.id.clone())
    })
}

fn bind_state<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    state: &'q WorkflowState,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, StoreError> {
    Ok(query
        .bind(&state.id)
        .bind(&state.workflow_id)
        .bind(state.status.as_str())
        .bind(&state.current_step)
        .bind(serde_json::to_string(&state.data)?)
        .bind(serde_json::to_string(&state.history)?)
        .bind(state.metadata.version as i64)
        .bind(format_timestamp(&state.metadata.created_at))
        .bind(format_timestamp(&state.metadata.updated_at))
        .bind(&state.metadata.created_by)
        .bind(&state.metadata.updated_by)
        .bind(&state.checkpoint_id))
}

async fn apply_operation(
    conn: &mut SqliteConnection,
    operation: &StateOperation,
) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidOperation {
        kind: operation.kind.as_str(),
        state_id: operation.state_id.clone(),
        reason: reason.to_string(),
    };

    match operation.kind {
        OperationKind::Create | OperationKind::Update => {
            let state = operation
                .state
                .as_ref()
                .ok_or_else(|| invalid("operation carries no state"))?;
            if state.id != operation.state_id {
                return Err(invalid("state id does not match operation"));
            }
            if operation.kind == OperationKind::Create {
                insert_state_row(conn, state).await
            } else if replace_state_row(conn, state).await? == 0 {
                Err(rejected_update(conn, state).await?)
            } else {
                Ok(())
            }
        }
        OperationKind::Delete => {
            let result = sqlx::query("DELETE FROM workflow_states WHERE id = ?1")
                .bind(&operation.state_id)
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() == 0 {
                Err(StoreError::StateNotFound(operation.state_id.clone()))
            } else {
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DurableBackend for SqliteBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        if !self.auto_migrate {
            info!("Automatic migrations disabled, expecting existing schema");
            return Ok(());
        }
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn upsert_state(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match upsert_state_row(&mut tx, state).await {
            Ok(0) => {
                tx.rollback().await?;
                Err(StoreError::VersionConflict {
                    state_id: state.id.clone(),
                    version: state.metadata.version,
                })
            }
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn fetch_state(&self, id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM workflow_states WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn fetch_states_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowState>, StoreError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM workflow_states \
             WHERE workflow_id = ?1 ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn delete_state(&self, id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_states WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn link_checkpoint(
        &self,
        state_id: &str,
        checkpoint_id: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE workflow_states SET checkpoint_id = ?2 WHERE id = ?1")
            .bind(state_id)
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (id, state_id, snapshot, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.state_id)
        .bind(serde_json::to_string(&checkpoint.snapshot)?)
        .bind(&checkpoint.description)
        .bind(format_timestamp(&checkpoint.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_checkpoint(&self, id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT id, state_id, snapshot, description, created_at \
             FROM workflow_checkpoints WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn fetch_checkpoints_for_state(
        &self,
        state_id: &str,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, state_id, snapshot, description, created_at
            FROM workflow_checkpoints
            WHERE state_id = ?1
            ORDER BY created_at DESC
            "#,
        )
        .bind(state_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn apply_operations(&self, operations: &[StateOperation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (index, operation) in operations.iter().enumerate() {
            if let Err(e) = apply_operation(&mut tx, operation).await {
                warn!(
                    index = index,
                    kind = operation.kind.as_str(),
                    state_id = %operation.state_id,
                    error = %e,
                    "Operation failed, rolling back batch"
                );
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "Rollback of failed batch reported an error");
                }
                return Err(e);
            }
        }
        tx.commit().await?;
        debug!(operations = operations.len(), "Applied operation batch");
        Ok(())
    }

    async fn compensate_operations(
        &self,
        operations: &[StateOperation],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for operation in operations {
            match (operation.kind, &operation.state) {
                (OperationKind::Create, Some(state)) => {
                    // only the exact row the operation wrote
                    let result = sqlx::query(
                        "DELETE FROM workflow_states \
                         WHERE id = ?1 AND version = ?2 AND created_at = ?3",
                    )
                    .bind(&operation.state_id)
                    .bind(state.metadata.version as i64)
                    .bind(format_timestamp(&state.metadata.created_at))
                    .execute(&mut *tx)
                    .await?;
                    removed += result.rows_affected();
                }
                _ => {
                    debug!(
                        kind = operation.kind.as_str(),
                        state_id = %operation.state_id,
                        "Operation has no compensating action"
                    );
                }
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(created_at) AS oldest, MAX(created_at) AS newest \
             FROM workflow_states",
        )
        .fetch_one(&self.pool)
        .await?;
        let total_states: i64 = totals.try_get("total")?;
        let oldest: Option<String> = totals.try_get("oldest")?;
        let newest: Option<String> = totals.try_get("newest")?;

        let total_checkpoints: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_checkpoints")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM workflow_states GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match status.parse::<WorkflowStatus>() {
                Ok(status) => {
                    by_status.insert(status, count as u64);
                }
                Err(e) => warn!(error = %e, "Skipping unknown status in stats"),
            }
        }

        Ok(StoreStats {
            total_states: total_states as u64,
            total_checkpoints: total_checkpoints as u64,
            by_status,
            oldest_state_at: oldest
                .as_deref()
                .map(|raw| parse_timestamp("stats", raw))
                .transpose()?,
            newest_state_at: newest
                .as_deref()
                .map(|raw| parse_timestamp("stats", raw))
                .transpose()?,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
        Ok(())
    }
}
