//! `TaskStore` implementation over pooled PostgreSQL connections.

use crate::config::PgConfig;
use crate::schema;
use ::async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tether_core::{
    Context, ContextId, EntityKind, Message, StorageError, Task, TaskFeedback, TaskId, TaskState,
    TetherError, TetherResult,
};
use tether_storage::{TaskStore, TaskUpdate};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;

// ============================================================================
// ERROR & ROW CONVERSION
// ============================================================================

fn pool_err(e: deadpool_postgres::PoolError) -> StorageError {
    StorageError::Unavailable {
        reason: format!("connection pool: {}", e),
    }
}

/// Map a database error, retrying only what a fresh attempt can fix.
///
/// Connection-class failures (and errors with no SQLSTATE at all, i.e. I/O
/// or protocol breakdowns) are `Unavailable` and go through the retry loop.
/// Everything the server rejected deterministically is `Internal`.
fn db_err(e: tokio_postgres::Error) -> StorageError {
    let reason = format!("database: {}", e);
    let transient = e.is_closed()
        || match e.code() {
            None => true,
            Some(code) => sqlstate_is_transient(code.code()),
        };
    if transient {
        StorageError::Unavailable { reason }
    } else {
        StorageError::Internal { reason }
    }
}

/// Connection exceptions (class 08), resource exhaustion (53), operator
/// intervention incl. statement timeouts (57), and serialization/deadlock
/// failures, all of which can succeed on a fresh connection.
fn sqlstate_is_transient(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57")
        || code == "40001"
        || code == "40P01"
}

/// Decode a JSONB column into a typed value.
fn json_decode<T: serde::de::DeserializeOwned>(
    kind: EntityKind,
    value: Value,
) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Decode {
        kind,
        reason: e.to_string(),
    })
}

fn json_encode<T: serde::Serialize>(kind: EntityKind, value: &T) -> Result<Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Decode {
        kind,
        reason: e.to_string(),
    })
}

fn task_from_row(row: &Row) -> Result<Task, StorageError> {
    let state_str: String = row.get("state");
    let state = TaskState::from_db_str(&state_str).ok_or_else(|| StorageError::Decode {
        kind: EntityKind::Task,
        reason: format!("unknown task state '{}'", state_str),
    })?;

    Ok(Task {
        task_id: row.get("task_id"),
        context_id: row.get("context_id"),
        state,
        state_timestamp: row.get("state_timestamp"),
        history: json_decode(EntityKind::Task, row.get("history"))?,
        artifacts: json_decode(EntityKind::Task, row.get("artifacts"))?,
        metadata: json_decode(EntityKind::Task, row.get("metadata"))?,
        reference_task_ids: json_decode(EntityKind::Task, row.get("reference_task_ids"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn context_from_row(row: &Row) -> Result<Context, StorageError> {
    Ok(Context {
        context_id: row.get("context_id"),
        context_data: json_decode(EntityKind::Context, row.get("context_data"))?,
        message_history: json_decode(EntityKind::Context, row.get("message_history"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn feedback_from_row(row: &Row) -> Result<TaskFeedback, StorageError> {
    Ok(TaskFeedback {
        feedback_id: row.get("feedback_id"),
        task_id: row.get("task_id"),
        feedback_data: row.get("feedback_data"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// RETRY WRAPPER
// ============================================================================

/// Run an operation under the command timeout, retrying transient failures
/// with a fixed delay up to `retry_max` additional attempts. The operation
/// expression is re-evaluated per attempt, so each retry acquires a fresh
/// pooled connection and transaction.
macro_rules! with_retries {
    ($self:expr, $op:literal, $call:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout($self.config.command_timeout, $call).await {
                Ok(result) => result,
                Err(_) => Err(TetherError::Storage(StorageError::Unavailable {
                    reason: format!(
                        "{} timed out after {:?}",
                        $op, $self.config.command_timeout
                    ),
                })),
            };
            match result {
                Err(err) if err.is_retryable() && attempt < $self.config.retry_max => {
                    attempt += 1;
                    tracing::warn!(
                        op = $op,
                        attempt,
                        error = %err,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep($self.config.retry_delay).await;
                }
                other => break other,
            }
        }
    }};
}

// ============================================================================
// STORE
// ============================================================================

/// Durable backend over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    config: PgConfig,
}

impl PgStore {
    /// Build the pool and, when configured, apply the schema bootstrap.
    pub async fn connect(config: PgConfig) -> TetherResult<Self> {
        let pool = config.create_pool()?;
        if config.auto_migrate {
            schema::migrate(&pool).await?;
        }
        tracing::debug!(host = %config.host, dbname = %config.dbname, "connected to PostgreSQL");
        Ok(Self { pool, config })
    }

    /// Current pool size, for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> TetherResult<Object> {
        Ok(self.pool.get().await.map_err(pool_err)?)
    }

    // ========================================================================
    // SINGLE-ATTEMPT OPERATIONS
    // ========================================================================

    async fn load_task_once(
        &self,
        task_id: TaskId,
        history_length: Option<usize>,
    ) -> TetherResult<Option<Task>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt("SELECT * FROM tether_task WHERE task_id = $1", &[&task_id])
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let mut task = task_from_row(&row)?;
                if let Some(n) = history_length {
                    task.truncate_history(n);
                }
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn submit_task_once(
        &self,
        context_id: ContextId,
        message: &Message,
    ) -> TetherResult<Task> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        let now = Utc::now();

        // Lock (or create) the context row first; submit and clear_context
        // take locks in the same order, so the cascade cannot interleave
        // with an in-flight submission.
        let ctx_row = tx
            .query_opt(
                "SELECT * FROM tether_context WHERE context_id = $1 FOR UPDATE",
                &[&context_id],
            )
            .await
            .map_err(db_err)?;

        match ctx_row {
            Some(row) => {
                let mut context = context_from_row(&row)?;
                context.message_history.push(message.clone());
                tx.execute(
                    "UPDATE tether_context SET message_history = $2, updated_at = $3 \
                     WHERE context_id = $1",
                    &[
                        &context_id,
                        &json_encode(EntityKind::Context, &context.message_history)?,
                        &now,
                    ],
                )
                .await
                .map_err(db_err)?;
            }
            None => {
                let mut context = Context::new(context_id);
                context.message_history.push(message.clone());
                tx.execute(
                    "INSERT INTO tether_context \
                     (context_id, context_data, message_history, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        &context_id,
                        &json_encode(EntityKind::Context, &context.context_data)?,
                        &json_encode(EntityKind::Context, &context.message_history)?,
                        &context.created_at,
                        &context.updated_at,
                    ],
                )
                .await
                .map_err(db_err)?;
            }
        }

        let task = match message.task_id {
            // Continuation: append to the existing task under its row lock.
            Some(task_id) => {
                let row = tx
                    .query_opt(
                        "SELECT * FROM tether_task WHERE task_id = $1 FOR UPDATE",
                        &[&task_id],
                    )
                    .await
                    .map_err(db_err)?
                    .ok_or(StorageError::NotFound {
                        kind: EntityKind::Task,
                        id: task_id,
                    })?;
                let mut task = task_from_row(&row)?;
                TaskUpdate::default()
                    .with_message(message.clone())
                    .apply_to(&mut task)?;
                write_task_mutation(&tx, &task).await?;
                task
            }
            // Fresh task in `Submitted` state.
            None => {
                let task = Task::new(context_id, message.clone());
                tx.execute(
                    "INSERT INTO tether_task \
                     (task_id, context_id, state, state_timestamp, history, artifacts, \
                      metadata, reference_task_ids, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                    &[
                        &task.task_id,
                        &task.context_id,
                        &task.state.as_db_str(),
                        &task.state_timestamp,
                        &json_encode(EntityKind::Task, &task.history)?,
                        &json_encode(EntityKind::Task, &task.artifacts)?,
                        &json_encode(EntityKind::Task, &task.metadata)?,
                        &json_encode(EntityKind::Task, &task.reference_task_ids)?,
                        &task.created_at,
                        &task.updated_at,
                    ],
                )
                .await
                .map_err(db_err)?;
                task
            }
        };

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(task_id = %task.task_id, context_id = %context_id, "task submitted");
        Ok(task)
    }

    async fn update_task_once(&self, task_id: TaskId, update: &TaskUpdate) -> TetherResult<Task> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        // Row lock serializes concurrent appends and makes the terminal
        // check race-free.
        let row = tx
            .query_opt(
                "SELECT * FROM tether_task WHERE task_id = $1 FOR UPDATE",
                &[&task_id],
            )
            .await
            .map_err(db_err)?
            .ok_or(StorageError::NotFound {
                kind: EntityKind::Task,
                id: task_id,
            })?;

        let mut task = task_from_row(&row)?;
        update.clone().apply_to(&mut task)?;
        write_task_mutation(&tx, &task).await?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(task_id = %task_id, state = task.state.as_db_str(), "task updated");
        Ok(task)
    }

    async fn list_tasks_once(
        &self,
        context_id: Option<ContextId>,
        length: Option<usize>,
    ) -> TetherResult<Vec<Task>> {
        let conn = self.get_conn().await?;
        let limit = length.map(|n| n as i64);
        let rows = match context_id {
            Some(context_id) => {
                conn.query(
                    "SELECT * FROM tether_task WHERE context_id = $1 \
                     ORDER BY created_at DESC, task_id DESC LIMIT $2",
                    &[&context_id, &limit],
                )
                .await
            }
            None => {
                conn.query(
                    "SELECT * FROM tether_task \
                     ORDER BY created_at DESC, task_id DESC LIMIT $1",
                    &[&limit],
                )
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter()
            .map(|row| Ok(task_from_row(row)?))
            .collect::<TetherResult<Vec<_>>>()
    }

    async fn load_context_once(&self, context_id: ContextId) -> TetherResult<Option<Context>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM tether_context WHERE context_id = $1",
                &[&context_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| context_from_row(&row)).transpose()?)
    }

    async fn update_context_once(&self, context: &Context) -> TetherResult<Context> {
        let conn = self.get_conn().await?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO tether_context \
             (context_id, context_data, message_history, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (context_id) DO UPDATE SET \
                 context_data = EXCLUDED.context_data, \
                 message_history = EXCLUDED.message_history, \
                 updated_at = EXCLUDED.updated_at",
            &[
                &context.context_id,
                &json_encode(EntityKind::Context, &context.context_data)?,
                &json_encode(EntityKind::Context, &context.message_history)?,
                &context.created_at,
                &now,
            ],
        )
        .await
        .map_err(db_err)?;

        let mut stored = context.clone();
        stored.updated_at = now;
        Ok(stored)
    }

    async fn list_contexts_once(&self, length: Option<usize>) -> TetherResult<Vec<Context>> {
        let conn = self.get_conn().await?;
        let limit = length.map(|n| n as i64);
        let rows = conn
            .query(
                "SELECT * FROM tether_context \
                 ORDER BY created_at DESC, context_id DESC LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| Ok(context_from_row(row)?))
            .collect::<TetherResult<Vec<_>>>()
    }

    async fn clear_context_once(&self, context_id: ContextId) -> TetherResult<()> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "DELETE FROM tether_context WHERE context_id = $1",
            &[&context_id],
        )
        .await
        .map_err(db_err)?;
        // Feedback rows cascade with their tasks.
        let removed = tx
            .execute(
                "DELETE FROM tether_task WHERE context_id = $1",
                &[&context_id],
            )
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(context_id = %context_id, tasks = removed, "context cleared");
        Ok(())
    }

    async fn clear_all_once(&self) -> TetherResult<()> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        tx.execute("DELETE FROM tether_task", &[])
            .await
            .map_err(db_err)?;
        tx.execute("DELETE FROM tether_context", &[])
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn store_task_feedback_once(
        &self,
        task_id: TaskId,
        feedback_data: &Value,
    ) -> TetherResult<TaskFeedback> {
        let conn = self.get_conn().await?;
        let record = TaskFeedback::new(task_id, feedback_data.clone());
        conn.execute(
            "INSERT INTO tether_task_feedback \
             (feedback_id, task_id, feedback_data, created_at) \
             VALUES ($1, $2, $3, $4)",
            &[
                &record.feedback_id,
                &record.task_id,
                &record.feedback_data,
                &record.created_at,
            ],
        )
        .await
        .map_err(|e| {
            // The cascade FK doubles as the existence check.
            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                StorageError::NotFound {
                    kind: EntityKind::Task,
                    id: task_id,
                }
            } else {
                db_err(e)
            }
        })?;
        Ok(record)
    }

    async fn get_task_feedback_once(&self, task_id: TaskId) -> TetherResult<Vec<TaskFeedback>> {
        let conn = self.get_conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM tether_task_feedback WHERE task_id = $1 \
                 ORDER BY created_at ASC, feedback_id ASC",
                &[&task_id],
            )
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| Ok(feedback_from_row(row)?))
            .collect::<TetherResult<Vec<_>>>()
    }
}

/// Persist an already-applied task mutation under the caller's transaction.
async fn write_task_mutation(
    tx: &tokio_postgres::Transaction<'_>,
    task: &Task,
) -> TetherResult<()> {
    tx.execute(
        "UPDATE tether_task SET \
             state = $2, state_timestamp = $3, history = $4, artifacts = $5, \
             metadata = $6, updated_at = $7 \
         WHERE task_id = $1",
        &[
            &task.task_id,
            &task.state.as_db_str(),
            &task.state_timestamp,
            &json_encode(EntityKind::Task, &task.history)?,
            &json_encode(EntityKind::Task, &task.artifacts)?,
            &json_encode(EntityKind::Task, &task.metadata)?,
            &task.updated_at,
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl TaskStore for PgStore {
    async fn load_task(
        &self,
        task_id: TaskId,
        history_length: Option<usize>,
    ) -> TetherResult<Option<Task>> {
        with_retries!(self, "load_task", self.load_task_once(task_id, history_length))
    }

    async fn submit_task(&self, context_id: ContextId, message: Message) -> TetherResult<Task> {
        message.validate()?;
        with_retries!(self, "submit_task", self.submit_task_once(context_id, &message))
    }

    async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> TetherResult<Task> {
        // Reject malformed payloads before touching the database.
        for message in &update.new_messages {
            message.validate()?;
        }
        for artifact in &update.new_artifacts {
            artifact.validate()?;
        }
        with_retries!(self, "update_task", self.update_task_once(task_id, &update))
    }

    async fn list_tasks(&self, length: Option<usize>) -> TetherResult<Vec<Task>> {
        with_retries!(self, "list_tasks", self.list_tasks_once(None, length))
    }

    async fn list_tasks_by_context(
        &self,
        context_id: ContextId,
        length: Option<usize>,
    ) -> TetherResult<Vec<Task>> {
        with_retries!(
            self,
            "list_tasks_by_context",
            self.list_tasks_once(Some(context_id), length)
        )
    }

    async fn load_context(&self, context_id: ContextId) -> TetherResult<Option<Context>> {
        with_retries!(self, "load_context", self.load_context_once(context_id))
    }

    async fn update_context(&self, context: Context) -> TetherResult<Context> {
        with_retries!(self, "update_context", self.update_context_once(&context))
    }

    async fn list_contexts(&self, length: Option<usize>) -> TetherResult<Vec<Context>> {
        with_retries!(self, "list_contexts", self.list_contexts_once(length))
    }

    async fn clear_context(&self, context_id: ContextId) -> TetherResult<()> {
        with_retries!(self, "clear_context", self.clear_context_once(context_id))
    }

    async fn clear_all(&self) -> TetherResult<()> {
        with_retries!(self, "clear_all", self.clear_all_once())
    }

    async fn store_task_feedback(
        &self,
        task_id: TaskId,
        feedback_data: Value,
    ) -> TetherResult<TaskFeedback> {
        TaskFeedback::validate_data(&feedback_data)?;
        with_retries!(
            self,
            "store_task_feedback",
            self.store_task_feedback_once(task_id, &feedback_data)
        )
    }

    async fn get_task_feedback(&self, task_id: TaskId) -> TetherResult<Vec<TaskFeedback>> {
        with_retries!(
            self,
            "get_task_feedback",
            self.get_task_feedback_once(task_id)
        )
    }

    async fn health_check(&self) -> TetherResult<bool> {
        let result: TetherResult<bool> = with_retries!(self, "health_check", async {
            let conn = self.get_conn().await?;
            conn.query_one("SELECT 1", &[]).await.map_err(db_err)?;
            Ok(true)
        });
        result
    }
}

// ============================================================================
// TESTS (no database required; DB-backed tests live in tests/pg_store.rs)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::Part;

    #[test]
    fn test_json_decode_history_round_trip() {
        let history = vec![Message::user_text("hi"), Message::agent_text("hello")];
        let value = json_encode(EntityKind::Task, &history).unwrap();

        let decoded: Vec<Message> = json_decode(EntityKind::Task, value).unwrap();
        assert_eq!(decoded, history);
        assert!(matches!(&decoded[0].parts[0], Part::Text { text } if text == "hi"));
    }

    #[test]
    fn test_json_decode_rejects_malformed_column() {
        let err = json_decode::<Vec<Message>>(EntityKind::Task, json!({"not": "a list"}))
            .unwrap_err();
        assert!(matches!(err, StorageError::Decode { .. }));
    }

    #[test]
    fn test_unknown_state_string_is_decode_error() {
        assert!(TaskState::from_db_str("paused").is_none());
    }

    #[test]
    fn test_transient_sqlstate_classification() {
        assert!(sqlstate_is_transient("08006")); // connection_failure
        assert!(sqlstate_is_transient("53300")); // too_many_connections
        assert!(sqlstate_is_transient("57014")); // query_canceled
        assert!(sqlstate_is_transient("40001")); // serialization_failure
        assert!(sqlstate_is_transient("40P01")); // deadlock_detected

        assert!(!sqlstate_is_transient("23503")); // foreign_key_violation
        assert!(!sqlstate_is_transient("23505")); // unique_violation
        assert!(!sqlstate_is_transient("42601")); // syntax_error
        assert!(!sqlstate_is_transient("22P02")); // invalid_text_representation
    }

    #[test]
    fn test_only_unavailable_is_retried() {
        let transient: TetherError = StorageError::Unavailable {
            reason: "connection reset".to_string(),
        }
        .into();
        assert!(transient.is_retryable());

        let permanent: TetherError = StorageError::Internal {
            reason: "syntax error".to_string(),
        }
        .into();
        assert!(!permanent.is_retryable());
    }
}
