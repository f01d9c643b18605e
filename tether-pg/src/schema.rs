//! Embedded schema bootstrap.
//!
//! Applied at startup when `PgConfig::auto_migrate` is set. Every statement
//! is idempotent (`IF NOT EXISTS`), so re-running against an existing
//! database is safe. External migration tooling remains free to own the
//! schema instead; this bootstrap is a deployment convenience, not part of
//! the runtime contract.

use deadpool_postgres::Pool;
use tether_core::{StorageError, TetherResult};

/// Schema for the three record collections.
///
/// ```sql
/// tether_task (
///     task_id            UUID PRIMARY KEY,
///     context_id         UUID NOT NULL,
///     state              TEXT NOT NULL,
///     state_timestamp    TIMESTAMPTZ NOT NULL,
///     history            JSONB NOT NULL,      -- ordered Message sequence
///     artifacts          JSONB NOT NULL,      -- ordered Artifact sequence
///     metadata           JSONB NOT NULL,
///     reference_task_ids JSONB NOT NULL,
///     created_at         TIMESTAMPTZ NOT NULL,
///     updated_at         TIMESTAMPTZ NOT NULL
/// )
/// tether_context (
///     context_id      UUID PRIMARY KEY,
///     context_data    JSONB NOT NULL,
///     message_history JSONB NOT NULL,
///     created_at      TIMESTAMPTZ NOT NULL,
///     updated_at      TIMESTAMPTZ NOT NULL
/// )
/// tether_task_feedback (
///     feedback_id   UUID PRIMARY KEY,
///     task_id       UUID NOT NULL REFERENCES tether_task ON DELETE CASCADE,
///     feedback_data JSONB NOT NULL,
///     created_at    TIMESTAMPTZ NOT NULL
/// )
/// ```
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tether_task (
    task_id            UUID PRIMARY KEY,
    context_id         UUID NOT NULL,
    state              TEXT NOT NULL,
    state_timestamp    TIMESTAMPTZ NOT NULL,
    history            JSONB NOT NULL DEFAULT '[]'::jsonb,
    artifacts          JSONB NOT NULL DEFAULT '[]'::jsonb,
    metadata           JSONB NOT NULL DEFAULT '{}'::jsonb,
    reference_task_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at         TIMESTAMPTZ NOT NULL,
    updated_at         TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS tether_context (
    context_id      UUID PRIMARY KEY,
    context_data    JSONB NOT NULL DEFAULT '{}'::jsonb,
    message_history JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS tether_task_feedback (
    feedback_id   UUID PRIMARY KEY,
    task_id       UUID NOT NULL REFERENCES tether_task (task_id) ON DELETE CASCADE,
    feedback_data JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_context_id ON tether_task (context_id);
CREATE INDEX IF NOT EXISTS idx_task_state ON tether_task (state);
CREATE INDEX IF NOT EXISTS idx_task_created_at ON tether_task (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_task_updated_at ON tether_task (updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_task_metadata ON tether_task USING GIN (metadata jsonb_path_ops);
CREATE INDEX IF NOT EXISTS idx_context_created_at ON tether_context (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_feedback_task_id ON tether_task_feedback (task_id);
"#;

/// Apply the schema bootstrap.
pub async fn migrate(pool: &Pool) -> TetherResult<()> {
    let conn = pool
        .get()
        .await
        .map_err(|e| StorageError::Unavailable {
            reason: format!("pool error during migration: {}", e),
        })?;

    conn.batch_execute(SCHEMA_SQL)
        .await
        .map_err(|e| StorageError::Unavailable {
            reason: format!("schema bootstrap failed: {}", e),
        })?;

    tracing::info!("schema bootstrap applied");
    Ok(())
}
