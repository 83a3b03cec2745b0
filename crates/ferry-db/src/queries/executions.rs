//! Database query functions for the `task_executions` history table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionOutcome, TaskExecution};

/// History row written when an execution reaches a terminal state.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: ExecutionOutcome,
    pub rows_read: i64,
    pub rows_written: i64,
    pub rows_skipped: i64,
    pub orphan_bonifications: i64,
    pub error: Option<String>,
}

/// Insert a history row. Returns the stored row with its generated ID.
pub async fn insert_execution(pool: &PgPool, new: &NewExecution) -> Result<TaskExecution> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions (task_id, started_at, finished_at, outcome, rows_read, \
                                      rows_written, rows_skipped, orphan_bonifications, error) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.started_at)
    .bind(new.finished_at)
    .bind(new.outcome)
    .bind(new.rows_read)
    .bind(new.rows_written)
    .bind(new.rows_skipped)
    .bind(new.orphan_bonifications)
    .bind(&new.error)
    .fetch_one(pool)
    .await
    .context("failed to insert execution history row")?;

    Ok(execution)
}

/// List history for a task, newest first.
pub async fn list_executions(
    pool: &PgPool,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE task_id = $1 \
         ORDER BY started_at DESC LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(executions)
}

/// Most recent history row for a task, if any.
pub async fn latest_execution(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE task_id = $1 \
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest execution")?;

    Ok(execution)
}
