//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{
    BonificationConfig, Direction, FieldMapping, LastExecutionResult, PostUpdateMapping, RunState,
    Task, TaskKind, TaskParameter, TransferMode, ValidationRules,
};

/// Definition fields of a task, as written by upsert.
///
/// Run-status columns (status, progress, execution_count, last execution
/// fields) are owned by the executor and never touched here.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub kind: TaskKind,
    pub direction: Direction,
    pub mode: TransferMode,
    pub active: bool,
    pub query: String,
    pub parameters: Vec<TaskParameter>,
    pub clear_before_insert: bool,
    pub field_mapping: Option<FieldMapping>,
    pub target_table: Option<String>,
    pub validation_rules: Option<ValidationRules>,
    pub post_update_query: Option<String>,
    pub post_update_mapping: Option<PostUpdateMapping>,
    pub linked_group: Option<String>,
    pub linked_execution_order: i32,
    pub linked_tasks: Vec<Uuid>,
    pub is_coordinator: bool,
    pub next_tasks: Vec<Uuid>,
    pub bonification: Option<BonificationConfig>,
}

/// Insert or update a task definition, keyed by its unique name.
pub async fn upsert_task(pool: &PgPool, def: &TaskDefinition) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, kind, direction, mode, active, query, parameters, \
                            clear_before_insert, field_mapping, target_table, validation_rules, \
                            post_update_query, post_update_mapping, linked_group, \
                            linked_execution_order, linked_tasks, is_coordinator, next_tasks, \
                            bonification) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
         ON CONFLICT (name) DO UPDATE SET \
             kind = EXCLUDED.kind, \
             direction = EXCLUDED.direction, \
             mode = EXCLUDED.mode, \
             active = EXCLUDED.active, \
             query = EXCLUDED.query, \
             parameters = EXCLUDED.parameters, \
             clear_before_insert = EXCLUDED.clear_before_insert, \
             field_mapping = EXCLUDED.field_mapping, \
             target_table = EXCLUDED.target_table, \
             validation_rules = EXCLUDED.validation_rules, \
             post_update_query = EXCLUDED.post_update_query, \
             post_update_mapping = EXCLUDED.post_update_mapping, \
             linked_group = EXCLUDED.linked_group, \
             linked_execution_order = EXCLUDED.linked_execution_order, \
             linked_tasks = EXCLUDED.linked_tasks, \
             is_coordinator = EXCLUDED.is_coordinator, \
             next_tasks = EXCLUDED.next_tasks, \
             bonification = EXCLUDED.bonification, \
             updated_at = now() \
         RETURNING *",
    )
    .bind(&def.name)
    .bind(def.kind)
    .bind(def.direction)
    .bind(def.mode)
    .bind(def.active)
    .bind(&def.query)
    .bind(Json(&def.parameters))
    .bind(def.clear_before_insert)
    .bind(def.field_mapping.as_ref().map(Json))
    .bind(&def.target_table)
    .bind(def.validation_rules.as_ref().map(Json))
    .bind(&def.post_update_query)
    .bind(def.post_update_mapping.as_ref().map(Json))
    .bind(&def.linked_group)
    .bind(def.linked_execution_order)
    .bind(Json(&def.linked_tasks))
    .bind(def.is_coordinator)
    .bind(Json(&def.next_tasks))
    .bind(def.bonification.as_ref().map(Json))
    .fetch_one(pool)
    .await
    .context("failed to upsert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single task by its unique name.
pub async fn get_task_by_name(pool: &PgPool, name: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by name")?;

    Ok(task)
}

/// List all tasks, ordered by name.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List active tasks eligible for the scheduler (kind auto or both).
pub async fn list_schedulable_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE active AND kind IN ('auto', 'both') \
         ORDER BY COALESCE(NULLIF(linked_group, ''), name), linked_execution_order, name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list schedulable tasks")?;

    Ok(tasks)
}

/// List active members of a linked group, in execution order (ties broken
/// by name).
pub async fn list_group_members(pool: &PgPool, group: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE active AND linked_group = $1 \
         ORDER BY linked_execution_order ASC, name ASC",
    )
    .bind(group)
    .fetch_all(pool)
    .await
    .context("failed to list group members")?;

    Ok(tasks)
}

/// Delete a task. Returns the number of rows removed (0 when absent).
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}

/// Update the persisted run state and progress of a task.
pub async fn set_run_state(
    pool: &PgPool,
    id: Uuid,
    status: RunState,
    progress: i32,
) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET status = $1, progress = $2 WHERE id = $3")
        .bind(status)
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task run state")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Update only the progress column (emitted alongside progress events).
pub async fn set_progress(pool: &PgPool, id: Uuid, progress: i32) -> Result<()> {
    sqlx::query("UPDATE tasks SET progress = $1 WHERE id = $2")
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task progress")?;

    Ok(())
}

/// Record a terminal outcome on the task row.
///
/// `count_execution` controls whether `execution_count` advances;
/// cancelled runs do not count.
pub async fn finish_task(
    pool: &PgPool,
    id: Uuid,
    status: RunState,
    progress: i32,
    finished_at: DateTime<Utc>,
    result: &LastExecutionResult,
    count_execution: bool,
) -> Result<()> {
    let increment: i64 = if count_execution { 1 } else { 0 };
    let updated = sqlx::query(
        "UPDATE tasks SET status = $1, progress = $2, last_execution_date = $3, \
                          last_execution_result = $4, execution_count = execution_count + $5 \
         WHERE id = $6",
    )
    .bind(status)
    .bind(progress)
    .bind(finished_at)
    .bind(Json(result))
    .bind(increment)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record task outcome")?;

    if updated.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Reset tasks left in a non-terminal state by a dead process.
///
/// Returns the affected tasks so the caller can log them.
pub async fn reset_stale_running(pool: &PgPool, reason: &str) -> Result<Vec<Task>> {
    let result = LastExecutionResult {
        success: false,
        message: reason.to_owned(),
        error: Some(reason.to_owned()),
        rows_affected: None,
        record_count: None,
    };

    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'failed', progress = -1, last_execution_result = $1 \
         WHERE status IN ('running', 'cancelling') \
         RETURNING *",
    )
    .bind(Json(&result))
    .fetch_all(pool)
    .await
    .context("failed to reset stale running tasks")?;

    Ok(tasks)
}
