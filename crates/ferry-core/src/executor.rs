//! Single-task execution pipeline.
//!
//! Phases run strictly in order, each publishing a progress event and
//! checking the cancellation token at its boundary. Streaming mode reads
//! the source in batches, pushing each through transform/validate/write
//! before the next is fetched.

use std::collections::HashSet;

use chrono::Utc;
use futures::TryStreamExt;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use ferry_db::models::{
    Direction, ExecutionOutcome, LastExecutionResult, RunState, Task, TaskParameter, TransferMode,
};
use ferry_db::queries::executions::{self, NewExecution};
use ferry_db::queries::tasks as task_db;
use ferry_db::server::ServerKey;
use ferry_db::value::{decode_row, SqlRow, SqlValue};

use crate::bonification::{BonificationOutcome, BonificationProcessor};
use crate::context::AppContext;
use crate::error::EngineError;
use crate::mapping;
use crate::progress::TaskEvent;
use crate::query::{self, BuiltQuery};
use crate::retry::run_with_retry;
use crate::validate;

/// Upper bound on bind parameters per INSERT statement.
const MAX_BINDS_PER_INSERT: usize = 1000;

/// Pipeline phases with their published progress percents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Acquire,
    ConnectSource,
    CompileQuery,
    Read,
    Transform,
    Validate,
    Clear,
    Write,
    PostUpdate,
    Chain,
    Done,
}

impl Phase {
    pub fn percent(self) -> i32 {
        match self {
            Self::Acquire => 5,
            Self::ConnectSource => 10,
            Self::CompileQuery => 20,
            Self::Read => 40,
            Self::Transform => 50,
            Self::Validate => 60,
            Self::Clear => 65,
            Self::Write => 90,
            Self::PostUpdate => 95,
            Self::Chain => 99,
            Self::Done => 100,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::ConnectSource => "connect-source",
            Self::CompileQuery => "compile-query",
            Self::Read => "read",
            Self::Transform => "transform",
            Self::Validate => "validate",
            Self::Clear => "clear",
            Self::Write => "write",
            Self::PostUpdate => "post-update",
            Self::Chain => "chain",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How the executor is being driven.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Counts against the scheduler single-flight rule.
    pub is_auto: bool,
    /// Group members defer post-update to the coordinator.
    pub run_post_update: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            is_auto: false,
            run_post_update: true,
        }
    }
}

/// Result of one finished execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub task_id: Uuid,
    pub outcome: ExecutionOutcome,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub already_present: u64,
    pub orphan_bonifications: u64,
    /// Identifiers of rows written, for group post-update.
    pub processed_keys: Vec<SqlValue>,
    /// Tasks to chain after success (resolved by the caller).
    pub next_tasks: Vec<Uuid>,
    pub message: String,
    pub error: Option<String>,
}

/// Server the extraction query runs against.
pub fn read_server(direction: Direction) -> ServerKey {
    match direction {
        Direction::Up => ServerKey::Target,
        Direction::Down | Direction::Internal | Direction::General => ServerKey::Source,
    }
}

/// Server receiving the insert, when the task has a destination.
pub fn write_server(direction: Direction) -> ServerKey {
    match direction {
        Direction::Down => ServerKey::Target,
        Direction::Up | Direction::Internal | Direction::General => ServerKey::Source,
    }
}

/// Execute one task end to end.
///
/// Registers the run, drives the pipeline under the task's wall-clock
/// timeout, then persists status, history and terminal events whatever
/// the outcome.
pub async fn execute_task<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    override_params: Option<Vec<TaskParameter>>,
    opts: &'a ExecOptions,
) -> Result<ExecutionReport, EngineError> {
    if !task.active {
        return Err(EngineError::InvalidConfig(format!(
            "task {:?} is inactive",
            task.name
        )));
    }

    let cancel = ctx.registry.register(task.id, opts.is_auto)?;
    let started_at = Utc::now();

    tracing::info!(
        task_id = %task.id,
        task_name = %task.name,
        direction = %task.direction,
        mode = %task.mode,
        "starting transfer task"
    );

    ctx.registry.set_state(task.id, RunState::Running);
    if let Err(e) = task_db::set_run_state(&ctx.store, task.id, RunState::Running, 0).await {
        tracing::warn!(task_id = %task.id, error = %e, "failed to persist running state");
    }
    ctx.bus.publish(TaskEvent::Status {
        task_id: task.id,
        state: RunState::Running,
        connection_lost: false,
        error_code: None,
    });

    let timeout = match task.mode {
        TransferMode::Normal => Some(ctx.settings.task_timeout),
        TransferMode::Streaming => ctx.settings.streaming_timeout,
    };

    let pipeline = run_pipeline(ctx, task, override_params, &cancel, opts);
    let result = match timeout {
        Some(limit) => {
            tokio::select! {
                result = pipeline => result,
                _ = tokio::time::sleep(limit) => {
                    tracing::warn!(task_id = %task.id, timeout_secs = limit.as_secs(), "task timed out");
                    cancel.cancel();
                    Err(EngineError::Cancelled)
                }
            }
        }
        None => pipeline.await,
    };

    finalize(ctx, task, started_at, result).await
}

/// Record the terminal outcome: task status columns, history row,
/// terminal event, registry entry and topic teardown.
async fn finalize<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    started_at: chrono::DateTime<Utc>,
    result: Result<PipelineOutput, EngineError>,
) -> Result<ExecutionReport, EngineError> {
    let finished_at = Utc::now();

    let (report, state, count_execution) = match result {
        Ok(output) => {
            let message = format!(
                "transferred {} of {} rows ({} skipped, {} already present)",
                output.rows_written, output.rows_read, output.rows_skipped, output.already_present
            );
            let report = ExecutionReport {
                task_id: task.id,
                outcome: ExecutionOutcome::Success,
                rows_read: output.rows_read,
                rows_written: output.rows_written,
                rows_skipped: output.rows_skipped,
                already_present: output.already_present,
                orphan_bonifications: output.bonification.orphan_count(),
                processed_keys: output.processed_keys,
                // Chaining applies to down transfers only.
                next_tasks: if task.direction == Direction::Down {
                    task.next_tasks.0.clone()
                } else {
                    Vec::new()
                },
                message,
                error: None,
            };
            (report, RunState::Completed, true)
        }
        Err(EngineError::Cancelled) => {
            let report = ExecutionReport {
                task_id: task.id,
                outcome: ExecutionOutcome::Cancelled,
                rows_read: 0,
                rows_written: 0,
                rows_skipped: 0,
                already_present: 0,
                orphan_bonifications: 0,
                processed_keys: Vec::new(),
                next_tasks: Vec::new(),
                message: "execution cancelled".to_owned(),
                error: None,
            };
            (report, RunState::Cancelled, false)
        }
        Err(err) => {
            let report = ExecutionReport {
                task_id: task.id,
                outcome: ExecutionOutcome::Failure,
                rows_read: 0,
                rows_written: 0,
                rows_skipped: 0,
                already_present: 0,
                orphan_bonifications: 0,
                processed_keys: Vec::new(),
                next_tasks: Vec::new(),
                message: "execution failed".to_owned(),
                error: Some(err.to_string()),
            };
            (report, RunState::Failed, true)
        }
    };

    let progress = if state == RunState::Completed { 100 } else { -1 };
    ctx.registry.set_progress(task.id, progress);

    let last_result = LastExecutionResult {
        success: state == RunState::Completed,
        message: report.message.clone(),
        error: report.error.clone(),
        rows_affected: Some(report.rows_written as i64),
        record_count: Some(report.rows_read as i64),
    };
    if let Err(e) = task_db::finish_task(
        &ctx.store,
        task.id,
        state,
        progress,
        finished_at,
        &last_result,
        count_execution,
    )
    .await
    {
        tracing::warn!(task_id = %task.id, error = %e, "failed to persist task outcome");
    }

    let history = NewExecution {
        task_id: task.id,
        started_at,
        finished_at: Some(finished_at),
        outcome: report.outcome,
        rows_read: report.rows_read as i64,
        rows_written: report.rows_written as i64,
        rows_skipped: report.rows_skipped as i64,
        orphan_bonifications: report.orphan_bonifications as i64,
        error: report.error.clone(),
    };
    if let Err(e) = executions::insert_execution(&ctx.store, &history).await {
        tracing::warn!(task_id = %task.id, error = %e, "failed to persist history row");
    }

    let error_code = report.error.as_ref().map(|_| "QUERY_EXECUTION_FAILED");
    ctx.bus.publish(TaskEvent::Status {
        task_id: task.id,
        state,
        connection_lost: false,
        error_code: error_code.map(str::to_owned),
    });

    ctx.registry.complete(task.id);
    ctx.bus.close(task.id);

    tracing::info!(
        task_id = %task.id,
        task_name = %task.name,
        outcome = %report.outcome,
        rows_read = report.rows_read,
        rows_written = report.rows_written,
        "transfer task finished"
    );

    Ok(report)
}

/// Accumulated pipeline counters plus the open write transaction state.
struct PipelineOutput {
    rows_read: u64,
    rows_written: u64,
    rows_skipped: u64,
    already_present: u64,
    bonification: BonificationOutcome,
    processed_keys: Vec<SqlValue>,
}

fn ensure_live(cancel: &tokio_util::sync::CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn publish_phase(ctx: &AppContext, task_id: Uuid, phase: Phase, rows: Option<u64>) {
    ctx.registry.set_progress(task_id, phase.percent());
    ctx.bus.publish(TaskEvent::Progress {
        task_id,
        percent: phase.percent(),
        phase: phase.name().to_owned(),
        rows_processed: rows,
    });
}

/// Best-effort persistence of the progress column.
async fn persist_progress(ctx: &AppContext, task_id: Uuid, percent: i32) {
    if let Err(e) = task_db::set_progress(&ctx.store, task_id, percent).await {
        tracing::debug!(task_id = %task_id, error = %e, "failed to persist progress");
    }
}

/// The column whose values identify processed rows.
///
/// Precedence: post-update mapping key, then the validation existence
/// key, then (for down transfers) the first mapped target field.
fn processed_key_field(task: &Task) -> Option<String> {
    if let Some(mapping) = &task.post_update_mapping {
        return Some(mapping.table_key.clone());
    }
    if let Some(rules) = &task.validation_rules {
        if let Some(check) = &rules.existence_check {
            if !check.key.is_empty() {
                return Some(check.key.clone());
            }
        }
    }
    if task.direction == Direction::Down {
        if let Some(mapping) = &task.field_mapping {
            return mapping.target_fields.first().cloned();
        }
    }
    None
}

async fn run_pipeline<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    override_params: Option<Vec<TaskParameter>>,
    cancel: &'a tokio_util::sync::CancellationToken,
    opts: &'a ExecOptions,
) -> Result<PipelineOutput, EngineError> {
    let read_key = read_server(task.direction);
    let write_key = write_server(task.direction);
    let destination = task.destination_table().map(str::to_owned);

    // acquire
    ensure_live(cancel)?;
    publish_phase(ctx, task.id, Phase::Acquire, None);
    persist_progress(ctx, task.id, Phase::Acquire.percent()).await;

    // connect-source: verify the read server answers before compiling.
    ensure_live(cancel)?;
    run_with_retry(&ctx.settings.retry, cancel, |_, _| {}, async |_| {
        ctx.servers
            .ping(read_key)
            .await
            .map_err(|e| EngineError::ConnectionLost {
                server: read_key,
                message: e.to_string(),
            })
    })
    .await?;
    publish_phase(ctx, task.id, Phase::ConnectSource, None);

    // compile-query
    ensure_live(cancel)?;
    let params = override_params.unwrap_or_else(|| task.parameters.0.clone());
    let built = query::build_select(&task.query, &params)?;
    publish_phase(ctx, task.id, Phase::CompileQuery, None);
    tracing::debug!(task_id = %task.id, sql = %built.sql, "compiled extraction query");

    // Destination column metadata, fetched once for mapping coercion.
    let column_meta = match &destination {
        Some(table) => Some(
            ctx.servers
                .column_types(write_key, table)
                .await
                .map_err(EngineError::Internal)?,
        ),
        None => None,
    };

    let mut bonifier = task
        .bonification
        .as_ref()
        .map(|cfg| BonificationProcessor::new(cfg.0.clone()));
    let key_field = processed_key_field(task);

    match task.mode {
        TransferMode::Normal => {
            run_materialized(
                ctx, task, &built, cancel, opts, read_key, write_key,
                destination.as_deref(), column_meta.as_deref(), &mut bonifier, key_field.as_deref(),
            )
            .await
        }
        TransferMode::Streaming => {
            run_streaming(
                ctx, task, &built, cancel, opts, read_key, write_key,
                destination.as_deref(), column_meta.as_deref(), &mut bonifier, key_field.as_deref(),
            )
            .await
        }
    }
}

/// Shared per-batch processing: bonification, mapping, coercion,
/// validation, key collection.
async fn process_batch<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    write_key: ServerKey,
    column_meta: Option<&'a std::collections::HashMap<String, ferry_db::server::ColumnMeta>>,
    bonifier: &'a mut Option<BonificationProcessor>,
    key_field: Option<&'a str>,
    rows: Vec<SqlRow>,
    output: &'a mut PipelineOutput,
) -> Result<Vec<SqlRow>, EngineError> {
    // Bonification first: it operates on source-shaped rows.
    let rows = match bonifier {
        Some(processor) => {
            let (rows, outcome) = processor.process(rows);
            if ctx.settings.strict_bonification && outcome.orphan_count() > 0 {
                return Err(EngineError::ValidationFailed(format!(
                    "{} unresolved bonification references",
                    outcome.orphan_count()
                )));
            }
            for orphan in &outcome.orphans {
                tracing::warn!(
                    task_id = %task.id,
                    order = %orphan.order,
                    code = %orphan.referenced_code,
                    "bonification reference not found"
                );
            }
            output.bonification.orders_processed += outcome.orders_processed;
            output.bonification.regular_lines += outcome.regular_lines;
            output.bonification.bonus_lines += outcome.bonus_lines;
            output.bonification.orphans.extend(outcome.orphans);
            rows
        }
        None => rows,
    };

    // Field mapping applies to down transfers only.
    let rows: Vec<SqlRow> = match (&task.field_mapping, task.direction) {
        (Some(mapping), Direction::Down) => {
            rows.iter().map(|r| mapping::map_row(mapping, r)).collect()
        }
        _ => rows,
    };

    // Metadata-driven coercion; rows with fatal notes are skipped.
    let rows: Vec<SqlRow> = match column_meta {
        Some(meta) => {
            let mut coerced_rows = Vec::with_capacity(rows.len());
            for row in &rows {
                let (coerced, notes) = mapping::coerce_row(row, meta);
                let fatal = notes.iter().find(|n| n.kind.is_fatal());
                match fatal {
                    Some(note) => {
                        tracing::warn!(
                            task_id = %task.id,
                            column = %note.column,
                            detail = %note.detail,
                            "dropping row with uncoercible value"
                        );
                        output.rows_skipped += 1;
                    }
                    None => {
                        for note in &notes {
                            tracing::debug!(
                                task_id = %task.id,
                                column = %note.column,
                                detail = %note.detail,
                                "value coerced"
                            );
                        }
                        coerced_rows.push(coerced);
                    }
                }
            }
            coerced_rows
        }
        None => rows,
    };

    // Validation: required fields plus existence probe on the destination.
    let mut rules = task
        .validation_rules
        .as_ref()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    // Down transfers probe mapped rows, so the existence key must be a
    // target column; fall back to the first mapped field otherwise.
    if let (Some(mapping), Direction::Down) = (&task.field_mapping, task.direction) {
        if let Some(check) = rules.existence_check.as_mut() {
            if !mapping.target_fields.contains(&check.key) {
                if let Some(first) = mapping.target_fields.first() {
                    tracing::debug!(
                        task_id = %task.id,
                        key = %check.key,
                        fallback = %first,
                        "existence key is not a target field, using first target field"
                    );
                    check.key = first.clone();
                }
            }
        }
    }
    let outcome = validate::validate_rows(&ctx.servers, write_key, &rules, rows).await?;
    output.rows_skipped += outcome.dropped_missing;
    output.already_present += outcome.already_present;

    if let Some(field) = key_field {
        for row in &outcome.to_insert {
            if let Some(value) = row.get(field) {
                if !value.is_null() {
                    output.processed_keys.push(value.clone());
                }
            }
        }
    }

    Ok(outcome.to_insert)
}

#[allow(clippy::too_many_arguments)]
async fn run_materialized<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    built: &'a BuiltQuery,
    cancel: &'a tokio_util::sync::CancellationToken,
    opts: &'a ExecOptions,
    read_key: ServerKey,
    write_key: ServerKey,
    destination: Option<&'a str>,
    column_meta: Option<&'a std::collections::HashMap<String, ferry_db::server::ColumnMeta>>,
    bonifier: &'a mut Option<BonificationProcessor>,
    key_field: Option<&'a str>,
) -> Result<PipelineOutput, EngineError> {
    let mut output = PipelineOutput {
        rows_read: 0,
        rows_written: 0,
        rows_skipped: 0,
        already_present: 0,
        bonification: BonificationOutcome::default(),
        processed_keys: Vec::new(),
    };

    // read: full materialization, retried with a fresh connection.
    ensure_live(cancel)?;
    let on_lost = |_attempt: u32, _err: &EngineError| {
        ctx.bus.publish(TaskEvent::Status {
            task_id: task.id,
            state: RunState::Running,
            connection_lost: true,
            error_code: None,
        });
    };
    let rows: Vec<SqlRow> = run_with_retry(&ctx.settings.retry, cancel, on_lost, async |_| {
        let mut conn = ctx
            .servers
            .acquire(read_key)
            .await
            .map_err(|e| EngineError::from_sqlx(read_key, e))?;
        let mut query = sqlx::query(&built.sql);
        for value in &built.binds {
            query = value.bind_to(query);
        }
        let pg_rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| EngineError::from_sqlx(read_key, e))?;
        pg_rows
            .iter()
            .map(decode_row)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EngineError::Internal)
    })
    .await?;
    output.rows_read = rows.len() as u64;
    publish_phase(ctx, task.id, Phase::Read, Some(output.rows_read));
    persist_progress(ctx, task.id, Phase::Read.percent()).await;

    // transform
    ensure_live(cancel)?;
    publish_phase(ctx, task.id, Phase::Transform, None);

    // validate (process_batch also runs the transform steps)
    let to_insert = process_batch(
        ctx, task, write_key, column_meta, bonifier, key_field, rows, &mut output,
    )
    .await?;
    ensure_live(cancel)?;
    publish_phase(ctx, task.id, Phase::Validate, None);

    let Some(destination) = destination else {
        // Extraction-only task: nothing to clear or write.
        finish_write_free(ctx, task, cancel, opts, read_key, &output).await?;
        return Ok(output);
    };

    // clear + write inside one transaction, retried as a unit while the
    // transaction is still our own (rollback on transient failure is a
    // drop of the handle).
    ensure_live(cancel)?;
    let written = run_with_retry(&ctx.settings.retry, cancel, on_lost, async |_| {
        let mut tx = ctx
            .servers
            .begin(write_key)
            .await
            .map_err(|e| EngineError::from_sqlx(write_key, e))?;

        if task.clear_before_insert {
            clear_table(&mut tx, write_key, destination).await?;
        }
        let written = insert_rows(&mut tx, write_key, destination, &to_insert, ctx.settings.batch_size).await?;
        Ok((tx, written))
    })
    .await;

    let (mut tx, written) = written?;
    if task.clear_before_insert {
        publish_phase(ctx, task.id, Phase::Clear, None);
    }
    output.rows_written = written;
    publish_phase(ctx, task.id, Phase::Write, Some(written));
    persist_progress(ctx, task.id, Phase::Write.percent()).await;

    // Cancellation observed before commit leaves the target untouched.
    if cancel.is_cancelled() {
        tx.rollback()
            .await
            .map_err(|e| EngineError::from_sqlx(write_key, e))?;
        return Err(EngineError::Cancelled);
    }

    // post-update (group members defer this to their coordinator).
    if opts.run_post_update {
        if let Some(statement) = task.post_update_query.as_deref().filter(|s| !s.is_empty()) {
            match run_post_update(ctx, read_key, statement, &output.processed_keys, cancel).await {
                Ok(_) => publish_phase(ctx, task.id, Phase::PostUpdate, None),
                Err(e) => {
                    tx.rollback()
                        .await
                        .map_err(|re| EngineError::from_sqlx(write_key, re))?;
                    return Err(e);
                }
            }
        }
    }

    // chain: next tasks are resolved by the caller after success.
    publish_phase(ctx, task.id, Phase::Chain, None);

    tx.commit()
        .await
        .map_err(|e| EngineError::from_sqlx(write_key, e))?;
    publish_phase(ctx, task.id, Phase::Done, Some(output.rows_written));
    persist_progress(ctx, task.id, Phase::Done.percent()).await;

    Ok(output)
}

/// Tail of the pipeline for tasks with no destination table.
async fn finish_write_free<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    cancel: &'a tokio_util::sync::CancellationToken,
    opts: &'a ExecOptions,
    read_key: ServerKey,
    output: &'a PipelineOutput,
) -> Result<(), EngineError> {
    ensure_live(cancel)?;
    if opts.run_post_update {
        if let Some(statement) = task.post_update_query.as_deref().filter(|s| !s.is_empty()) {
            run_post_update(ctx, read_key, statement, &output.processed_keys, cancel).await?;
            publish_phase(ctx, task.id, Phase::PostUpdate, None);
        }
    }
    publish_phase(ctx, task.id, Phase::Chain, None);
    publish_phase(ctx, task.id, Phase::Done, Some(output.rows_read));
    persist_progress(ctx, task.id, Phase::Done.percent()).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_streaming<'a>(
    ctx: &'a AppContext,
    task: &'a Task,
    built: &'a BuiltQuery,
    cancel: &'a tokio_util::sync::CancellationToken,
    opts: &'a ExecOptions,
    read_key: ServerKey,
    write_key: ServerKey,
    destination: Option<&'a str>,
    column_meta: Option<&'a std::collections::HashMap<String, ferry_db::server::ColumnMeta>>,
    bonifier: &'a mut Option<BonificationProcessor>,
    key_field: Option<&'a str>,
) -> Result<PipelineOutput, EngineError> {
    let mut output = PipelineOutput {
        rows_read: 0,
        rows_written: 0,
        rows_skipped: 0,
        already_present: 0,
        bonification: BonificationOutcome::default(),
        processed_keys: Vec::new(),
    };

    let batch_size = ctx.settings.batch_size.max(1);

    ensure_live(cancel)?;
    let mut src_conn = ctx
        .servers
        .acquire(read_key)
        .await
        .map_err(|e| EngineError::from_sqlx(read_key, e))?;

    let mut tx: Option<Transaction<'static, Postgres>> = match destination {
        Some(table) => {
            let mut tx = ctx
                .servers
                .begin(write_key)
                .await
                .map_err(|e| EngineError::from_sqlx(write_key, e))?;
            if task.clear_before_insert {
                clear_table(&mut tx, write_key, table).await?;
                publish_phase(ctx, task.id, Phase::Clear, None);
            }
            Some(tx)
        }
        None => None,
    };

    let mut query = sqlx::query(&built.sql);
    for value in &built.binds {
        query = value.bind_to(query);
    }

    let mut stream = query.fetch(&mut *src_conn);
    let mut batch: Vec<SqlRow> = Vec::with_capacity(batch_size);
    let mut batch_index: u64 = 0;
    let mut finished = false;

    while !finished || !batch.is_empty() {
        // Batch boundary: cancellation observed here rolls everything back.
        if cancel.is_cancelled() {
            if let Some(tx) = tx.take() {
                tx.rollback()
                    .await
                    .map_err(|e| EngineError::from_sqlx(write_key, e))?;
            }
            return Err(EngineError::Cancelled);
        }

        if !finished {
            let next = stream
                .try_next()
                .await
                .map_err(|e| EngineError::from_sqlx(read_key, e))?;

            match next {
                Some(pg_row) => {
                    batch.push(decode_row(&pg_row).map_err(EngineError::Internal)?);
                    output.rows_read += 1;
                    if batch.len() < batch_size {
                        continue;
                    }
                }
                None => {
                    finished = true;
                    if batch.is_empty() {
                        break;
                    }
                }
            }
        }

        let rows = std::mem::take(&mut batch);
        let to_insert = process_batch(
            ctx, task, write_key, column_meta, bonifier, key_field, rows, &mut output,
        )
        .await?;

        if let (Some(tx), Some(table)) = (tx.as_mut(), destination) {
            let written =
                insert_rows(tx, write_key, table, &to_insert, ctx.settings.batch_size).await?;
            output.rows_written += written;
        }

        batch_index += 1;
        // Estimated percent between the write-phase bounds (65..90).
        let percent = 65 + (batch_index.min(24) as i32);
        ctx.registry.set_progress(task.id, percent);
        ctx.bus.publish(TaskEvent::Progress {
            task_id: task.id,
            percent,
            phase: Phase::Write.name().to_owned(),
            rows_processed: Some(output.rows_read),
        });
        persist_progress(ctx, task.id, percent).await;
    }

    drop(stream);
    drop(src_conn);

    publish_phase(ctx, task.id, Phase::Write, Some(output.rows_written));

    let Some(mut tx) = tx else {
        finish_write_free(ctx, task, cancel, opts, read_key, &output).await?;
        return Ok(output);
    };

    if cancel.is_cancelled() {
        tx.rollback()
            .await
            .map_err(|e| EngineError::from_sqlx(write_key, e))?;
        return Err(EngineError::Cancelled);
    }

    if opts.run_post_update {
        if let Some(statement) = task.post_update_query.as_deref().filter(|s| !s.is_empty()) {
            match run_post_update(ctx, read_key, statement, &output.processed_keys, cancel).await {
                Ok(_) => publish_phase(ctx, task.id, Phase::PostUpdate, None),
                Err(e) => {
                    tx.rollback()
                        .await
                        .map_err(|re| EngineError::from_sqlx(write_key, re))?;
                    return Err(e);
                }
            }
        }
    }

    publish_phase(ctx, task.id, Phase::Chain, None);

    tx.commit()
        .await
        .map_err(|e| EngineError::from_sqlx(write_key, e))?;
    publish_phase(ctx, task.id, Phase::Done, Some(output.rows_written));
    persist_progress(ctx, task.id, Phase::Done.percent()).await;

    Ok(output)
}

/// DELETE the destination table inside the write transaction.
async fn clear_table(
    tx: &mut Transaction<'static, Postgres>,
    server: ServerKey,
    table: &str,
) -> Result<(), EngineError> {
    if !query::is_safe_identifier(table) {
        return Err(EngineError::InvalidConfig(format!(
            "destination table {table:?} is not a valid identifier"
        )));
    }
    let sql = format!("DELETE FROM {table}");
    sqlx::query(&sql)
        .execute(&mut **tx)
        .await
        .map_err(|e| EngineError::from_sqlx(server, e))?;
    Ok(())
}

/// Multi-row INSERT in bind-bounded chunks.
async fn insert_rows(
    tx: &mut Transaction<'static, Postgres>,
    server: ServerKey,
    table: &str,
    rows: &[SqlRow],
    batch_size: usize,
) -> Result<u64, EngineError> {
    if rows.is_empty() {
        return Ok(0);
    }
    if !query::is_safe_identifier(table) {
        return Err(EngineError::InvalidConfig(format!(
            "destination table {table:?} is not a valid identifier"
        )));
    }

    // All rows in a transfer share the shape of the first.
    let columns: Vec<String> = rows[0].columns().to_vec();
    for column in &columns {
        if !query::is_safe_identifier(column) {
            return Err(EngineError::InvalidConfig(format!(
                "destination column {column:?} is not a valid identifier"
            )));
        }
    }

    let rows_per_stmt = (MAX_BINDS_PER_INSERT / columns.len().max(1))
        .clamp(1, batch_size.max(1));

    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_stmt) {
        let mut placeholders = Vec::with_capacity(chunk.len());
        let mut n = 0usize;
        for _ in chunk {
            let row_slots: Vec<String> = columns
                .iter()
                .map(|_| {
                    n += 1;
                    format!("${n}")
                })
                .collect();
            placeholders.push(format!("({})", row_slots.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in &columns {
                let value = row.get(column).cloned().unwrap_or(SqlValue::Null);
                query = value.bind_to(query);
            }
        }

        let result = query
            .execute(&mut **tx)
            .await
            .map_err(|e| EngineError::from_sqlx(server, e))?;
        written += result.rows_affected();
    }

    Ok(written)
}

/// Execute a validated post-update statement.
///
/// A `$ids` placeholder in the statement expands to the bound list of
/// processed identifiers; with the placeholder present and no identifiers
/// processed, the statement is skipped. Statements without the
/// placeholder run verbatim.
pub async fn run_post_update<'a>(
    ctx: &'a AppContext,
    server: ServerKey,
    statement: &'a str,
    keys: &'a [SqlValue],
    cancel: &'a tokio_util::sync::CancellationToken,
) -> Result<u64, EngineError> {
    query::validate_non_destructive(statement)?;

    // Dedupe while preserving first appearance.
    let mut seen = HashSet::new();
    let unique: Vec<&SqlValue> = keys
        .iter()
        .filter(|v| match v.key_string() {
            Some(k) => seen.insert(k),
            None => false,
        })
        .collect();

    let (sql, binds): (String, Vec<&SqlValue>) = if statement.contains("$ids") {
        if unique.is_empty() {
            tracing::info!("post-update skipped: no processed identifiers");
            return Ok(0);
        }
        let placeholders: Vec<String> = (1..=unique.len()).map(|i| format!("${i}")).collect();
        (
            statement.replace("$ids", &placeholders.join(", ")),
            unique,
        )
    } else {
        (statement.to_owned(), Vec::new())
    };

    let affected = run_with_retry(&ctx.settings.retry, cancel, |_, _| {}, async |_| {
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = value.bind_to(query);
        }
        let result = query
            .execute(ctx.servers.pool(server))
            .await
            .map_err(|e| EngineError::from_sqlx(server, e))?;
        Ok(result.rows_affected())
    })
    .await?;

    tracing::info!(rows_affected = affected, "post-update executed");
    Ok(affected)
}
