//! Execution-related commands: execute, cancel, history, linking.

use anyhow::Result;

use ferry_core::progress::TaskEvent;
use ferry_core::service::{CallerIdentity, TaskService};
use ferry_db::models::RunState;

use crate::task_cmds::resolve_task;

/// Run a task and (by default) stream its progress to stdout.
pub async fn run_execute(
    service: &TaskService,
    caller: &CallerIdentity,
    task_arg: &str,
    no_follow: bool,
) -> Result<()> {
    let task = resolve_task(service, caller, task_arg).await?;
    let mut handle = service.execute(caller, task.id, None).await?;

    println!("Executing {:?} ({})", task.name, handle.task_id);
    if no_follow {
        println!("Running in background; follow with `ferry task show {}`.", task.name);
        return Ok(());
    }

    while let Some(event) = handle.events.next_event().await {
        match &event {
            TaskEvent::Progress {
                percent,
                phase,
                rows_processed,
                ..
            } => match rows_processed {
                Some(rows) => println!("[{percent:>3}%] {phase} ({rows} rows)"),
                None => println!("[{percent:>3}%] {phase}"),
            },
            TaskEvent::Status {
                state,
                connection_lost,
                error_code,
                ..
            } => {
                if *connection_lost {
                    println!("       connection lost, retrying...");
                }
                match error_code {
                    Some(code) => println!("state: {state} ({code})"),
                    None => println!("state: {state}"),
                }
                if state.is_terminal() {
                    if *state != RunState::Completed {
                        std::process::exit(4);
                    }
                    break;
                }
            }
            TaskEvent::Error { message, .. } => println!("error: {message}"),
            TaskEvent::Connected { .. } | TaskEvent::ReconnectFailed { .. } => {}
        }
    }

    Ok(())
}

/// Cancel a running task and wait for the terminal status.
pub async fn run_cancel(
    service: &TaskService,
    caller: &CallerIdentity,
    task_arg: &str,
    force: bool,
    reason: Option<&str>,
) -> Result<()> {
    let task = resolve_task(service, caller, task_arg).await?;
    let mut updates = service.cancel(caller, task.id, force, reason).await?;

    println!("Cancelling {:?}...", task.name);
    while let Some(event) = updates.next_event().await {
        if let TaskEvent::Status { state, .. } = &event {
            println!("state: {state}");
            if state.is_terminal() {
                break;
            }
        }
    }

    Ok(())
}

/// Print history rows, newest first.
pub async fn run_history(
    service: &TaskService,
    caller: &CallerIdentity,
    task_arg: &str,
    limit: i64,
) -> Result<()> {
    let task = resolve_task(service, caller, task_arg).await?;
    let rows = service.history(caller, task.id, limit).await?;

    if rows.is_empty() {
        println!("No executions recorded for {:?}.", task.name);
        return Ok(());
    }

    println!(
        "{:<25} {:<10} {:>8} {:>8} {:>8} {:>8}",
        "STARTED", "OUTCOME", "READ", "WRITTEN", "SKIPPED", "ORPHANS"
    );
    for row in &rows {
        println!(
            "{:<25} {:<10} {:>8} {:>8} {:>8} {:>8}",
            row.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.outcome.to_string(),
            row.rows_read,
            row.rows_written,
            row.rows_skipped,
            row.orphan_bonifications,
        );
        if let Some(error) = &row.error {
            println!("    error: {error}");
        }
    }

    Ok(())
}

/// Print linked-group membership for a task.
pub async fn run_linking(
    service: &TaskService,
    caller: &CallerIdentity,
    task_arg: &str,
) -> Result<()> {
    let task = resolve_task(service, caller, task_arg).await?;
    let info = service.linking_info(caller, task.id).await?;

    match &info.linked_group {
        Some(group) => println!("Group: {group}"),
        None if info.members.len() > 1 => println!("Direct links (no shared post-update):"),
        None => {
            println!("Task {:?} is not linked.", task.name);
            return Ok(());
        }
    }
    for member in &info.members {
        let marker = if Some(member) == info.coordinator.as_ref() {
            " (coordinator)"
        } else {
            ""
        };
        println!("  - {member}{marker}");
    }

    Ok(())
}
