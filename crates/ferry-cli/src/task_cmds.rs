//! `ferry task` subcommands: list, show, upsert, delete.

use anyhow::{Context, Result};
use uuid::Uuid;

use ferry_core::definition;
use ferry_core::service::{CallerIdentity, TaskService};
use ferry_db::models::Task;

use crate::TaskCommands;

/// Resolve a task argument that may be a name or a UUID.
pub async fn resolve_task(
    service: &TaskService,
    caller: &CallerIdentity,
    arg: &str,
) -> Result<Task> {
    if let Ok(id) = Uuid::parse_str(arg) {
        return service
            .get_task(caller, id)
            .await
            .with_context(|| format!("task {arg} not found"));
    }
    let tasks = service.list_tasks(caller).await?;
    tasks
        .into_iter()
        .find(|t| t.name == arg)
        .with_context(|| format!("no task named {arg:?}"))
}

pub async fn run_task_command(
    command: TaskCommands,
    service: &TaskService,
    caller: &CallerIdentity,
) -> Result<()> {
    match command {
        TaskCommands::List => {
            let tasks = service.list_tasks(caller).await?;
            if tasks.is_empty() {
                println!("No tasks defined. Create one with `ferry task upsert <file.toml>`.");
                return Ok(());
            }
            println!(
                "{:<30} {:<8} {:<9} {:<10} {:<10} {:>6}",
                "NAME", "KIND", "DIRECTION", "STATUS", "GROUP", "RUNS"
            );
            for task in &tasks {
                println!(
                    "{:<30} {:<8} {:<9} {:<10} {:<10} {:>6}",
                    task.name,
                    task.kind.to_string(),
                    task.direction.to_string(),
                    task.status.to_string(),
                    task.group().unwrap_or("-"),
                    task.execution_count,
                );
            }
        }
        TaskCommands::Show { task } => {
            let task = resolve_task(service, caller, &task).await?;
            println!("Task: {} ({})", task.name, task.id);
            println!("  kind:       {}", task.kind);
            println!("  direction:  {}", task.direction);
            println!("  mode:       {}", task.mode);
            println!("  active:     {}", task.active);
            println!("  status:     {} (progress {})", task.status, task.progress);
            println!("  executions: {}", task.execution_count);
            if let Some(group) = task.group() {
                println!(
                    "  group:      {} (order {})",
                    group, task.linked_execution_order
                );
            }
            if let Some(date) = task.last_execution_date {
                println!("  last run:   {date}");
            }
            if let Some(result) = &task.last_execution_result {
                println!("  last result: {}", result.0.message);
                if let Some(error) = &result.0.error {
                    println!("  last error:  {error}");
                }
            }
            println!("  query:      {}", task.query.trim());
        }
        TaskCommands::Upsert { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {file}"))?;
            let parsed = definition::parse_task_toml(&contents)?;
            let def = parsed
                .into_definition(&service.context().store)
                .await
                .map_err(anyhow::Error::from)?;
            let task = service.upsert_task(caller, def).await?;
            println!("Task {:?} saved ({})", task.name, task.id);
        }
        TaskCommands::Delete { task } => {
            let task = resolve_task(service, caller, &task).await?;
            service.delete_task(caller, task.id).await?;
            println!("Task {:?} deleted.", task.name);
        }
    }

    Ok(())
}
