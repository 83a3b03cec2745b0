//! Linked-group coordination.
//!
//! Tasks sharing a group execute together: members run sequentially in
//! declared order up to their write phase, then the single coordinator
//! executes the group's post-update once over the union of processed
//! identifiers, and only then are chained tasks started.

use std::collections::HashSet;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ferry_db::models::{Direction, Task};
use ferry_db::queries::tasks as task_db;
use ferry_db::value::SqlValue;

use crate::context::AppContext;
use crate::error::EngineError;
use crate::executor::{self, ExecOptions, ExecutionReport};

/// How a task and its links resolve into an execution unit.
#[derive(Debug)]
pub enum GroupKind {
    /// Ordered members with a single coordinator post-update barrier.
    Coordinated { coordinator: Uuid },
    /// Direct links without a shared barrier; each member runs its own
    /// post-update.
    FanOut,
    /// No links at all.
    Single,
}

/// Resolved execution plan for a task and its links.
#[derive(Debug)]
pub struct GroupPlan {
    pub group: Option<String>,
    pub kind: GroupKind,
    /// Members in execution order.
    pub members: Vec<Task>,
}

/// Result of a whole group run.
#[derive(Debug)]
pub struct GroupReport {
    pub reports: Vec<ExecutionReport>,
    pub post_update_rows: u64,
}

/// Resolve the execution unit containing `task`.
///
/// A non-empty `linked_group` wins over `linked_tasks`; the group's
/// coordinator invariant (exactly one member holding a post-update) is
/// verified here.
pub async fn resolve_group(pool: &PgPool, task: &Task) -> Result<GroupPlan, EngineError> {
    if let Some(group) = task.group() {
        if !task.linked_tasks.0.is_empty() {
            tracing::warn!(
                task_name = %task.name,
                group = %group,
                "task has both linked_group and linked_tasks; group wins"
            );
        }

        let members = task_db::list_group_members(pool, group)
            .await
            .map_err(EngineError::Internal)?;
        if members.is_empty() {
            return Err(EngineError::NotFound(format!(
                "active members of group {group:?}"
            )));
        }

        let coordinators: Vec<&Task> = members
            .iter()
            .filter(|m| {
                m.post_update_query
                    .as_deref()
                    .is_some_and(|q| !q.is_empty())
            })
            .collect();
        let coordinator = match coordinators.as_slice() {
            [single] => single.id,
            [] => {
                return Err(EngineError::InvalidConfig(format!(
                    "group {group:?} has no coordinator (no member holds a post-update)"
                )));
            }
            many => {
                let names: Vec<&str> = many.iter().map(|t| t.name.as_str()).collect();
                return Err(EngineError::InvalidConfig(format!(
                    "group {group:?} has {} coordinators: {}",
                    many.len(),
                    names.join(", ")
                )));
            }
        };

        return Ok(GroupPlan {
            group: Some(group.to_owned()),
            kind: GroupKind::Coordinated { coordinator },
            members,
        });
    }

    if !task.linked_tasks.0.is_empty() {
        let mut members = vec![task.clone()];
        for id in &task.linked_tasks.0 {
            let linked = task_db::get_task(pool, *id)
                .await
                .map_err(EngineError::Internal)?
                .ok_or_else(|| EngineError::NotFound(format!("linked task {id}")))?;
            if linked.active {
                members.push(linked);
            } else {
                tracing::info!(task_name = %linked.name, "skipping inactive linked task");
            }
        }
        return Ok(GroupPlan {
            group: None,
            kind: GroupKind::FanOut,
            members,
        });
    }

    Ok(GroupPlan {
        group: None,
        kind: GroupKind::Single,
        members: vec![task.clone()],
    })
}

/// Execute a resolved group plan.
///
/// Members run strictly sequentially. In coordinated mode the post-update
/// is deferred to the coordinator and fires once after every member has
/// written; any member failure aborts the remainder, and committed
/// members are reported via `GroupPartiallyFailed`.
pub async fn run_group<'a>(
    ctx: &'a AppContext,
    plan: &'a GroupPlan,
    is_auto: bool,
    override_params: Option<Vec<ferry_db::models::TaskParameter>>,
    cancel: &'a CancellationToken,
) -> Result<GroupReport, EngineError> {
    let coordinated = matches!(plan.kind, GroupKind::Coordinated { .. });
    // Overrides apply to a solo run only; grouped members execute with
    // their stored parameters.
    let solo_overrides = if plan.members.len() == 1 {
        override_params
    } else {
        None
    };

    let mut reports: Vec<ExecutionReport> = Vec::new();
    let mut union_keys: Vec<SqlValue> = Vec::new();

    for member in &plan.members {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let opts = ExecOptions {
            is_auto,
            run_post_update: !coordinated,
        };

        tracing::info!(
            task_name = %member.name,
            group = plan.group.as_deref().unwrap_or("-"),
            order = member.linked_execution_order,
            "executing group member"
        );

        let report = executor::execute_task(ctx, member, solo_overrides.clone(), &opts).await;
        match report {
            Ok(report) => match report.outcome {
                ferry_db::models::ExecutionOutcome::Success => {
                    union_keys.extend(report.processed_keys.iter().cloned());
                    reports.push(report);
                }
                ferry_db::models::ExecutionOutcome::Cancelled => {
                    return Err(EngineError::Cancelled);
                }
                ferry_db::models::ExecutionOutcome::Failure => {
                    return Err(member_failure(plan, member, &reports, report.error));
                }
            },
            Err(err) => {
                tracing::error!(
                    task_name = %member.name,
                    error = %err,
                    "group member failed to start"
                );
                if matches!(err, EngineError::Cancelled) {
                    return Err(EngineError::Cancelled);
                }
                return Err(member_failure(plan, member, &reports, Some(err.to_string())));
            }
        }
    }

    // Coordinator post-update, exactly once over the union of keys.
    let mut post_update_rows = 0;
    if let GroupKind::Coordinated { coordinator } = plan.kind {
        let coordinator_task = plan
            .members
            .iter()
            .find(|m| m.id == coordinator)
            .expect("coordinator is a member");
        let statement = coordinator_task
            .post_update_query
            .as_deref()
            .expect("coordinator holds the post-update");

        post_update_rows = executor::run_post_update(
            ctx,
            executor::read_server(coordinator_task.direction),
            statement,
            &union_keys,
            cancel,
        )
        .await?;
    }

    // Chains fire only after post-update success.
    let next: Vec<Uuid> = reports.iter().flat_map(|r| r.next_tasks.clone()).collect();
    let chained = run_chains(ctx, next, &plan.members, cancel).await?;
    reports.extend(chained);

    Ok(GroupReport {
        reports,
        post_update_rows,
    })
}

fn member_failure(
    plan: &GroupPlan,
    failed: &Task,
    committed: &[ExecutionReport],
    error: Option<String>,
) -> EngineError {
    if committed.is_empty() {
        return EngineError::QueryExecutionFailed {
            message: error.unwrap_or_else(|| format!("member {:?} failed", failed.name)),
            sql_state: None,
        };
    }
    EngineError::GroupPartiallyFailed {
        group: plan.group.clone().unwrap_or_default(),
        failed_member: failed.name.clone(),
        committed: committed
            .iter()
            .map(|r| r.task_id.to_string())
            .collect(),
    }
}

/// Run chained tasks breadth-first, guarding against cycles.
///
/// Chained tasks run with their own stored parameters and their own
/// post-update; their `next_tasks` keep the chain going.
async fn run_chains<'a>(
    ctx: &'a AppContext,
    initial: Vec<Uuid>,
    already_run: &'a [Task],
    cancel: &'a CancellationToken,
) -> Result<Vec<ExecutionReport>, EngineError> {
    let mut visited: HashSet<Uuid> = already_run.iter().map(|t| t.id).collect();
    let mut queue: Vec<Uuid> = initial;
    let mut reports = Vec::new();

    while let Some(id) = queue.pop() {
        if !visited.insert(id) {
            tracing::warn!(task_id = %id, "skipping already-executed chained task");
            continue;
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let task = task_db::get_task(&ctx.store, id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NotFound(format!("chained task {id}")))?;
        if !task.active {
            tracing::info!(task_name = %task.name, "skipping inactive chained task");
            continue;
        }
        if task.direction != Direction::Down {
            // Chains are declared on down transfers only; tolerate but log.
            tracing::warn!(task_name = %task.name, "chained task is not a down transfer");
        }

        tracing::info!(task_name = %task.name, "executing chained task");
        match executor::execute_task(ctx, &task, None, &ExecOptions::default()).await {
            Ok(report) => {
                queue.extend(report.next_tasks.clone());
                reports.push(report);
            }
            // A chain failure is its own task's failure; it does not undo
            // the parent transfer.
            Err(err) => {
                tracing::error!(task_name = %task.name, error = %err, "chained task failed");
            }
        }
    }

    Ok(reports)
}
