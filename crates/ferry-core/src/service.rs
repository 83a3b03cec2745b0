//! Task API surface.
//!
//! Every external operation goes through [`TaskService`]: definition
//! CRUD with invariant validation, execution with start-conflict guards,
//! cancellation, history and schedule access. Callers pass an opaque
//! identity that is logged, never interpreted.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use ferry_db::models::{Direction, RunState, ScheduleRow, Task, TaskExecution, TaskParameter};
use ferry_db::queries::executions as execution_db;
use ferry_db::queries::schedule as schedule_db;
use ferry_db::queries::tasks::{self as task_db, TaskDefinition};

use crate::context::AppContext;
use crate::error::EngineError;
use crate::group;
use crate::progress::{Subscription, TaskEvent};
use crate::query::{self, ParamValue};
use crate::scheduler;

/// Opaque caller identity passed through API operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by `execute`: the running task plus its event stream.
pub struct ExecutionHandle {
    pub task_id: Uuid,
    pub events: Subscription,
}

/// Group membership view for one task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LinkingInfo {
    pub linked_group: Option<String>,
    /// Member names in execution order.
    pub members: Vec<String>,
    pub coordinator: Option<String>,
}

/// The external operations surface.
pub struct TaskService {
    ctx: Arc<AppContext>,
}

impl TaskService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub async fn list_tasks(&self, caller: &CallerIdentity) -> Result<Vec<Task>, EngineError> {
        tracing::debug!(caller = %caller, "listing tasks");
        task_db::list_tasks(&self.ctx.store)
            .await
            .map_err(EngineError::Internal)
    }

    pub async fn get_task(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
    ) -> Result<Task, EngineError> {
        tracing::debug!(caller = %caller, task_id = %id, "fetching task");
        task_db::get_task(&self.ctx.store, id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
    }

    /// Create or update a task definition.
    ///
    /// Definitions are validated (query shape, mapping arity, group
    /// coordinator rule, chain cycles) and never mutated while running.
    pub async fn upsert_task(
        &self,
        caller: &CallerIdentity,
        mut def: TaskDefinition,
    ) -> Result<Task, EngineError> {
        tracing::info!(caller = %caller, task_name = %def.name, "upserting task");

        if let Some(existing) = task_db::get_task_by_name(&self.ctx.store, &def.name)
            .await
            .map_err(EngineError::Internal)?
        {
            if self.ctx.registry.is_running(existing.id) {
                return Err(EngineError::AlreadyRunning(existing.id));
            }
        }

        validate_definition(&self.ctx.store, &mut def).await?;

        task_db::upsert_task(&self.ctx.store, &def)
            .await
            .map_err(EngineError::Internal)
    }

    /// Delete a task. Refused while the task is running.
    pub async fn delete_task(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
    ) -> Result<(), EngineError> {
        tracing::info!(caller = %caller, task_id = %id, "deleting task");

        if self.ctx.registry.is_running(id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        let removed = task_db::delete_task(&self.ctx.store, id)
            .await
            .map_err(EngineError::Internal)?;
        if removed == 0 {
            return Err(EngineError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Trigger a task (and its linked group) in the background.
    ///
    /// Guards: inactive and non-manual tasks are refused; the registry
    /// enforces `AlreadyRunning` and the scheduler single-flight
    /// (`GlobalBusy`) when the run starts.
    pub async fn execute(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
        override_params: Option<Vec<TaskParameter>>,
    ) -> Result<ExecutionHandle, EngineError> {
        let task = self.get_task(caller, id).await?;

        if !task.kind.allows_manual() {
            return Err(EngineError::NotManual(id));
        }
        if !task.active {
            return Err(EngineError::InvalidConfig(format!(
                "task {:?} is inactive",
                task.name
            )));
        }
        if self.ctx.registry.is_running(id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        // Manual triggers of auto-capable tasks still count against the
        // single-flight rule; surface the conflict before spawning.
        let counts_as_auto = task.kind.allows_auto();
        if counts_as_auto && self.ctx.registry.running_auto_count() > 0 {
            return Err(EngineError::GlobalBusy);
        }

        tracing::info!(caller = %caller, task_name = %task.name, "manual execution requested");

        // Subscribe before spawning so no event is missed.
        let events = self.ctx.bus.subscribe(id);
        let plan = group::resolve_group(&self.ctx.store, &task).await?;

        let ctx = Arc::clone(&self.ctx);
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(async move {
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<_, EngineError>> + Send>> =
                Box::pin(group::run_group(
                    &ctx,
                    &plan,
                    counts_as_auto,
                    override_params,
                    &cancel,
                ));
            if let Err(e) = fut.await {
                tracing::error!(task_id = %id, error = %e, "execution ended with error");
            }
        });

        Ok(ExecutionHandle { task_id: id, events })
    }

    /// Cancel a running task.
    ///
    /// Returns a subscription delivering status updates until terminal.
    pub async fn cancel(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
        force: bool,
        reason: Option<&str>,
    ) -> Result<Subscription, EngineError> {
        tracing::info!(caller = %caller, task_id = %id, force, "cancellation requested");

        let entry = self.ctx.registry.cancel(id, force, reason)?;
        if let Err(e) =
            task_db::set_run_state(&self.ctx.store, id, RunState::Cancelling, entry.progress).await
        {
            tracing::warn!(task_id = %id, error = %e, "failed to persist cancelling state");
        }
        self.ctx.bus.publish(TaskEvent::Status {
            task_id: id,
            state: RunState::Cancelling,
            connection_lost: false,
            error_code: None,
        });

        Ok(self.ctx.bus.subscribe(id))
    }

    pub async fn history(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
        limit: i64,
    ) -> Result<Vec<TaskExecution>, EngineError> {
        tracing::debug!(caller = %caller, task_id = %id, "fetching history");
        // Surface NotFound for unknown tasks rather than an empty list.
        self.get_task(caller, id).await?;
        execution_db::list_executions(&self.ctx.store, id, limit)
            .await
            .map_err(EngineError::Internal)
    }

    pub async fn linking_info(
        &self,
        caller: &CallerIdentity,
        id: Uuid,
    ) -> Result<LinkingInfo, EngineError> {
        let task = self.get_task(caller, id).await?;
        let plan = group::resolve_group(&self.ctx.store, &task).await?;

        let coordinator = match plan.kind {
            group::GroupKind::Coordinated { coordinator } => plan
                .members
                .iter()
                .find(|m| m.id == coordinator)
                .map(|m| m.name.clone()),
            _ => None,
        };

        Ok(LinkingInfo {
            linked_group: plan.group,
            members: plan.members.iter().map(|m| m.name.clone()).collect(),
            coordinator,
        })
    }

    pub async fn get_schedule(
        &self,
        caller: &CallerIdentity,
    ) -> Result<ScheduleRow, EngineError> {
        tracing::debug!(caller = %caller, "fetching schedule");
        schedule_db::get_schedule(&self.ctx.store)
            .await
            .map_err(EngineError::Internal)
    }

    pub async fn set_schedule(
        &self,
        caller: &CallerIdentity,
        hour: &str,
        enabled: bool,
    ) -> Result<ScheduleRow, EngineError> {
        if scheduler::parse_hour(hour).is_none() {
            return Err(EngineError::InvalidConfig(format!(
                "schedule hour {hour:?} is not HH:MM 24-hour form"
            )));
        }
        tracing::info!(caller = %caller, hour = %hour, enabled, "updating schedule");
        schedule_db::set_schedule(&self.ctx.store, hour, enabled)
            .await
            .map_err(EngineError::Internal)
    }

    /// Subscribe to a task's progress topic.
    pub fn subscribe(&self, id: Uuid) -> Subscription {
        self.ctx.bus.subscribe(id)
    }
}

/// Validate a definition against the structural invariants.
///
/// Also derives `is_coordinator` from the presence of a post-update.
async fn validate_definition(
    pool: &PgPool,
    def: &mut TaskDefinition,
) -> Result<(), EngineError> {
    if def.name.trim().is_empty() {
        return Err(EngineError::InvalidConfig("task name is empty".to_owned()));
    }

    query::validate_select(&def.query)?;

    let has_post_update = def
        .post_update_query
        .as_deref()
        .is_some_and(|q| !q.is_empty());
    if has_post_update {
        query::validate_non_destructive(def.post_update_query.as_deref().unwrap_or_default())?;
    }
    def.is_coordinator = has_post_update;

    // Parameters must classify cleanly against their operators.
    for param in &def.parameters {
        ParamValue::from_parameter(param)?;
    }

    match def.direction {
        Direction::Down => {
            let mapping = def.field_mapping.as_ref().ok_or_else(|| {
                EngineError::InvalidConfig(
                    "down transfers require a field mapping".to_owned(),
                )
            })?;
            if mapping.source_fields.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "field mapping has no source fields".to_owned(),
                ));
            }
            if mapping.source_fields.len() != mapping.target_fields.len() {
                return Err(EngineError::InvalidConfig(format!(
                    "field mapping arity mismatch: {} source fields, {} target fields",
                    mapping.source_fields.len(),
                    mapping.target_fields.len()
                )));
            }
        }
        Direction::Internal => {
            if def.target_table.as_deref().is_none_or(str::is_empty) {
                return Err(EngineError::InvalidConfig(
                    "internal transfers require a target table".to_owned(),
                ));
            }
        }
        Direction::Up | Direction::General => {}
    }

    if !def.next_tasks.is_empty() && def.direction != Direction::Down {
        return Err(EngineError::InvalidConfig(
            "chained tasks apply to down transfers only".to_owned(),
        ));
    }

    // Group coordinator rule: at most one member holds a post-update.
    if let Some(group) = def.linked_group.as_deref().filter(|g| !g.is_empty()) {
        if has_post_update {
            let members = task_db::list_group_members(pool, group)
                .await
                .map_err(EngineError::Internal)?;
            let other_coordinator = members.iter().find(|m| {
                m.name != def.name
                    && m.post_update_query
                        .as_deref()
                        .is_some_and(|q| !q.is_empty())
            });
            if let Some(other) = other_coordinator {
                return Err(EngineError::InvalidConfig(format!(
                    "group {group:?} already has coordinator {:?}",
                    other.name
                )));
            }
        }
    }

    // Chain cycle detection: following next_tasks from this task must
    // never come back to it.
    if !def.next_tasks.is_empty() {
        let own_id = task_db::get_task_by_name(pool, &def.name)
            .await
            .map_err(EngineError::Internal)?
            .map(|t| t.id);
        detect_chain_cycle(pool, own_id, &def.next_tasks).await?;
    }

    Ok(())
}

/// Walk `next_tasks` edges breadth-first looking for a cycle back to the
/// task being upserted.
async fn detect_chain_cycle(
    pool: &PgPool,
    own_id: Option<Uuid>,
    roots: &[Uuid],
) -> Result<(), EngineError> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut queue: Vec<Uuid> = roots.to_vec();

    while let Some(id) = queue.pop() {
        if Some(id) == own_id {
            return Err(EngineError::InvalidConfig(
                "next_tasks chain forms a cycle".to_owned(),
            ));
        }
        if !visited.insert(id) {
            continue;
        }
        let task = task_db::get_task(pool, id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NotFound(format!("chained task {id}")))?;
        queue.extend(task.next_tasks.0.iter().copied());
    }

    Ok(())
}
