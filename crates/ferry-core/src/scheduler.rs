//! Daily scheduler.
//!
//! One background worker per process. Every half-minute it reads the
//! schedule config (picking up changes without a restart) and, when the
//! configured `HH:MM` local time arrives, sweeps all active auto tasks
//! through the group coordinator -- at most once per day, with the whole
//! sweep guarded by a try-lock so fire cycles never overlap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveTime, Timelike};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ferry_db::queries::schedule as schedule_db;
use ferry_db::queries::tasks as task_db;

use crate::context::AppContext;
use crate::error::EngineError;
use crate::group;
use crate::registry::reconcile_on_startup;

/// Interval between schedule checks.
const TICK: Duration = Duration::from_secs(30);

/// Parse a `HH:MM` 24-hour schedule string.
pub fn parse_hour(value: &str) -> Option<NaiveTime> {
    let (h, m) = value.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Whether the schedule is due at `now`, given the last fired date.
///
/// Due means: same calendar minute as the configured time, and not
/// already fired today.
fn is_due(now: chrono::DateTime<Local>, fire_at: NaiveTime, last_fired: Option<NaiveDate>) -> bool {
    if last_fired == Some(now.date_naive()) {
        return false;
    }
    now.time().hour() == fire_at.hour() && now.time().minute() == fire_at.minute()
}

/// Run the scheduler loop until cancelled.
///
/// Startup reconciliation happens before the first tick, so stale
/// `running` markers from a dead process never block the sweep.
pub async fn run_scheduler(ctx: Arc<AppContext>, cancel: CancellationToken) -> anyhow::Result<()> {
    reconcile_on_startup(&ctx.store).await?;

    let sweep_lock = Mutex::new(());
    let mut last_fired: Option<NaiveDate> = None;

    tracing::info!("scheduler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = cancel.cancelled() => {
                tracing::info!("scheduler stopping");
                return Ok(());
            }
        }

        let config = match schedule_db::get_schedule(&ctx.store).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to read schedule config");
                continue;
            }
        };
        if !config.enabled {
            continue;
        }
        let Some(fire_at) = parse_hour(&config.hour) else {
            tracing::error!(hour = %config.hour, "invalid schedule hour");
            continue;
        };

        let now = Local::now();
        if !is_due(now, fire_at, last_fired) {
            continue;
        }

        // Overlapping fire cycles are skipped, not queued.
        let Ok(_guard) = sweep_lock.try_lock() else {
            tracing::warn!("previous sweep still running, skipping fire cycle");
            continue;
        };
        last_fired = Some(now.date_naive());

        tracing::info!(hour = %config.hour, "schedule fired, sweeping auto tasks");
        if let Err(e) = run_sweep(&ctx, &cancel).await {
            tracing::error!(error = %e, "scheduled sweep failed");
        }
    }
}

/// Execute all active auto tasks, group by group, in deterministic order.
pub async fn run_sweep(ctx: &AppContext, cancel: &CancellationToken) -> Result<(), EngineError> {
    let tasks = task_db::list_schedulable_tasks(&ctx.store)
        .await
        .map_err(EngineError::Internal)?;

    if tasks.is_empty() {
        tracing::info!("no active auto tasks to run");
        return Ok(());
    }

    // Tasks arrive ordered by (group, execution order, name); executing a
    // group once covers all its members.
    let mut done: HashSet<Uuid> = HashSet::new();
    let mut failures = 0usize;

    for task in &tasks {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if done.contains(&task.id) {
            continue;
        }

        let plan = match group::resolve_group(&ctx.store, task).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(task_name = %task.name, error = %e, "skipping misconfigured group");
                failures += 1;
                done.insert(task.id);
                continue;
            }
        };
        for member in &plan.members {
            done.insert(member.id);
        }

        match group::run_group(ctx, &plan, true, None, cancel).await {
            Ok(report) => {
                for r in &report.reports {
                    done.insert(r.task_id);
                }
                tracing::info!(
                    task_name = %task.name,
                    executions = report.reports.len(),
                    "group sweep step finished"
                );
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                tracing::error!(task_name = %task.name, error = %e, "group execution failed");
                failures += 1;
            }
        }
    }

    tracing::info!(
        total = tasks.len(),
        failures,
        "scheduled sweep complete"
    );
    Ok(())
}
