//! In-memory registry of running tasks.
//!
//! Tracks one entry per active execution: cancellation token, live state
//! and progress. The persisted `status` column mirrors this map; startup
//! reconciliation repairs rows left behind by a dead process.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ferry_db::models::RunState;
use ferry_db::queries::tasks as task_db;

use crate::error::EngineError;

/// Live state of one running execution.
#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub task_id: Uuid,
    pub state: RunState,
    /// Last published percent; -1 after cancellation or failure.
    pub progress: i32,
    pub started_at: DateTime<Utc>,
    /// Whether this run counts against the scheduler single-flight rule.
    pub is_auto: bool,
    pub cancel: CancellationToken,
    pub cancel_reason: Option<String>,
}

/// Registry of running tasks, keyed by task ID.
pub struct TaskRegistry {
    entries: Mutex<HashMap<Uuid, RunningEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register an execution and hand back its cancellation token.
    ///
    /// Fails with `AlreadyRunning` when the task has a live entry, and
    /// with `GlobalBusy` when `is_auto` and another auto run is live
    /// (at most one scheduled transfer at a time).
    pub fn register(&self, task_id: Uuid, is_auto: bool) -> Result<CancellationToken, EngineError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");

        if entries.contains_key(&task_id) {
            return Err(EngineError::AlreadyRunning(task_id));
        }
        if is_auto && entries.values().any(|e| e.is_auto) {
            return Err(EngineError::GlobalBusy);
        }

        let cancel = CancellationToken::new();
        entries.insert(
            task_id,
            RunningEntry {
                task_id,
                state: RunState::Pending,
                progress: 0,
                started_at: Utc::now(),
                is_auto,
                cancel: cancel.clone(),
                cancel_reason: None,
            },
        );
        Ok(cancel)
    }

    /// Trigger cancellation of a running task.
    ///
    /// Transitions the entry to `cancelling` and fires its token. The
    /// entry itself stays until the executor observes the token and
    /// completes; `force` is recorded so the executor discards (rather
    /// than returns) the in-flight connection.
    pub fn cancel(
        &self,
        task_id: Uuid,
        force: bool,
        reason: Option<&str>,
    ) -> Result<RunningEntry, EngineError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries
            .get_mut(&task_id)
            .ok_or_else(|| EngineError::NotFound(format!("running task {task_id}")))?;

        entry.state = RunState::Cancelling;
        entry.cancel_reason = Some(
            reason
                .map(str::to_owned)
                .unwrap_or_else(|| "cancelled by user".to_owned()),
        );
        if force {
            tracing::warn!(task_id = %task_id, "forced cancellation requested");
        }
        entry.cancel.cancel();
        Ok(entry.clone())
    }

    /// Record a progress update, keeping the value monotonic within the
    /// execution. `-1` (cancelled/failed marker) always wins.
    pub fn set_progress(&self, task_id: Uuid, progress: i32) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(&task_id) {
            if progress == -1 {
                entry.progress = -1;
            } else {
                entry.progress = entry.progress.max(progress);
            }
        }
    }

    pub fn set_state(&self, task_id: Uuid, state: RunState) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(&task_id) {
            entry.state = state;
        }
    }

    /// Remove an entry once its terminal status has been published.
    pub fn complete(&self, task_id: Uuid) -> Option<RunningEntry> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .remove(&task_id)
    }

    pub fn snapshot(&self, task_id: Uuid) -> Option<RunningEntry> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(&task_id)
            .cloned()
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&task_id)
    }

    /// Number of live runs counting against the single-flight rule.
    pub fn running_auto_count(&self) -> usize {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|e| e.is_auto)
            .count()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Cancel every live execution (process shutdown).
    pub fn cancel_all(&self, reason: &str) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        for entry in entries.values_mut() {
            entry.state = RunState::Cancelling;
            entry.cancel_reason = Some(reason.to_owned());
            entry.cancel.cancel();
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Repair persisted statuses on startup.
///
/// A row marked `running` or `cancelling` with no in-memory entry (the
/// process just started, so every such row) belongs to a dead process;
/// it is flipped to `failed`.
pub async fn reconcile_on_startup(pool: &PgPool) -> anyhow::Result<usize> {
    let stale = task_db::reset_stale_running(pool, "process restarted").await?;
    for task in &stale {
        tracing::warn!(
            task_id = %task.id,
            task_name = %task.name,
            "reset stale running task to failed"
        );
    }
    Ok(stale.len())
}
