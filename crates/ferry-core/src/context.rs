//! Application context: everything the engine needs, built once at
//! startup and passed explicitly. No module-level mutable state.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use ferry_db::server::ServerPools;

use crate::progress::ProgressBus;
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Rows per batch in streaming mode (and per INSERT statement chunk).
    pub batch_size: usize,
    /// Wall-clock limit for normal-mode executions.
    pub task_timeout: Duration,
    /// Wall-clock limit for streaming executions; `None` means unbounded.
    pub streaming_timeout: Option<Duration>,
    /// When set, unresolved bonification references fail the task instead
    /// of surfacing as a warning counter.
    pub strict_bonification: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_size: 500,
            task_timeout: Duration::from_secs(300),
            streaming_timeout: None,
            strict_bonification: false,
        }
    }
}

/// Shared engine state.
pub struct AppContext {
    /// Control store (task definitions, history, schedule).
    pub store: PgPool,
    /// Data-plane pools (source/target servers).
    pub servers: Arc<ServerPools>,
    pub registry: Arc<TaskRegistry>,
    pub bus: Arc<ProgressBus>,
    pub settings: EngineSettings,
}

impl AppContext {
    pub fn new(store: PgPool, servers: ServerPools, settings: EngineSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            servers: Arc::new(servers),
            registry: Arc::new(TaskRegistry::new()),
            bus: Arc::new(ProgressBus::new()),
            settings,
        })
    }
}
