//! Scheduler sweep tests: deterministic order, group handling, and
//! isolation of failures.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use ferry_core::context::{AppContext, EngineSettings};
use ferry_core::scheduler;
use ferry_db::models::{Direction, RunState, TaskKind, TransferMode};
use ferry_db::queries::tasks::{self as task_db, TaskDefinition};
use ferry_db::server::ServerPools;
use ferry_test_utils::{create_scratch_db, create_test_db, drop_test_db};

struct TestHarness {
    ctx: Arc<AppContext>,
    source: PgPool,
    store_db: String,
    source_db: String,
    target_db: String,
    target: PgPool,
}

impl TestHarness {
    async fn new() -> Self {
        let (store, store_db) = create_test_db().await;
        let (source, source_db) = create_scratch_db("ferry_src").await;
        let (target, target_db) = create_scratch_db("ferry_dst").await;

        let servers = ServerPools::from_pools(source.clone(), target.clone());
        let ctx = AppContext::new(store, servers, EngineSettings::default());

        Self {
            ctx,
            source,
            store_db,
            source_db,
            target_db,
            target,
        }
    }

    async fn exec_source(&self, sql: &str) {
        sqlx::query(sql)
            .execute(&self.source)
            .await
            .unwrap_or_else(|e| panic!("source DDL failed: {e}\n{sql}"));
    }

    async fn teardown(self) {
        self.ctx.store.close().await;
        self.source.close().await;
        self.target.close().await;
        drop_test_db(&self.store_db).await;
        drop_test_db(&self.source_db).await;
        drop_test_db(&self.target_db).await;
    }
}

fn auto_task(name: &str, dst: &str) -> TaskDefinition {
    TaskDefinition {
        name: name.to_owned(),
        kind: TaskKind::Auto,
        direction: Direction::Internal,
        mode: TransferMode::Normal,
        active: true,
        query: "SELECT id FROM src".to_owned(),
        parameters: Vec::new(),
        clear_before_insert: false,
        field_mapping: None,
        target_table: Some(dst.to_owned()),
        validation_rules: None,
        post_update_query: None,
        post_update_mapping: None,
        linked_group: None,
        linked_execution_order: 0,
        linked_tasks: Vec::new(),
        is_coordinator: false,
        next_tasks: Vec::new(),
        bonification: None,
    }
}

#[tokio::test]
async fn sweep_runs_all_active_auto_tasks() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src (id INT)").await;
    h.exec_source("INSERT INTO src VALUES (1), (2)").await;
    h.exec_source("CREATE TABLE dst_one (id INT)").await;
    h.exec_source("CREATE TABLE dst_two (id INT)").await;
    h.exec_source("CREATE TABLE dst_manual (id INT)").await;

    task_db::upsert_task(&h.ctx.store, &auto_task("auto-one", "dst_one")).await.unwrap();
    task_db::upsert_task(&h.ctx.store, &auto_task("auto-two", "dst_two")).await.unwrap();

    let mut manual = auto_task("manual-one", "dst_manual");
    manual.kind = TaskKind::Manual;
    task_db::upsert_task(&h.ctx.store, &manual).await.unwrap();

    let mut inactive = auto_task("auto-off", "dst_manual");
    inactive.active = false;
    task_db::upsert_task(&h.ctx.store, &inactive).await.unwrap();

    scheduler::run_sweep(&h.ctx, &CancellationToken::new())
        .await
        .expect("sweep should finish");

    for (dst, expected) in [("dst_one", 2i64), ("dst_two", 2), ("dst_manual", 0)] {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {dst}"))
            .fetch_one(&h.source)
            .await
            .unwrap();
        assert_eq!(count, expected, "{dst}");
    }

    // Both auto tasks recorded a completed run.
    for name in ["auto-one", "auto-two"] {
        let task = task_db::get_task_by_name(&h.ctx.store, name).await.unwrap().unwrap();
        assert_eq!(task.status, RunState::Completed);
        assert_eq!(task.execution_count, 1);
    }

    h.teardown().await;
}

#[tokio::test]
async fn sweep_continues_past_failing_task() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src (id INT)").await;
    h.exec_source("INSERT INTO src VALUES (1)").await;
    h.exec_source("CREATE TABLE dst_ok (id INT)").await;

    // "aaa-broken" sorts first and fails (missing destination table).
    task_db::upsert_task(&h.ctx.store, &auto_task("aaa-broken", "dst_missing")).await.unwrap();
    task_db::upsert_task(&h.ctx.store, &auto_task("bbb-ok", "dst_ok")).await.unwrap();

    scheduler::run_sweep(&h.ctx, &CancellationToken::new())
        .await
        .expect("sweep should finish despite failures");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dst_ok")
        .fetch_one(&h.source)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let broken = task_db::get_task_by_name(&h.ctx.store, "aaa-broken").await.unwrap().unwrap();
    assert_eq!(broken.status, RunState::Failed);
    let ok = task_db::get_task_by_name(&h.ctx.store, "bbb-ok").await.unwrap().unwrap();
    assert_eq!(ok.status, RunState::Completed);

    h.teardown().await;
}

#[tokio::test]
async fn cancelled_sweep_stops_early() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src (id INT)").await;
    h.exec_source("CREATE TABLE dst (id INT)").await;

    task_db::upsert_task(&h.ctx.store, &auto_task("never-runs", "dst")).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = scheduler::run_sweep(&h.ctx, &cancel).await.unwrap_err();
    assert!(matches!(err, ferry_core::error::EngineError::Cancelled));

    let task = task_db::get_task_by_name(&h.ctx.store, "never-runs").await.unwrap().unwrap();
    assert_eq!(task.status, RunState::Pending);

    h.teardown().await;
}
