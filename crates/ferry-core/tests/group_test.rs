//! Linked-group coordination tests: ordering, the single-coordinator
//! post-update barrier, partial failure, and chaining.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use ferry_core::context::{AppContext, EngineSettings};
use ferry_core::error::EngineError;
use ferry_core::group;
use ferry_db::models::{
    Direction, ExistenceCheck, FieldMapping, PostUpdateMapping, TaskKind, TransferMode,
    ValidationRules,
};
use ferry_db::queries::tasks::{self as task_db, TaskDefinition};
use ferry_db::server::ServerPools;
use ferry_test_utils::{create_scratch_db, create_test_db, drop_test_db};

struct TestHarness {
    ctx: Arc<AppContext>,
    source: PgPool,
    target: PgPool,
    store_db: String,
    source_db: String,
    target_db: String,
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
            target,
            store_db,
            source_db,
            target_db,
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

fn member(name: &str, group: &str, order: i32, dst: &str) -> TaskDefinition {
    TaskDefinition {
        name: name.to_owned(),
        kind: TaskKind::Both,
        direction: Direction::Internal,
        mode: TransferMode::Normal,
        active: true,
        query: "SELECT id FROM src_orders".to_owned(),
        parameters: Vec::new(),
        clear_before_insert: false,
        field_mapping: None,
        target_table: Some(dst.to_owned()),
        validation_rules: Some(ValidationRules {
            required_fields: vec!["id".to_owned()],
            existence_check: Some(ExistenceCheck {
                table: dst.to_owned(),
                key: "id".to_owned(),
            }),
        }),
        post_update_query: None,
        post_update_mapping: None,
        linked_group: Some(group.to_owned()),
        linked_execution_order: order,
        linked_tasks: Vec::new(),
        is_coordinator: false,
        next_tasks: Vec::new(),
        bonification: None,
    }
}

#[tokio::test]
async fn coordinated_group_runs_in_order_with_single_post_update() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src_orders (id INT, exported INT NOT NULL DEFAULT 0)").await;
    h.exec_source("INSERT INTO src_orders (id) VALUES (1), (2), (3)").await;
    for dst in ["dst_a", "dst_b", "dst_c"] {
        h.exec_source(&format!("CREATE TABLE {dst} (id INT)")).await;
    }

    task_db::upsert_task(&h.ctx.store, &member("g-a", "nightly", 0, "dst_a")).await.unwrap();
    task_db::upsert_task(&h.ctx.store, &member("g-b", "nightly", 1, "dst_b")).await.unwrap();
    let mut coordinator = member("g-c", "nightly", 2, "dst_c");
    coordinator.post_update_query =
        Some("UPDATE src_orders SET exported = exported + 1 WHERE id IN ($ids)".to_owned());
    coordinator.post_update_mapping = Some(PostUpdateMapping {
        view_key: "id".to_owned(),
        table_key: "id".to_owned(),
    });
    coordinator.is_coordinator = true;
    task_db::upsert_task(&h.ctx.store, &coordinator).await.unwrap();

    let entry = task_db::get_task_by_name(&h.ctx.store, "g-a").await.unwrap().unwrap();
    let plan = group::resolve_group(&h.ctx.store, &entry).await.unwrap();
    let names: Vec<&str> = plan.members.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["g-a", "g-b", "g-c"]);
    assert!(matches!(plan.kind, group::GroupKind::Coordinated { .. }));

    let report = group::run_group(&h.ctx, &plan, false, None, &CancellationToken::new())
        .await
        .expect("group should succeed");
    assert_eq!(report.reports.len(), 3);

    // Every member wrote its destination.
    for dst in ["dst_a", "dst_b", "dst_c"] {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {dst}"))
            .fetch_one(&h.source)
            .await
            .unwrap();
        assert_eq!(count, 3, "{dst} should have 3 rows");
    }

    // Post-update ran exactly once: exported is 1, not 3.
    let (max_exported,): (Option<i32>,) =
        sqlx::query_as("SELECT MAX(exported) FROM src_orders")
            .fetch_one(&h.source)
            .await
            .unwrap();
    assert_eq!(max_exported, Some(1));
    assert_eq!(report.post_update_rows, 3);

    h.teardown().await;
}

#[tokio::test]
async fn group_without_coordinator_is_invalid() {
    let h = TestHarness::new().await;

    task_db::upsert_task(&h.ctx.store, &member("nc-a", "broken", 0, "dst_a")).await.unwrap();
    task_db::upsert_task(&h.ctx.store, &member("nc-b", "broken", 1, "dst_b")).await.unwrap();

    let entry = task_db::get_task_by_name(&h.ctx.store, "nc-a").await.unwrap().unwrap();
    let err = group::resolve_group(&h.ctx.store, &entry).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));

    h.teardown().await;
}

#[tokio::test]
async fn group_with_two_coordinators_is_invalid() {
    let h = TestHarness::new().await;

    let mut a = member("tc-a", "twice", 0, "dst_a");
    a.post_update_query = Some("UPDATE x SET y = 1 WHERE id IN ($ids)".to_owned());
    let mut b = member("tc-b", "twice", 1, "dst_b");
    b.post_update_query = Some("UPDATE x SET y = 2 WHERE id IN ($ids)".to_owned());
    task_db::upsert_task(&h.ctx.store, &a).await.unwrap();
    task_db::upsert_task(&h.ctx.store, &b).await.unwrap();

    let entry = task_db::get_task_by_name(&h.ctx.store, "tc-a").await.unwrap().unwrap();
    let err = group::resolve_group(&h.ctx.store, &entry).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));

    h.teardown().await;
}

#[tokio::test]
async fn member_failure_aborts_group_and_skips_post_update() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src_orders (id INT, exported INT NOT NULL DEFAULT 0)").await;
    h.exec_source("INSERT INTO src_orders (id) VALUES (1), (2)").await;
    h.exec_source("CREATE TABLE dst_a (id INT)").await;
    h.exec_source("CREATE TABLE dst_c (id INT)").await;

    task_db::upsert_task(&h.ctx.store, &member("pf-a", "partial", 0, "dst_a")).await.unwrap();
    // dst_b does not exist: this member fails at write.
    task_db::upsert_task(&h.ctx.store, &member("pf-b", "partial", 1, "dst_b")).await.unwrap();
    let mut coordinator = member("pf-c", "partial", 2, "dst_c");
    coordinator.post_update_query =
        Some("UPDATE src_orders SET exported = 1 WHERE id IN ($ids)".to_owned());
    task_db::upsert_task(&h.ctx.store, &coordinator).await.unwrap();

    let entry = task_db::get_task_by_name(&h.ctx.store, "pf-a").await.unwrap().unwrap();
    let plan = group::resolve_group(&h.ctx.store, &entry).await.unwrap();

    let err = group::run_group(&h.ctx, &plan, false, None, &CancellationToken::new())
        .await
        .expect_err("group must report the failure");
    match err {
        EngineError::GroupPartiallyFailed {
            group,
            failed_member,
            committed,
        } => {
            assert_eq!(group, "partial");
            assert_eq!(failed_member, "pf-b");
            assert_eq!(committed.len(), 1);
        }
        other => panic!("expected GroupPartiallyFailed, got {other}"),
    }

    // The first member's write is committed; the coordinator never ran.
    let (count_a,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dst_a")
        .fetch_one(&h.source)
        .await
        .unwrap();
    assert_eq!(count_a, 2);
    let (count_c,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dst_c")
        .fetch_one(&h.source)
        .await
        .unwrap();
    assert_eq!(count_c, 0);
    let (exported,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM src_orders WHERE exported = 1")
        .fetch_one(&h.source)
        .await
        .unwrap();
    assert_eq!(exported, 0);

    h.teardown().await;
}

#[tokio::test]
async fn chained_task_runs_after_parent() {
    let h = TestHarness::new().await;
    h.exec_source("CREATE TABLE src (id TEXT)").await;
    h.exec_source("INSERT INTO src VALUES ('k1'), ('k2')").await;
    h.exec_source("CREATE TABLE src_audit (id TEXT)").await;
    h.exec_source("INSERT INTO src_audit VALUES ('a1')").await;

    sqlx::query("CREATE TABLE mirror (id TEXT)").execute(&h.target).await.unwrap();
    sqlx::query("CREATE TABLE audit_mirror (id TEXT)").execute(&h.target).await.unwrap();

    let down = |name: &str, src_table: &str, dst_table: &str| TaskDefinition {
        name: name.to_owned(),
        kind: TaskKind::Manual,
        direction: Direction::Down,
        mode: TransferMode::Normal,
        active: true,
        query: format!("SELECT id FROM {src_table}"),
        parameters: Vec::new(),
        clear_before_insert: false,
        field_mapping: Some(FieldMapping {
            source_table: src_table.to_owned(),
            target_table: dst_table.to_owned(),
            source_fields: vec!["id".to_owned()],
            target_fields: vec!["id".to_owned()],
            defaults: Vec::new(),
        }),
        target_table: None,
        validation_rules: None,
        post_update_query: None,
        post_update_mapping: None,
        linked_group: None,
        linked_execution_order: 0,
        linked_tasks: Vec::new(),
        is_coordinator: false,
        next_tasks: Vec::new(),
        bonification: None,
    };

    let child = task_db::upsert_task(&h.ctx.store, &down("chain-child", "src_audit", "audit_mirror"))
        .await
        .unwrap();
    let mut parent_def = down("chain-parent", "src", "mirror");
    parent_def.next_tasks = vec![child.id];
    let parent = task_db::upsert_task(&h.ctx.store, &parent_def).await.unwrap();

    let plan = group::resolve_group(&h.ctx.store, &parent).await.unwrap();
    let report = group::run_group(&h.ctx, &plan, false, None, &CancellationToken::new())
        .await
        .expect("chain should run");

    // Parent plus chained child.
    assert_eq!(report.reports.len(), 2);

    let (mirror_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mirror")
        .fetch_one(&h.target)
        .await
        .unwrap();
    assert_eq!(mirror_count, 2);
    let (audit_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_mirror")
        .fetch_one(&h.target)
        .await
        .unwrap();
    assert_eq!(audit_count, 1);

    h.teardown().await;
}
