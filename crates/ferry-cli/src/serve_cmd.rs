//! `ferry serve`: HTTP API over the task service, with per-task SSE
//! progress streams.
//!
//! Exit codes: 3 when the control store is unreachable at startup, 4 on
//! a server runtime failure.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use ferry_core::definition::{TaskBody, TaskToml};
use ferry_core::error::EngineError;
use ferry_core::progress::TaskEvent;
use ferry_core::service::{CallerIdentity, TaskService};

use crate::config::FerryConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::AlreadyRunning(_)
            | EngineError::GlobalBusy
            | EngineError::NotManual(_) => StatusCode::CONFLICT,
            EngineError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message, "code": self.code });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

type AppState = Arc<TaskService>;

pub fn build_router(service: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks).post(upsert_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/execute", post(execute_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/history", get(task_history))
        .route("/api/tasks/{id}/linking", get(task_linking))
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/schedule", get(get_schedule).put(set_schedule))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

pub async fn run_serve(resolved: &FerryConfig, bind: &str, port: u16) {
    let ctx = match crate::build_context(resolved).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("database unavailable: {e:#}");
            std::process::exit(3);
        }
    };
    let service = Arc::new(TaskService::new(ctx));
    let app = build_router(service);

    let addr: SocketAddr = match format!("{bind}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid bind address {bind}:{port}: {e}");
            std::process::exit(1);
        }
    };

    println!("ferry API listening on http://{addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(4);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("server failed: {e}");
        std::process::exit(4);
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    println!("\nShutting down.");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Caller identity from the `x-ferry-caller` header; the core treats it
/// as opaque.
fn caller_from(headers: &HeaderMap) -> CallerIdentity {
    let raw = headers
        .get("x-ferry-caller")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    CallerIdentity(format!("http:{raw}"))
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "ferry",
        "endpoints": [
            "GET /api/tasks",
            "POST /api/tasks",
            "GET /api/tasks/{id}",
            "DELETE /api/tasks/{id}",
            "POST /api/tasks/{id}/execute",
            "POST /api/tasks/{id}/cancel",
            "GET /api/tasks/{id}/history",
            "GET /api/tasks/{id}/linking",
            "GET /api/tasks/{id}/events",
            "GET /api/schedule",
            "PUT /api/schedule",
        ],
    }))
}

async fn list_tasks(
    State(service): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let tasks = service.list_tasks(&caller_from(&headers)).await?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

async fn get_task(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = service.get_task(&caller_from(&headers), id).await?;
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn upsert_task(
    State(service): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let def = TaskToml { task: body }
        .into_definition(&service.context().store)
        .await?;
    let task = service.upsert_task(&caller_from(&headers), def).await?;
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn delete_task(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.delete_task(&caller_from(&headers), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_task(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let handle = service.execute(&caller_from(&headers), id, None).await?;
    Ok(Json(serde_json::json!({
        "task_id": handle.task_id,
        "events": format!("/api/tasks/{}/events", handle.task_id),
    })))
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(default)]
    force: bool,
    reason: Option<String>,
}

async fn cancel_task(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(params): Query<CancelParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    service
        .cancel(
            &caller_from(&headers),
            id,
            params.force,
            params.reason.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "task_id": id,
        "events": format!("/api/tasks/{id}/events"),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

async fn task_history(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let rows = service
        .history(&caller_from(&headers), id, params.limit)
        .await?;
    Ok(Json(serde_json::json!({ "executions": rows })))
}

async fn task_linking(
    State(service): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let info = service.linking_info(&caller_from(&headers), id).await?;
    Ok(Json(serde_json::json!({ "linking": info })))
}

/// Per-task SSE stream of progress/status events.
///
/// Late subscribers receive the retained latest event first; the stream
/// ends after a terminal status.
async fn task_events(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = service.subscribe(id);
    let stream = subscription.into_stream().map(|event| {
        let kind = match &event {
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Status { .. } => "status",
            TaskEvent::Connected { .. } => "connected",
            TaskEvent::Error { .. } => "error",
            TaskEvent::ReconnectFailed { .. } => "reconnect_failed",
        };
        let event = Event::default()
            .event(kind)
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"));
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_schedule(
    State(service): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = service.get_schedule(&caller_from(&headers)).await?;
    Ok(Json(serde_json::json!({ "schedule": row })))
}

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    hour: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn set_schedule(
    State(service): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = service
        .set_schedule(&caller_from(&headers), &body.hour, body.enabled)
        .await?;
    Ok(Json(serde_json::json!({ "schedule": row })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use ferry_core::context::{AppContext, EngineSettings};
    use ferry_db::config::TransferConfig;
    use ferry_db::server::ServerPools;
    use ferry_test_utils::{create_test_db, drop_test_db};

    /// Service over a real control store and lazy (never-connected)
    /// data-plane pools -- enough for the definition/schedule surface.
    async fn test_service() -> (AppState, String) {
        let (store, db_name) = create_test_db().await;
        let transfer = TransferConfig::new(
            "postgresql://localhost:9/unused-source",
            "postgresql://localhost:9/unused-target",
        );
        let servers = ServerPools::connect(&transfer).expect("lazy pools");
        let ctx = AppContext::new(store, servers, EngineSettings::default());
        (Arc::new(TaskService::new(ctx)), db_name)
    }

    async fn send_request(service: AppState, request: Request<Body>) -> axum::response::Response {
        build_router(service)
            .oneshot(request)
            .await
            .expect("request should not fail")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (service, db_name) = test_service().await;
        let response = send_request(
            service,
            Request::get("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "ferry");
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn list_tasks_empty() {
        let (service, db_name) = test_service().await;
        let response = send_request(
            service,
            Request::get("/api/tasks").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tasks"], serde_json::json!([]));
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let (service, db_name) = test_service().await;
        let response = send_request(
            service,
            Request::get(format!("/api/tasks/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["code"], "NOT_FOUND");
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn upsert_then_list() {
        let (service, db_name) = test_service().await;

        let body = serde_json::json!({
            "name": "sync-clients",
            "kind": "manual",
            "direction": "up",
            "query": "SELECT id, name FROM src WHERE active = 1",
            "target_table": "clients_mirror",
        });
        let response = send_request(
            Arc::clone(&service),
            Request::post("/api/tasks")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["task"]["name"], "sync-clients");

        let response = send_request(
            service,
            Request::get("/api/tasks").body(Body::empty()).unwrap(),
        )
        .await;
        let json = body_json(response).await;
        assert_eq!(json["tasks"].as_array().unwrap().len(), 1);

        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn invalid_definition_is_422() {
        let (service, db_name) = test_service().await;

        // Down transfer without a field mapping.
        let body = serde_json::json!({
            "name": "bad-task",
            "kind": "manual",
            "direction": "down",
            "query": "SELECT 1",
        });
        let response = send_request(
            service,
            Request::post("/api/tasks")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["code"], "INVALID_CONFIG");

        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn schedule_roundtrip() {
        let (service, db_name) = test_service().await;

        let response = send_request(
            Arc::clone(&service),
            Request::put("/api/schedule")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"hour": "04:15"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send_request(
            service,
            Request::get("/api/schedule").body(Body::empty()).unwrap(),
        )
        .await;
        let json = body_json(response).await;
        assert_eq!(json["schedule"]["hour"], "04:15");
        assert_eq!(json["schedule"]["enabled"], true);

        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn invalid_schedule_hour_is_422() {
        let (service, db_name) = test_service().await;

        let response = send_request(
            service,
            Request::put("/api/schedule")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"hour": "25:00"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        drop_test_db(&db_name).await;
    }
}
