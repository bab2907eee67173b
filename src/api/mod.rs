// Admin REST endpoints for schedules, executions and the scheduler itself.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use surrealdb::RecordId;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db::{
    ExecutionFilter, ExecutionStatus, ExecutionStore, ScheduleCreate, ScheduleStore,
    ScheduleUpdate, MAX_INTERVAL_SECONDS,
};
use crate::scheduler::Scheduler;

pub type AppState = Arc<Scheduler>;

const DEFAULT_METRICS_LIMIT: usize = 20;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(e) => {
                error!(error = %e, "admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/{id}",
            get(get_schedule).patch(update_schedule).delete(delete_schedule),
        )
        .route("/executions", get(list_executions))
        .route("/scheduler/run-now", post(run_now))
        .route("/scheduler/metrics", get(scheduler_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn schedule_id(key: &str) -> Result<RecordId, ApiError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest("schedule id must not be empty".to_string()));
    }
    Ok(RecordId::from_table_key("schedule", key))
}

fn check_plugin_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("plugin_name must not be empty".to_string()));
    }
    Ok(())
}

fn check_interval(interval_seconds: i64) -> Result<(), ApiError> {
    if !(1..=MAX_INTERVAL_SECONDS).contains(&interval_seconds) {
        return Err(ApiError::BadRequest(format!(
            "interval_seconds must be between 1 and {}",
            MAX_INTERVAL_SECONDS
        )));
    }
    Ok(())
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult {
    let schedules = ScheduleStore::list(state.db()).await?;
    Ok(Json(json!({
        "schedules": schedules,
        "count": schedules.len(),
    })))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(payload): Json<ScheduleCreate>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_plugin_name(&payload.plugin_name)?;
    check_interval(payload.interval_seconds)?;

    let schedule = ScheduleStore::create(state.db(), &payload).await?;
    Ok((StatusCode::CREATED, Json(json!(schedule))))
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let record_id = schedule_id(&id)?;
    match ScheduleStore::get(state.db(), &record_id).await? {
        Some(schedule) => Ok(Json(json!(schedule))),
        None => Err(ApiError::NotFound(format!("schedule {} not found", id))),
    }
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ScheduleUpdate>,
) -> ApiResult {
    let record_id = schedule_id(&id)?;
    if let Some(name) = &payload.plugin_name {
        check_plugin_name(name)?;
    }
    if let Some(interval) = payload.interval_seconds {
        check_interval(interval)?;
    }

    match ScheduleStore::update(state.db(), &record_id, &payload).await? {
        Some(schedule) => Ok(Json(json!(schedule))),
        None => Err(ApiError::NotFound(format!("schedule {} not found", id))),
    }
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let record_id = schedule_id(&id)?;
    if ScheduleStore::delete(state.db(), &record_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("schedule {} not found", id)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionQuery {
    schedule_id: Option<String>,
    plugin_name: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<ExecutionStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    let filter = ExecutionFilter {
        schedule_id: query.schedule_id.as_deref().map(schedule_id).transpose()?,
        plugin_name: query.plugin_name,
        status,
        limit: query.limit,
    };

    let executions = ExecutionStore::list(state.db(), &filter).await?;
    Ok(Json(json!({
        "executions": executions,
        "count": executions.len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct RunNowRequest {
    fallback_user_id: Option<String>,
}

/// Manual trigger: enqueue and run once. The body is optional.
async fn run_now(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: RunNowRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunNowRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let summary = state.run_now(request.fallback_user_id.as_deref()).await?;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    limit: Option<usize>,
}

async fn scheduler_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult {
    let ticks = state
        .metrics()
        .recent(query.limit.unwrap_or(DEFAULT_METRICS_LIMIT))
        .await;
    Ok(Json(json!({
        "enabled": state.config().enabled,
        "interval_seconds": state.config().interval_seconds,
        "ticks": ticks,
        "count": ticks.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig, Db};
    use crate::executor::{ExecutionRequest, ExecutorError, PluginExecutor};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn setup_test_db() -> Db {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    struct EchoExecutor;

    #[async_trait]
    impl PluginExecutor for EchoExecutor {
        async fn execute(&self, request: ExecutionRequest) -> Result<Value, ExecutorError> {
            Ok(json!({ "user": request.user_id }))
        }
    }

    async fn app() -> (Router, AppState) {
        let db = setup_test_db().await;
        let config = SchedulerConfig {
            enabled: true,
            interval_seconds: 30,
            batch_limit: 10,
            stale_timeout_seconds: 900,
            concurrency: 2,
            claim_lease_seconds: 60,
            metrics_capacity: 10,
            agent_key: None,
        };
        let state = Arc::new(Scheduler::new(db, Arc::new(EchoExecutor), config).unwrap());
        (create_admin_router(state.clone()), state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_schedule_crud() {
        let (app, _) = app().await;

        let (status, created) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({ "plugin_name": "rss", "interval_seconds": 300, "params": { "feed": "x" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["enabled"], true);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&app, "GET", &format!("/schedules/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["plugin_name"], "rss");
        assert_eq!(fetched["params"]["feed"], "x");

        let (status, updated) = send(
            &app,
            "PATCH",
            &format!("/schedules/{}", id),
            Some(json!({ "enabled": false, "owner_user_id": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["enabled"], false);
        assert_eq!(updated["owner_user_id"], "bob");
        assert_eq!(updated["interval_seconds"], 300);

        let (_, listed) = send(&app, "GET", "/schedules", None).await;
        assert_eq!(listed["count"], 1);

        let (status, _) = send(&app, "DELETE", &format!("/schedules/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/schedules/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &format!("/schedules/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validation_and_missing_ids() {
        let (app, _) = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({ "plugin_name": "rss", "interval_seconds": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("interval_seconds"));

        let (status, _) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({ "plugin_name": "rss", "interval_seconds": i64::MAX })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "PATCH",
            "/schedules/nope",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/executions?status=exploded", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_now_and_executions_listing() {
        let (app, state) = app().await;
        let (_, created) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({ "plugin_name": "rss", "interval_seconds": 300 })),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, summary) = send(
            &app,
            "POST",
            "/scheduler/run-now",
            Some(json!({ "fallback_user_id": "admin" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["enqueue"]["enqueued"], 1);
        assert_eq!(summary["run"]["succeeded"], 1);

        let (status, listed) = send(
            &app,
            "GET",
            &format!("/executions?schedule_id={}&status=completed", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["count"], 1);
        let execution = &listed["executions"][0];
        assert_eq!(execution["schedule_id"], id.as_str());
        assert_eq!(execution["user_id"], "admin");
        assert_eq!(execution["status"], "COMPLETED");

        // Empty body is accepted; nothing is due now.
        let (status, summary) = send(&app, "POST", "/scheduler/run-now", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["enqueue"]["enqueued"], 0);

        // run-now does not feed the metrics ring; ticks do.
        let (_, metrics) = send(&app, "GET", "/scheduler/metrics", None).await;
        assert_eq!(metrics["count"], 0);
        state.tick().await.unwrap();
        state.tick().await.unwrap();
        let (_, metrics) = send(&app, "GET", "/scheduler/metrics?limit=1", None).await;
        assert_eq!(metrics["count"], 1);
        assert_eq!(metrics["ticks"][0]["run"]["attempted"], 0);
    }
}
