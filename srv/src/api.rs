use axum::Extension;
use axum::Json;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use parquedb_lakehouse::compaction::{
    CompactionConfig, CompactionCoordinator, CompactionStatus, FileArrival, WindowReadyEntry,
    WorkflowCompleteResult,
};
use parquedb_lakehouse::mv_refresh::{MvRefreshCoordinator, MvRegistration, ReadyMv};
use parquedb_lakehouse::notifications::{ObjectNotification, file_arrival_from_notification};
use parquedb_shard::engine::{ShardEngine, WriteOptions};
use parquedb_shard::relationships::Direction;
use parquedb_streaming::StreamingMvEngine;
use parquedb_types::error::CoreError;
use parquedb_types::mutation::Mutation;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ShardEngine>,
    pub streaming: Arc<StreamingMvEngine>,
    pub mv_refresh: Arc<MvRefreshCoordinator>,
    pub coordinator_pool: SqlitePool,
}

/// Maps the error taxonomy onto stable status codes at the boundary.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({"error": self.0.to_string()})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn write_options(actor: Option<String>, expected_version: Option<i64>) -> WriteOptions {
    WriteOptions {
        actor,
        expected_version,
        deadline: None,
    }
}

// ---- shard ----

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub ns: String,
    pub body: serde_json::Value,
    pub actor: Option<String>,
}

pub async fn create(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<serde_json::Value> {
    let entity = state
        .engine
        .create(&request.ns, &request.body, &write_options(request.actor, None))
        .await?;
    Ok(Json(entity.to_json()))
}

#[derive(Debug, Deserialize)]
pub struct CreateManyRequest {
    pub ns: String,
    pub bodies: Vec<serde_json::Value>,
    pub actor: Option<String>,
}

pub async fn create_many(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateManyRequest>,
) -> ApiResult<Vec<serde_json::Value>> {
    let entities = state
        .engine
        .create_many(&request.ns, &request.bodies, &write_options(request.actor, None))
        .await?;
    Ok(Json(entities.iter().map(|e| e.to_json()).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    pub ns: String,
    pub id: String,
    #[serde(default)]
    pub include_deleted: bool,
}

pub async fn get_entity(
    Extension(state): Extension<AppState>,
    Json(request): Json<GetRequest>,
) -> ApiResult<serde_json::Value> {
    let entity = state
        .engine
        .get(&request.ns, &request.id, request.include_deleted)
        .await?;
    Ok(Json(match entity {
        Some(entity) => entity.to_json(),
        None => serde_json::Value::Null,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub ns: String,
    pub id: String,
    pub mutation: serde_json::Value,
    pub actor: Option<String>,
    pub expected_version: Option<i64>,
}

pub async fn update(
    Extension(state): Extension<AppState>,
    Json(request): Json<UpdateRequest>,
) -> ApiResult<serde_json::Value> {
    let mutation = Mutation::from_json(&request.mutation)?;
    let entity = state
        .engine
        .update(
            &request.ns,
            &request.id,
            &mutation,
            &write_options(request.actor, request.expected_version),
        )
        .await?;
    Ok(Json(entity.to_json()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub ns: String,
    pub id: String,
    pub actor: Option<String>,
    pub expected_version: Option<i64>,
}

pub async fn delete(
    Extension(state): Extension<AppState>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult<serde_json::Value> {
    let deleted = state
        .engine
        .delete(
            &request.ns,
            &request.id,
            &write_options(request.actor, request.expected_version),
        )
        .await?;
    Ok(Json(serde_json::json!({"deleted": deleted})))
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub from: String,
    pub predicate: String,
    pub to: String,
    pub actor: Option<String>,
}

pub async fn link(
    Extension(state): Extension<AppState>,
    Json(request): Json<LinkRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .engine
        .link(
            &request.from,
            &request.predicate,
            &request.to,
            &write_options(request.actor, None),
        )
        .await?;
    Ok(Json(serde_json::json!({"linked": true})))
}

pub async fn unlink(
    Extension(state): Extension<AppState>,
    Json(request): Json<LinkRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .engine
        .unlink(
            &request.from,
            &request.predicate,
            &request.to,
            &write_options(request.actor, None),
        )
        .await?;
    Ok(Json(serde_json::json!({"unlinked": true})))
}

#[derive(Debug, Deserialize)]
pub struct GetRelationshipsRequest {
    pub ns: String,
    pub id: String,
    pub predicate: Option<String>,
    pub direction: Option<String>,
}

pub async fn get_relationships(
    Extension(state): Extension<AppState>,
    Json(request): Json<GetRelationshipsRequest>,
) -> ApiResult<Vec<serde_json::Value>> {
    let direction = match request.direction.as_deref() {
        Some(direction) => Direction::parse(direction)
            .map_err(|e| CoreError::Validation(e.to_string()))?,
        None => Direction::Outbound,
    };
    let relationships = state
        .engine
        .get_relationships(&request.ns, &request.id, request.predicate.as_deref(), direction)
        .await?;
    Ok(Json(relationships.iter().map(|r| r.to_json()).collect()))
}

#[derive(Debug, Deserialize)]
pub struct FlushRequest {
    pub ns: Option<String>,
}

pub async fn flush(
    Extension(state): Extension<AppState>,
    Json(request): Json<FlushRequest>,
) -> ApiResult<serde_json::Value> {
    match &request.ns {
        Some(ns) => state.engine.flush_ns_event_batch(ns).await?,
        None => state.engine.flush_all_ns_event_batches().await?,
    }
    Ok(Json(serde_json::json!({"flushed": true})))
}

// ---- compaction coordinator ----

#[derive(Debug, Deserialize)]
pub struct CompactionUpdateRequest {
    pub ns: String,
    pub updates: Vec<FileArrival>,
    pub config: CompactionConfig,
}

pub async fn compaction_update(
    Extension(state): Extension<AppState>,
    Json(request): Json<CompactionUpdateRequest>,
) -> ApiResult<Vec<WindowReadyEntry>> {
    let coordinator = CompactionCoordinator::new(state.coordinator_pool.clone(), &request.ns);
    let ready = coordinator
        .update(&request.updates, &request.config, Utc::now())
        .await?;
    Ok(Json(ready))
}

#[derive(Debug, Deserialize)]
pub struct CompactionNotifyRequest {
    pub notifications: Vec<ObjectNotification>,
    pub prefix: String,
    pub config: CompactionConfig,
}

/// Routes raw arrival notifications to their per-namespace coordinators.
pub async fn compaction_notify(
    Extension(state): Extension<AppState>,
    Json(request): Json<CompactionNotifyRequest>,
) -> ApiResult<Vec<WindowReadyEntry>> {
    let mut by_ns: BTreeMap<String, Vec<FileArrival>> = BTreeMap::new();
    for notification in &request.notifications {
        if let Some((ns, arrival)) = file_arrival_from_notification(notification, &request.prefix)
        {
            by_ns.entry(ns).or_default().push(arrival);
        }
    }
    let now = Utc::now();
    let mut ready = vec![];
    for (ns, updates) in by_ns {
        let coordinator = CompactionCoordinator::new(state.coordinator_pool.clone(), ns);
        ready.extend(coordinator.update(&updates, &request.config, now).await?);
    }
    Ok(Json(ready))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionDispatchRequest {
    pub ns: String,
    pub window_key: String,
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub success: bool,
}

pub async fn compaction_confirm_dispatch(
    Extension(state): Extension<AppState>,
    Json(request): Json<CompactionDispatchRequest>,
) -> ApiResult<serde_json::Value> {
    let workflow_id = request
        .workflow_id
        .ok_or_else(|| CoreError::validation("missing workflowId"))?;
    CompactionCoordinator::new(state.coordinator_pool.clone(), &request.ns)
        .confirm_dispatch(&request.window_key, &workflow_id, Utc::now())
        .await?;
    Ok(Json(serde_json::json!({"dispatched": true})))
}

pub async fn compaction_rollback_processing(
    Extension(state): Extension<AppState>,
    Json(request): Json<CompactionDispatchRequest>,
) -> ApiResult<serde_json::Value> {
    CompactionCoordinator::new(state.coordinator_pool.clone(), &request.ns)
        .rollback_processing(&request.window_key)
        .await?;
    Ok(Json(serde_json::json!({"rolledBack": true})))
}

pub async fn compaction_workflow_complete(
    Extension(state): Extension<AppState>,
    Json(request): Json<CompactionDispatchRequest>,
) -> ApiResult<WorkflowCompleteResult> {
    let workflow_id = request
        .workflow_id
        .ok_or_else(|| CoreError::validation("missing workflowId"))?;
    let result = CompactionCoordinator::new(state.coordinator_pool.clone(), &request.ns)
        .workflow_complete(&request.window_key, &workflow_id, request.success)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct CompactionStatusQuery {
    pub ns: String,
}

pub async fn compaction_status(
    Extension(state): Extension<AppState>,
    Query(query): Query<CompactionStatusQuery>,
) -> ApiResult<CompactionStatus> {
    let status = CompactionCoordinator::new(state.coordinator_pool.clone(), &query.ns)
        .status()
        .await?;
    Ok(Json(status))
}

// ---- mv refresh coordinator ----

pub async fn register_mv(
    Extension(state): Extension<AppState>,
    Json(registration): Json<MvRegistration>,
) -> ApiResult<serde_json::Value> {
    state.mv_refresh.register_mv(&registration).await?;
    Ok(Json(serde_json::json!({"registered": true})))
}

#[derive(Debug, Deserialize)]
pub struct NotifyChangeRequest {
    pub namespace: String,
    pub files: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn notify_change(
    Extension(state): Extension<AppState>,
    Json(request): Json<NotifyChangeRequest>,
) -> ApiResult<serde_json::Value> {
    let now = Utc::now();
    state
        .mv_refresh
        .notify_change(
            &request.namespace,
            &request.files,
            request.timestamp.unwrap_or(now),
            now,
        )
        .await?;
    Ok(Json(serde_json::json!({"recorded": true})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetReadyMvsRequest {
    pub debounce_ms: i64,
    pub max_wait_ms: i64,
}

pub async fn get_ready_mvs(
    Extension(state): Extension<AppState>,
    Json(request): Json<GetReadyMvsRequest>,
) -> ApiResult<Vec<ReadyMv>> {
    let ready = state
        .mv_refresh
        .get_ready_mvs(request.debounce_ms, request.max_wait_ms, Utc::now())
        .await?;
    Ok(Json(ready))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MvDispatchRequest {
    pub name: String,
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub success: bool,
}

pub async fn mv_confirm_dispatch(
    Extension(state): Extension<AppState>,
    Json(request): Json<MvDispatchRequest>,
) -> ApiResult<serde_json::Value> {
    let workflow_id = request
        .workflow_id
        .ok_or_else(|| CoreError::validation("missing workflowId"))?;
    state
        .mv_refresh
        .confirm_dispatch(&request.name, &workflow_id, Utc::now())
        .await?;
    Ok(Json(serde_json::json!({"dispatched": true})))
}

pub async fn mv_rollback_processing(
    Extension(state): Extension<AppState>,
    Json(request): Json<MvDispatchRequest>,
) -> ApiResult<serde_json::Value> {
    state.mv_refresh.rollback_processing(&request.name).await?;
    Ok(Json(serde_json::json!({"rolledBack": true})))
}

pub async fn mv_workflow_complete(
    Extension(state): Extension<AppState>,
    Json(request): Json<MvDispatchRequest>,
) -> ApiResult<WorkflowCompleteResult> {
    let workflow_id = request
        .workflow_id
        .ok_or_else(|| CoreError::validation("missing workflowId"))?;
    let result = state
        .mv_refresh
        .workflow_complete(&request.name, &workflow_id, request.success)
        .await?;
    Ok(Json(result))
}

pub async fn status(Extension(state): Extension<AppState>) -> ApiResult<serde_json::Value> {
    let refresh = state.mv_refresh.status().await?;
    let streaming = state.streaming.stats().await;
    Ok(Json(serde_json::json!({
        "mvRefresh": refresh,
        "streaming": streaming,
    })))
}
