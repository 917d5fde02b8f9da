//! Orchestrator HTTP API.
//!
//! Operations CRUD plus the lifecycle endpoints (`execute`, `retry`,
//! `status`, `summary`) and the saved source/destination registry.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::executor::Executor;
use crate::operation::NewOperation;
use crate::store::{NewRegistryEntry, OperationStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn OperationStore>,
    pub executor: Executor,
}

pub fn router(store: Arc<dyn OperationStore>, executor: Executor) -> Router {
    Router::new()
        .route("/operations", post(create_operation).get(list_operations))
        .route("/operations/summary", get(summary))
        .route(
            "/operations/:id",
            get(get_operation).delete(delete_operation),
        )
        .route("/operations/:id/execute", post(execute_operation))
        .route("/operations/:id/retry", post(retry_operation))
        .route("/operations/:id/status", get(operation_status))
        .route("/registry", post(create_registry).get(list_registry))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { store, executor })
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::NotFound => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::WorkerUnavailable(_) | OrchestratorError::WorkerTransport(_) => {
                StatusCode::BAD_GATEWAY
            }
            OrchestratorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn create_operation(
    State(state): State<ApiState>,
    Json(new): Json<NewOperation>,
) -> Result<impl IntoResponse, OrchestratorError> {
    // Same-kind configs are rejected here: no operation row is created.
    new.config.validate()?;
    let operation = state.store.create(new).await?;
    Ok((StatusCode::CREATED, Json(operation)))
}

#[derive(Deserialize)]
struct ListParams {
    owner_id: Option<String>,
}

async fn list_operations(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let operations = state.store.list(params.owner_id.as_deref()).await?;
    Ok(Json(operations))
}

async fn get_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let operation = state
        .store
        .get(id)
        .await?
        .ok_or(OrchestratorError::NotFound)?;
    Ok(Json(operation))
}

async fn delete_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    state.executor.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExecuteParams {
    #[serde(default)]
    force: bool,
}

async fn execute_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ExecuteParams>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let operation = state.executor.execute(id, params.force).await?;
    Ok(Json(operation))
}

async fn retry_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let operation = state.executor.retry(id).await?;
    Ok(Json(operation))
}

async fn operation_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let operation = state
        .store
        .get(id)
        .await?
        .ok_or(OrchestratorError::NotFound)?;
    Ok(Json(operation.status_view()))
}

#[derive(Deserialize)]
struct SummaryParams {
    owner_id: String,
    #[serde(default = "default_recent")]
    recent: usize,
}

fn default_recent() -> usize {
    10
}

async fn summary(
    State(state): State<ApiState>,
    Query(params): Query<SummaryParams>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let summary = state.store.summary(&params.owner_id, params.recent).await?;
    Ok(Json(summary))
}

async fn create_registry(
    State(state): State<ApiState>,
    Json(new): Json<NewRegistryEntry>,
) -> Result<impl IntoResponse, OrchestratorError> {
    if new.kind != "source" && new.kind != "destination" {
        return Err(OrchestratorError::Validation(
            "kind must be 'source' or 'destination'".to_string(),
        ));
    }
    let entry = state.store.create_registry_entry(new).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_registry(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let entries = state.store.list_registry().await?;
    Ok(Json(entries))
}
