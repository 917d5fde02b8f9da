//! HTTP surface of the migration worker.
//!
//! Stateless by design: every `/migrate` request builds a fresh pipeline
//! engine run over adapters created for that request, so concurrent
//! migrations share nothing but the read-only adapter catalog.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use unimigrate::protocol::{
    ConnectionKind, HealthResponse, MigrateRequest, OperationType, TestConnectionRequest,
    TestConnectionResponse,
};
use unimigrate::{AdapterCatalog, MigrationResult, PipelineEngine};

/// Shared state: the adapter catalog, populated at startup and read-only
/// thereafter.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<AdapterCatalog>,
}

pub fn router(catalog: Arc<AdapterCatalog>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/migrate", post(migrate))
        .route("/test-connection", post(test_connection))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { catalog })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        sources: state.catalog.source_keys(),
        destinations: state.catalog.destination_keys(),
    })
}

async fn migrate(
    State(state): State<AppState>,
    Json(request): Json<MigrateRequest>,
) -> (StatusCode, Json<MigrationResult>) {
    // Malformed requests are rejected before any adapter work.
    if request.source_type == request.dest_type {
        return (
            StatusCode::BAD_REQUEST,
            Json(MigrationResult::aborted(format!(
                "Cannot migrate from {} to {}: source and destination cannot be the same",
                request.source_type, request.dest_type
            ))),
        );
    }
    if request.operation_type == OperationType::Incremental && request.last_sync_time.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(MigrationResult::aborted(
                "last_sync_time is required for incremental migration".to_string(),
            )),
        );
    }
    if !state
        .catalog
        .source_keys()
        .contains(&request.source_type)
        || !state.catalog.destination_keys().contains(&request.dest_type)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(MigrationResult::aborted(format!(
                "Unsupported combination: {} -> {}",
                request.source_type, request.dest_type
            ))),
        );
    }

    info!(
        "Starting migration: {} -> {} ({})",
        request.source_type, request.dest_type, request.operation_type
    );
    let engine = PipelineEngine::new(Arc::clone(&state.catalog));
    let result = engine.run(request).await;

    info!(
        "Migration completed. Success: {}, total tables: {}, migrated: {}, failed: {}",
        result.success,
        result.total_tables,
        result.tables_migrated.len(),
        result.tables_failed.len()
    );
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result))
}

async fn test_connection(
    State(state): State<AppState>,
    Json(request): Json<TestConnectionRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = match request.kind {
        ConnectionKind::Source => match state.catalog.create_source(&request.adapter_type) {
            Ok(adapter) => adapter.test_connection(&request.config).await,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "success": false, "error": e.to_string() })),
                )
            }
        },
        ConnectionKind::Destination => {
            match state.catalog.create_destination(&request.adapter_type) {
                Ok(adapter) => adapter.test_connection(&request.config).await,
                Err(e) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "success": false, "error": e.to_string() })),
                    )
                }
            }
        }
    };

    let response = match result {
        Ok(()) => TestConnectionResponse {
            success: true,
            error: None,
        },
        Err(e) => {
            error!("Connection test failed for {}: {}", request.adapter_type, e);
            TestConnectionResponse {
                success: false,
                error: Some(e.to_string()),
            }
        }
    };
    (
        StatusCode::OK,
        Json(serde_json::to_value(response).unwrap_or_else(|_| json!({ "success": false }))),
    )
}
