//! Executor lifecycle tests against an in-memory store and a stub worker
//! served from a local listener.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use unimigrate::protocol::OperationType;
use unimigrate_orchestrator::operation::{NewOperation, OperationConfig};
use unimigrate_orchestrator::store::OperationStore;
use unimigrate_orchestrator::{
    Executor, MemoryOperationStore, OperationStatus, OrchestratorError, Scheduler,
    WorkerSupervisor,
};

/// Serve a stub worker returning the given `/migrate` body and status.
async fn stub_worker(migrate_status: u16, migrate_body: serde_json::Value) -> String {
    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({"status": "healthy"})) }),
        )
        .route(
            "/migrate",
            post(move || {
                let body = migrate_body.clone();
                async move {
                    (
                        axum::http::StatusCode::from_u16(migrate_status).unwrap(),
                        Json(body),
                    )
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn success_body() -> serde_json::Value {
    json!({
        "success": true,
        "tables_migrated": [{"table": "users", "records": 3}],
        "tables_failed": [],
        "total_tables": 1,
        "total_records": 3,
        "errors": []
    })
}

fn failure_body() -> serde_json::Value {
    json!({
        "success": false,
        "tables_migrated": [],
        "tables_failed": [{"table": "users", "error": "batch write error"}],
        "total_tables": 1,
        "total_records": 0,
        "errors": ["users: batch write error"]
    })
}

fn executor_for(store: &Arc<MemoryOperationStore>, base_url: &str) -> Executor {
    let supervisor = Arc::new(WorkerSupervisor::new(
        format!("{}/health", base_url),
        None,
        Duration::from_secs(5),
    ));
    Executor::new(
        Arc::clone(store) as Arc<dyn OperationStore>,
        supervisor,
        format!("{}/migrate", base_url),
        Duration::from_secs(30),
    )
}

fn new_operation(operation_type: OperationType) -> NewOperation {
    NewOperation {
        owner_id: "u1".into(),
        source_registry_id: None,
        scheduled_at: Utc::now() - ChronoDuration::seconds(1),
        operation_type,
        config: OperationConfig {
            source_type: "postgresql".into(),
            dest_type: "clickhouse".into(),
            source: json!({"host": "src"}),
            destination: json!({"host": "dst"}),
        },
        last_sync_time: None,
    }
}

#[tokio::test]
async fn successful_run_completes_with_result() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    let done = executor.execute(op.id, false).await.unwrap();

    assert_eq!(done.status, OperationStatus::Completed);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    let result = done.result.unwrap();
    assert!(result.success);
    assert_eq!(result.total_records, 3);
    assert!(done.error_message.is_none());
}

#[tokio::test]
async fn failed_run_records_error_message() {
    // The worker answers HTTP 500 with a result body, like a real
    // aggregated failure.
    let base = stub_worker(500, failure_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    let done = executor.execute(op.id, false).await.unwrap();

    assert_eq!(done.status, OperationStatus::Failed);
    assert!(done
        .error_message
        .as_deref()
        .unwrap()
        .contains("batch write error"));
    // The detailed result is still persisted alongside the failure.
    assert_eq!(done.result.unwrap().tables_failed.len(), 1);
}

#[tokio::test]
async fn unreachable_worker_fails_the_operation() {
    // Nothing listens here and no launch command is configured.
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, "http://127.0.0.1:1");

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    let done = executor.execute(op.id, false).await.unwrap();

    assert_eq!(done.status, OperationStatus::Failed);
    assert!(done.error_message.unwrap().contains("worker"));
}

#[tokio::test]
async fn premature_execute_requires_force() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let mut new = new_operation(OperationType::Full);
    new.scheduled_at = Utc::now() + ChronoDuration::hours(1);
    let op = store.create(new).await.unwrap();

    let err = executor.execute(op.id, false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let done = executor.execute(op.id, true).await.unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
}

#[tokio::test]
async fn running_operation_rejects_execute() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    store
        .transition_to_running(op.id, &[OperationStatus::Pending], Utc::now())
        .await
        .unwrap()
        .unwrap();

    let err = executor.execute(op.id, true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn retry_reruns_failed_and_completed_operations() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    // A pending operation cannot be retried.
    let err = executor.retry(op.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

    let done = executor.execute(op.id, false).await.unwrap();
    assert_eq!(done.status, OperationStatus::Completed);

    let again = executor.retry(op.id).await.unwrap();
    assert_eq!(again.status, OperationStatus::Completed);
}

#[tokio::test]
async fn delete_soft_cancels_a_running_operation() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    store
        .transition_to_running(op.id, &[OperationStatus::Pending], Utc::now())
        .await
        .unwrap()
        .unwrap();

    executor.delete(op.id).await.unwrap();
    // The record is gone; the worker was never contacted to interrupt it.
    assert!(store.get(op.id).await.unwrap().is_none());
}

#[tokio::test]
async fn incremental_success_advances_watermark() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);

    let mut new = new_operation(OperationType::Incremental);
    new.last_sync_time = Some(Utc::now() - ChronoDuration::days(1));
    let op = store.create(new).await.unwrap();
    let before = op.last_sync_time.unwrap();

    let done = executor.execute(op.id, false).await.unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
    assert!(done.last_sync_time.unwrap() > before);
}

#[tokio::test]
async fn scheduler_claims_each_due_operation_once() {
    let base = stub_worker(200, success_body()).await;
    let store = Arc::new(MemoryOperationStore::new());
    let executor = executor_for(&store, &base);
    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn OperationStore>,
        executor,
        Duration::from_secs(5),
    );

    let op = store.create(new_operation(OperationType::Full)).await.unwrap();
    let mut future = new_operation(OperationType::Full);
    future.scheduled_at = Utc::now() + ChronoDuration::hours(1);
    store.create(future).await.unwrap();

    // First tick claims exactly the ripe operation; the next tick finds
    // nothing left to claim.
    let dispatched = scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 1);
    let dispatched = scheduler.tick().await.unwrap();
    assert_eq!(dispatched, 0);

    // Wait for the spawned run to reach a terminal state.
    for _ in 0..50 {
        let current = store.get(op.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            assert_eq!(current.status, OperationStatus::Completed);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("operation never reached a terminal state");
}
