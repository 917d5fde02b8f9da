//! Supervisor behavior: healthy pass-through, spawn failure capture, and
//! the no-launch-command case.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use unimigrate_orchestrator::supervisor::ProcessState;
use unimigrate_orchestrator::{OrchestratorError, WorkerSupervisor};

async fn healthy_stub() -> String {
    let app = Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "healthy"})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}/health", addr)
}

#[tokio::test]
async fn healthy_worker_passes_through() {
    let health_url = healthy_stub().await;
    let supervisor = WorkerSupervisor::new(health_url, None, Duration::from_secs(5));

    supervisor.ensure_worker().await.unwrap();
    assert_eq!(supervisor.state().await, ProcessState::Running);
}

#[tokio::test]
async fn missing_launch_command_is_unavailable() {
    let supervisor = WorkerSupervisor::new(
        "http://127.0.0.1:1/health".to_string(),
        None,
        Duration::from_secs(5),
    );

    let err = supervisor.ensure_worker().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkerUnavailable(_)));
    assert!(err.to_string().contains("no launch command"));
    assert_eq!(supervisor.state().await, ProcessState::Failed);
}

#[tokio::test]
async fn worker_dying_during_startup_surfaces_its_output() {
    let supervisor = WorkerSupervisor::new(
        "http://127.0.0.1:1/health".to_string(),
        Some("echo boom >&2; exit 1".to_string()),
        Duration::from_secs(10),
    );

    let err = supervisor.ensure_worker().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("exited during startup"), "{}", message);
    assert!(message.contains("boom"), "{}", message);
    assert_eq!(supervisor.state().await, ProcessState::Failed);
}

#[tokio::test]
async fn concurrent_callers_share_one_starting_attempt() {
    let health_url = healthy_stub().await;
    let supervisor = Arc::new(WorkerSupervisor::new(
        health_url,
        None,
        Duration::from_secs(5),
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let supervisor = Arc::clone(&supervisor);
        handles.push(tokio::spawn(async move { supervisor.ensure_worker().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(supervisor.state().await, ProcessState::Running);
}
