//! Operation execution: claim, dispatch to the worker, persist the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use unimigrate::protocol::{MigrateRequest, OperationType};
use unimigrate::MigrationResult;

use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationStatus, TerminalOutcome};
use crate::store::OperationStore;
use crate::supervisor::WorkerSupervisor;

/// Drives claimed operations through the worker and back into the store.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn OperationStore>,
    supervisor: Arc<WorkerSupervisor>,
    http: reqwest::Client,
    migrate_url: String,
    migrate_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        supervisor: Arc<WorkerSupervisor>,
        migrate_url: String,
        migrate_timeout: Duration,
    ) -> Self {
        Self {
            store,
            supervisor,
            http: reqwest::Client::new(),
            migrate_url,
            migrate_timeout,
        }
    }

    /// Explicit execute. Rejects running operations outright and pending
    /// operations whose scheduled time has not arrived unless forced.
    pub async fn execute(&self, id: uuid::Uuid, force: bool) -> Result<Operation> {
        let operation = self
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        match operation.status {
            OperationStatus::Running => {
                return Err(OrchestratorError::InvalidTransition {
                    from: OperationStatus::Running,
                    to: OperationStatus::Running,
                })
            }
            OperationStatus::Pending if operation.scheduled_at > Utc::now() && !force => {
                return Err(OrchestratorError::Validation(format!(
                    "operation is scheduled for {}; use force to run now",
                    operation.scheduled_at
                )))
            }
            _ => {}
        }

        let claimed = self
            .store
            .transition_to_running(
                id,
                &[
                    OperationStatus::Pending,
                    OperationStatus::Failed,
                    OperationStatus::Completed,
                ],
                Utc::now(),
            )
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation("operation was claimed concurrently".to_string())
            })?;
        self.run_claimed(claimed).await
    }

    /// Operator-driven retry of a terminal operation. Re-runs are
    /// idempotent to the extent the destination supports upsert; tables
    /// already present load over themselves.
    pub async fn retry(&self, id: uuid::Uuid) -> Result<Operation> {
        let operation = self
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        if !matches!(
            operation.status,
            OperationStatus::Failed | OperationStatus::Completed
        ) {
            return Err(OrchestratorError::InvalidTransition {
                from: operation.status,
                to: OperationStatus::Running,
            });
        }
        let claimed = self
            .store
            .transition_to_running(
                id,
                &[OperationStatus::Failed, OperationStatus::Completed],
                Utc::now(),
            )
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation("operation was claimed concurrently".to_string())
            })?;
        self.run_claimed(claimed).await
    }

    /// Delete an operation. A running operation is soft-cancelled first:
    /// the record turns terminal, the worker is not interrupted, and any
    /// data already written stays at the destination.
    pub async fn delete(&self, id: uuid::Uuid) -> Result<()> {
        let operation = self
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        if operation.status == OperationStatus::Running {
            warn!("Cancelling running operation {}", id);
            self.store
                .finish(
                    id,
                    TerminalOutcome {
                        status: OperationStatus::Cancelled,
                        result: None,
                        error_message: Some("cancelled by delete".to_string()),
                        new_last_sync_time: None,
                    },
                    Utc::now(),
                )
                .await?;
        } else if operation.status == OperationStatus::Pending {
            self.store
                .finish(
                    id,
                    TerminalOutcome {
                        status: OperationStatus::Cancelled,
                        result: None,
                        error_message: None,
                        new_last_sync_time: None,
                    },
                    Utc::now(),
                )
                .await?;
        }
        self.store.delete(id).await?;
        Ok(())
    }

    /// Run an operation that is already in `running`. Every outcome ends
    /// in a terminal transition; this method only errors when persisting
    /// that transition fails.
    pub async fn run_claimed(&self, operation: Operation) -> Result<Operation> {
        let id = operation.id;
        let started_at = operation.started_at.unwrap_or_else(Utc::now);
        info!(
            "Executing operation {}: {} -> {} ({})",
            id,
            operation.config.source_type,
            operation.config.dest_type,
            operation.operation_type
        );

        if let Err(e) = self.supervisor.ensure_worker().await {
            error!("Worker unavailable for operation {}: {}", id, e);
            self.store
                .finish(
                    id,
                    TerminalOutcome {
                        status: OperationStatus::Failed,
                        result: None,
                        error_message: Some(e.to_string()),
                        new_last_sync_time: None,
                    },
                    Utc::now(),
                )
                .await?;
            return self.reload(id).await;
        }

        let request = MigrateRequest {
            source_type: operation.config.source_type.clone(),
            dest_type: operation.config.dest_type.clone(),
            source: operation.config.source.clone(),
            destination: operation.config.destination.clone(),
            operation_type: operation.operation_type,
            last_sync_time: operation.last_sync_time,
        };

        let response = self
            .http
            .post(&self.migrate_url)
            .timeout(self.migrate_timeout)
            .json(&request)
            .send()
            .await;

        let outcome = match response {
            Ok(response) => match response.json::<MigrationResult>().await {
                Ok(result) => {
                    let status = if result.success {
                        OperationStatus::Completed
                    } else {
                        OperationStatus::Failed
                    };
                    let error_message = if result.success {
                        None
                    } else {
                        Some(result.errors.join("; "))
                    };
                    // A successful incremental run advances the watermark
                    // to its own start time.
                    let new_last_sync_time = (result.success
                        && operation.operation_type == OperationType::Incremental)
                        .then_some(started_at);
                    TerminalOutcome {
                        status,
                        result: Some(result),
                        error_message,
                        new_last_sync_time,
                    }
                }
                Err(e) => TerminalOutcome {
                    status: OperationStatus::Failed,
                    result: None,
                    error_message: Some(format!("malformed worker response: {}", e)),
                    new_last_sync_time: None,
                },
            },
            Err(e) => {
                // Timeout or transport failure. Data already migrated
                // stays at the destination; only the record turns failed.
                error!("Worker call failed for operation {}: {}", id, e);
                TerminalOutcome {
                    status: OperationStatus::Failed,
                    result: None,
                    error_message: Some(format!("worker transport error: {}", e)),
                    new_last_sync_time: None,
                }
            }
        };

        info!(
            "Operation {} finished with status {}",
            id,
            outcome.status.as_str()
        );
        self.store.finish(id, outcome, Utc::now()).await?;
        self.reload(id).await
    }

    async fn reload(&self, id: uuid::Uuid) -> Result<Operation> {
        self.store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound)
    }
}
