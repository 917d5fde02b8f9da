//! The persistent operation record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use unimigrate::protocol::OperationType;
use unimigrate::MigrationResult;

use crate::error::{OrchestratorError, Result};

/// Lifecycle states of a migration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(OrchestratorError::Persistence(format!(
                "unknown operation status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// pending → running | cancelled; running → completed | failed |
    /// cancelled; failed → running (retry); completed → running (re-run).
    pub fn can_transition(&self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running)
                | (Completed, Running)
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value object inside `Operation::config`: the full worker-facing
/// migration description. Adapter connection parameters are opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub source_type: String,
    pub dest_type: String,
    pub source: serde_json::Value,
    pub destination: serde_json::Value,
}

impl OperationConfig {
    /// Creation-time validation. A config whose source and destination
    /// kinds are equal is rejected before any operation row exists.
    pub fn validate(&self) -> Result<()> {
        if self.source_type.trim().is_empty() || self.dest_type.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "source_type and dest_type are required".to_string(),
            ));
        }
        if self.source_type == self.dest_type {
            return Err(OrchestratorError::Validation(format!(
                "source and destination cannot both be '{}'",
                self.source_type
            )));
        }
        Ok(())
    }
}

/// A scheduled migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub owner_id: String,
    pub source_registry_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub config: OperationConfig,
    pub result: Option<MigrationResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Operation {
    /// Derived view for `GET /operations/{id}/status`.
    pub fn status_view(&self) -> OperationStatusView {
        let duration_seconds = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            (Some(start), None) if self.status == OperationStatus::Running => {
                Some((Utc::now() - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        OperationStatusView {
            id: self.id,
            status: self.status,
            operation_type: self.operation_type,
            duration_seconds,
            is_completed: self.status.is_terminal(),
            is_success: if self.status.is_terminal() {
                Some(self.status == OperationStatus::Completed)
            } else {
                None
            },
            result: self.result.clone(),
            error_message: self.error_message.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Fields supplied when creating an operation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOperation {
    pub owner_id: String,
    #[serde(default)]
    pub source_registry_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub operation_type: OperationType,
    pub config: OperationConfig,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Derived status payload.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStatusView {
    pub id: Uuid,
    pub status: OperationStatus,
    pub operation_type: OperationType,
    pub duration_seconds: Option<f64>,
    pub is_completed: bool,
    pub is_success: Option<bool>,
    pub result: Option<MigrationResult>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal outcome written atomically with the status transition.
#[derive(Debug, Clone)]
pub struct TerminalOutcome {
    pub status: OperationStatus,
    pub result: Option<MigrationResult>,
    pub error_message: Option<String>,
    /// Watermark advance for successful incremental runs.
    pub new_last_sync_time: Option<DateTime<Utc>>,
}
