//! Wire types shared by the migration worker and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full reload or incremental sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Full,
    Incremental,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Full => write!(f, "full"),
            OperationType::Incremental => write!(f, "incremental"),
        }
    }
}

/// Body of `POST /migrate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    /// Source adapter key.
    pub source_type: String,

    /// Destination adapter key.
    pub dest_type: String,

    /// Adapter-specific source connection parameters, opaque to the
    /// orchestrator.
    pub source: serde_json::Value,

    /// Adapter-specific destination connection parameters.
    pub destination: serde_json::Value,

    #[serde(default = "default_operation_type")]
    pub operation_type: OperationType,

    /// Watermark for incremental runs; required when
    /// `operation_type == incremental`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

fn default_operation_type() -> OperationType {
    OperationType::Full
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
}

/// Which side of a migration a connection test targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Source,
    Destination,
}

/// Body of `POST /test-connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionRequest {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub adapter_type: String,
    pub config: serde_json::Value,
}

/// Response of `POST /test-connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_request_round_trip() {
        let json = serde_json::json!({
            "source_type": "postgresql",
            "dest_type": "clickhouse",
            "source": {"host": "db", "port": 5432},
            "destination": {"host": "ch", "port": 8123},
            "operation_type": "incremental",
            "last_sync_time": "2024-01-01T00:00:00Z"
        });
        let req: MigrateRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.operation_type, OperationType::Incremental);
        assert!(req.last_sync_time.is_some());

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["source_type"], "postgresql");
        assert_eq!(back["operation_type"], "incremental");
    }

    #[test]
    fn test_operation_type_defaults_to_full() {
        let json = serde_json::json!({
            "source_type": "mysql",
            "dest_type": "postgresql",
            "source": {},
            "destination": {}
        });
        let req: MigrateRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.operation_type, OperationType::Full);
        assert!(req.last_sync_time.is_none());
    }

    #[test]
    fn test_connection_kind_wire_name() {
        let req: TestConnectionRequest = serde_json::from_value(serde_json::json!({
            "type": "source",
            "adapter_type": "zoho",
            "config": {}
        }))
        .unwrap();
        assert_eq!(req.kind, ConnectionKind::Source);
    }
}
