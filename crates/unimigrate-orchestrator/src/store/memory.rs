//! In-memory operation store for tests and DB-less development.
//!
//! Mirrors the Postgres store's compare-and-set semantics behind a single
//! mutex, so scheduler and executor tests observe the same claim behavior
//! they would against the real table.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::operation::{NewOperation, Operation, OperationStatus, TerminalOutcome};

use super::{NewRegistryEntry, OperationStore, OperationSummary, RegistryEntry};

#[derive(Default)]
pub struct MemoryOperationStore {
    operations: Mutex<HashMap<Uuid, Operation>>,
    registry: Mutex<HashMap<Uuid, RegistryEntry>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn create(&self, new: NewOperation) -> Result<Operation> {
        let now = Utc::now();
        let operation = Operation {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            source_registry_id: new.source_registry_id,
            scheduled_at: new.scheduled_at,
            operation_type: new.operation_type,
            status: OperationStatus::Pending,
            config: new.config,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_sync_time: new.last_sync_time,
        };
        self.operations
            .lock()
            .unwrap()
            .insert(operation.id, operation.clone());
        Ok(operation)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>> {
        Ok(self.operations.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Operation>> {
        let operations = self.operations.lock().unwrap();
        let mut all: Vec<Operation> = operations
            .values()
            .filter(|op| owner_id.map_or(true, |owner| op.owner_id == owner))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let operations = self.operations.lock().unwrap();
        Ok(operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending && op.scheduled_at <= now)
            .map(|op| op.id)
            .collect())
    }

    async fn transition_to_running(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Operation>> {
        let mut operations = self.operations.lock().unwrap();
        let Some(operation) = operations.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&operation.status) {
            return Ok(None);
        }
        operation.status = OperationStatus::Running;
        operation.started_at = Some(now);
        operation.completed_at = None;
        operation.updated_at = now;
        Ok(Some(operation.clone()))
    }

    async fn finish(&self, id: Uuid, outcome: TerminalOutcome, now: DateTime<Utc>) -> Result<()> {
        let mut operations = self.operations.lock().unwrap();
        if let Some(operation) = operations.get_mut(&id) {
            operation.status = outcome.status;
            operation.result = outcome.result;
            operation.error_message = outcome.error_message;
            operation.completed_at = Some(now);
            operation.updated_at = now;
            if let Some(watermark) = outcome.new_last_sync_time {
                operation.last_sync_time = Some(watermark);
            }
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.operations.lock().unwrap().remove(&id).is_some())
    }

    async fn summary(&self, owner_id: &str, recent: usize) -> Result<OperationSummary> {
        let all = self.list(Some(owner_id)).await?;
        let mut by_status = std::collections::BTreeMap::new();
        let mut by_type = std::collections::BTreeMap::new();
        for op in &all {
            *by_status.entry(op.status.as_str().to_string()).or_insert(0) += 1;
            *by_type.entry(op.operation_type.to_string()).or_insert(0) += 1;
        }
        Ok(OperationSummary {
            total: all.len(),
            by_status,
            by_type,
            recent: all.into_iter().take(recent).collect(),
        })
    }

    async fn create_registry_entry(&self, new: NewRegistryEntry) -> Result<RegistryEntry> {
        let entry = RegistryEntry {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            adapter_type: new.adapter_type,
            config: new.config,
            created_at: Utc::now(),
        };
        self.registry
            .lock()
            .unwrap()
            .insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn list_registry(&self) -> Result<Vec<RegistryEntry>> {
        let mut entries: Vec<RegistryEntry> =
            self.registry.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationConfig;
    use unimigrate::protocol::OperationType;

    fn new_op(scheduled_at: DateTime<Utc>) -> NewOperation {
        NewOperation {
            owner_id: "u1".into(),
            source_registry_id: None,
            scheduled_at,
            operation_type: OperationType::Full,
            config: OperationConfig {
                source_type: "postgresql".into(),
                dest_type: "clickhouse".into(),
                source: serde_json::json!({}),
                destination: serde_json::json!({}),
            },
            last_sync_time: None,
        }
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let store = MemoryOperationStore::new();
        let now = Utc::now();
        let op = store.create(new_op(now)).await.unwrap();

        let first = store
            .transition_to_running(op.id, &[OperationStatus::Pending], now)
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().started_at, Some(now));

        // A second claimant loses.
        let second = store
            .transition_to_running(op.id, &[OperationStatus::Pending], now)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_due_only_returns_ripe_pending() {
        let store = MemoryOperationStore::new();
        let now = Utc::now();
        let ripe = store.create(new_op(now - chrono::Duration::seconds(5))).await.unwrap();
        let _future = store
            .create(new_op(now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let due = store.due(now).await.unwrap();
        assert_eq!(due, vec![ripe.id]);
    }

    #[tokio::test]
    async fn test_finish_writes_terminal_fields_together() {
        let store = MemoryOperationStore::new();
        let now = Utc::now();
        let op = store.create(new_op(now)).await.unwrap();
        store
            .transition_to_running(op.id, &[OperationStatus::Pending], now)
            .await
            .unwrap();
        store
            .finish(
                op.id,
                TerminalOutcome {
                    status: OperationStatus::Failed,
                    result: None,
                    error_message: Some("worker died".into()),
                    new_last_sync_time: None,
                },
                now,
            )
            .await
            .unwrap();

        let stored = store.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("worker died"));
        assert!(stored.completed_at.is_some());
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let store = MemoryOperationStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.create(new_op(now)).await.unwrap();
        }
        let op = store.create(new_op(now)).await.unwrap();
        store
            .transition_to_running(op.id, &[OperationStatus::Pending], now)
            .await
            .unwrap();

        let summary = store.summary("u1", 2).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_status["pending"], 3);
        assert_eq!(summary.by_status["running"], 1);
        assert_eq!(summary.by_type["full"], 4);
        assert_eq!(summary.recent.len(), 2);
    }
}
