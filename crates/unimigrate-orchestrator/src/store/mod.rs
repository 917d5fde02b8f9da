//! Operation persistence.
//!
//! The [`OperationStore`] trait abstracts the persistent operations table
//! plus the small source/destination registry table. Two backends:
//!
//! - [`PgOperationStore`]: sqlx/Postgres, the production store
//! - [`MemoryOperationStore`]: in-memory, for tests and DB-less runs
//!
//! State transitions that matter for correctness go through
//! compare-and-set methods so multiple orchestrator replicas never
//! double-claim an operation.

mod memory;
mod postgres;

pub use memory::MemoryOperationStore;
pub use postgres::PgOperationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::operation::{NewOperation, Operation, OperationStatus, TerminalOutcome};

/// Per-owner aggregate for `GET /operations/summary`.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub total: usize,
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub by_type: std::collections::BTreeMap<String, usize>,
    pub recent: Vec<Operation>,
}

/// A saved source or destination endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: Uuid,
    pub name: String,
    /// "source" or "destination".
    pub kind: String,
    pub adapter_type: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when saving a registry entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRegistryEntry {
    pub name: String,
    pub kind: String,
    pub adapter_type: String,
    pub config: serde_json::Value,
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new pending operation.
    async fn create(&self, new: NewOperation) -> Result<Operation>;

    async fn get(&self, id: Uuid) -> Result<Option<Operation>>;

    /// All operations, optionally filtered by owner, newest first.
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Operation>>;

    /// Ids of pending operations whose `scheduled_at` has passed.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Compare-and-set transition into `running`. Succeeds only when the
    /// current status is one of `from`; returns the updated operation or
    /// `None` when another replica won the claim (or the status moved on).
    async fn transition_to_running(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Operation>>;

    /// Terminal transition: status, result, error message, `completed_at`,
    /// and any watermark advance are written atomically.
    async fn finish(&self, id: Uuid, outcome: TerminalOutcome, now: DateTime<Utc>) -> Result<()>;

    /// Remove the operation row. Returns false when it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn summary(&self, owner_id: &str, recent: usize) -> Result<OperationSummary>;

    // ===== Source/destination registry =====

    async fn create_registry_entry(&self, new: NewRegistryEntry) -> Result<RegistryEntry>;

    async fn list_registry(&self) -> Result<Vec<RegistryEntry>>;
}
