//! sqlx/Postgres operation store.
//!
//! One `operations` table keyed by id plus the small `source_registry`
//! table. Scheduler claims use a compare-and-set UPDATE so concurrent
//! orchestrator replicas never double-execute an operation; terminal
//! transitions write status, result, error, and `completed_at` in a single
//! statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use unimigrate::protocol::OperationType;

use crate::error::{OrchestratorError, Result};
use crate::operation::{
    NewOperation, Operation, OperationConfig, OperationStatus, TerminalOutcome,
};

use super::{NewRegistryEntry, OperationStore, OperationSummary, RegistryEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS operations (
    id UUID PRIMARY KEY,
    owner_id TEXT NOT NULL,
    source_registry_id UUID,
    scheduled_at TIMESTAMPTZ NOT NULL,
    operation_type TEXT NOT NULL,
    status TEXT NOT NULL,
    config JSONB NOT NULL,
    result JSONB,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    last_sync_time TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_operations_status_scheduled
    ON operations (status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_operations_owner ON operations (owner_id);
CREATE TABLE IF NOT EXISTS source_registry (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    adapter_type TEXT NOT NULL,
    config JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
"#;

pub struct PgOperationStore {
    pool: PgPool,
}

impl PgOperationStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("connect failed: {}", e)))?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bootstrap(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Operations schema ready");
        Ok(())
    }
}

fn row_to_operation(row: &PgRow) -> Result<Operation> {
    let status: String = row.try_get("status")?;
    let operation_type: String = row.try_get("operation_type")?;
    let config: serde_json::Value = row.try_get("config")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;

    let config: OperationConfig = serde_json::from_value(config)
        .map_err(|e| OrchestratorError::Persistence(format!("corrupt config blob: {}", e)))?;
    let result = result
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| OrchestratorError::Persistence(format!("corrupt result blob: {}", e)))?;

    Ok(Operation {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        source_registry_id: row.try_get("source_registry_id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        operation_type: if operation_type == "incremental" {
            OperationType::Incremental
        } else {
            OperationType::Full
        },
        status: OperationStatus::parse(&status)?,
        config,
        result,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_sync_time: row.try_get("last_sync_time")?,
    })
}

const SELECT_COLUMNS: &str = "id, owner_id, source_registry_id, scheduled_at, operation_type, \
     status, config, result, error_message, created_at, updated_at, started_at, completed_at, \
     last_sync_time";

#[async_trait]
impl OperationStore for PgOperationStore {
    async fn create(&self, new: NewOperation) -> Result<Operation> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let config = serde_json::to_value(&new.config)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        let sql = format!(
            "INSERT INTO operations \
             (id, owner_id, source_registry_id, scheduled_at, operation_type, status, config, \
              created_at, updated_at, last_sync_time) \
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $7, $8) \
             RETURNING {}",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&new.owner_id)
            .bind(new.source_registry_id)
            .bind(new.scheduled_at)
            .bind(new.operation_type.to_string())
            .bind(config)
            .bind(now)
            .bind(new.last_sync_time)
            .fetch_one(&self.pool)
            .await?;
        row_to_operation(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>> {
        let sql = format!("SELECT {} FROM operations WHERE id = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_operation(&r)).transpose()
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Operation>> {
        let rows = match owner_id {
            Some(owner) => {
                let sql = format!(
                    "SELECT {} FROM operations WHERE owner_id = $1 ORDER BY created_at DESC",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql).bind(owner).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM operations ORDER BY created_at DESC",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(row_to_operation).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM operations WHERE status = 'pending' AND scheduled_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(Into::into))
            .collect()
    }

    async fn transition_to_running(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Operation>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "UPDATE operations \
             SET status = 'running', started_at = $2, completed_at = NULL, updated_at = $2 \
             WHERE id = $1 AND status = ANY($3) \
             RETURNING {}",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .bind(&from)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_operation(&r)).transpose()
    }

    async fn finish(&self, id: Uuid, outcome: TerminalOutcome, now: DateTime<Utc>) -> Result<()> {
        let result = outcome
            .result
            .map(|r| serde_json::to_value(&r))
            .transpose()
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        sqlx::query(
            "UPDATE operations \
             SET status = $2, result = $3, error_message = $4, completed_at = $5, updated_at = $5, \
                 last_sync_time = COALESCE($6, last_sync_time) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(result)
        .bind(outcome.error_message)
        .bind(now)
        .bind(outcome.new_last_sync_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM operations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn summary(&self, owner_id: &str, recent: usize) -> Result<OperationSummary> {
        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM operations WHERE owner_id = $1 GROUP BY status",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        let type_rows = sqlx::query(
            "SELECT operation_type, COUNT(*) AS n FROM operations \
             WHERE owner_id = $1 GROUP BY operation_type",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = std::collections::BTreeMap::new();
        let mut total = 0usize;
        for row in &status_rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            total += count as usize;
            by_status.insert(status, count as usize);
        }
        let mut by_type = std::collections::BTreeMap::new();
        for row in &type_rows {
            let operation_type: String = row.try_get("operation_type")?;
            let count: i64 = row.try_get("n")?;
            by_type.insert(operation_type, count as usize);
        }

        let sql = format!(
            "SELECT {} FROM operations WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_COLUMNS
        );
        let recent_rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(recent as i64)
            .fetch_all(&self.pool)
            .await?;
        let recent = recent_rows
            .iter()
            .map(row_to_operation)
            .collect::<Result<Vec<_>>>()?;

        Ok(OperationSummary {
            total,
            by_status,
            by_type,
            recent,
        })
    }

    async fn create_registry_entry(&self, new: NewRegistryEntry) -> Result<RegistryEntry> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO source_registry (id, name, kind, adapter_type, config, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.kind)
        .bind(&new.adapter_type)
        .bind(&new.config)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(RegistryEntry {
            id,
            name: new.name,
            kind: new.kind,
            adapter_type: new.adapter_type,
            config: new.config,
            created_at: now,
        })
    }

    async fn list_registry(&self) -> Result<Vec<RegistryEntry>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, adapter_type, config, created_at \
             FROM source_registry ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RegistryEntry {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    kind: row.try_get("kind")?,
                    adapter_type: row.try_get("adapter_type")?,
                    config: row.try_get("config")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
