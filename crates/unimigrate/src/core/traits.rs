//! Adapter contracts for pluggable sources and destinations.
//!
//! A source adapter reads schema and row batches from one source family
//! (relational engine or SaaS API); a destination adapter owns type mapping,
//! table creation, additive schema evolution, and batch writes for one
//! destination family.
//!
//! # Streaming
//!
//! [`SourceAdapter::read_data`] returns a bounded channel receiver. The
//! adapter spawns a producer task that pages through the source and sends
//! batches; the small channel bound means the producer suspends until the
//! destination has acknowledged the previous write (backpressure). A stream
//! is finite and not restartable: a mid-stream error fails the table, not
//! the operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::schema::{
    ColumnDef, ForeignKey, IndexDef, MappedColumn, TableDescriptor, UniqueConstraint,
};
use crate::core::value::Batch;
use crate::error::Result;

/// Finite lazy sequence of row batches.
pub type BatchStream = mpsc::Receiver<Result<Batch>>;

/// Channel bound for batch streams. One batch in flight plus a small
/// read-ahead keeps memory flat while hiding source latency.
pub const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Read schema and data from a source database or API.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Acquire network resources. Idempotent-safe: a second call on an
    /// already-connected adapter is a no-op.
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()>;

    /// Release resources. Runs on every control-flow exit of the pipeline.
    async fn disconnect(&mut self);

    /// Validate a configuration by establishing (and dropping) a connection.
    async fn test_connection(&self, config: &serde_json::Value) -> Result<()>;

    /// List table identifiers. For API sources these are logical
    /// modules/resources.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Discover the column layout of a table. API sources return a union of
    /// fields observed in a probe page; later pages may still introduce new
    /// fields, which the pipeline handles via schema evolution.
    async fn get_schema(&self, table: &str) -> Result<TableDescriptor>;

    /// Primary key column names. Errors are non-fatal: callers treat a
    /// failure as "no primary key".
    async fn get_primary_key(&self, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_foreign_keys(&self, _table: &str) -> Result<Vec<ForeignKey>> {
        Ok(Vec::new())
    }

    async fn get_unique_constraints(&self, _table: &str) -> Result<Vec<UniqueConstraint>> {
        Ok(Vec::new())
    }

    async fn get_indexes(&self, _table: &str) -> Result<Vec<IndexDef>> {
        Ok(Vec::new())
    }

    /// Stream every row of a table in batches of `batch_size`.
    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream>;

    /// Stream only rows whose change-tracking field strictly exceeds `since`.
    async fn read_incremental(
        &self,
        table: &str,
        since: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<BatchStream>;

    /// Adapter key, e.g. `"postgresql"`, `"zoho"`.
    fn source_key(&self) -> &'static str;

    /// Whether this source is a paginated API (small batches, per-batch
    /// progress logging) rather than a relational engine.
    fn is_api_source(&self) -> bool {
        false
    }
}

/// Write schema and data to a destination store.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Acquire network resources and create the target database/namespace
    /// if missing. `source_key` lets the destination pick a source-aware
    /// type map and table prefix.
    async fn connect(&mut self, config: &serde_json::Value, source_key: &str) -> Result<()>;

    /// Release resources. Runs on every control-flow exit of the pipeline.
    async fn disconnect(&mut self);

    /// Validate a configuration by establishing (and dropping) a connection.
    async fn test_connection(&self, config: &serde_json::Value) -> Result<()>;

    /// Map source columns to destination column definitions. Total: unknown
    /// source types degrade to the destination's widest string type.
    fn map_types(&self, columns: &[ColumnDef], source_key: &str) -> Vec<MappedColumn>;

    /// Destination-side name for a source table, including any
    /// source-family prefix.
    fn table_name(&self, source_table: &str, source_key: &str) -> String {
        let _ = source_key;
        source_table
            .rsplit('.')
            .next()
            .unwrap_or(source_table)
            .to_string()
    }

    /// Create a table if it does not exist. MUST NOT drop a pre-existing
    /// table and MUST succeed when the table already exists with a superset
    /// schema.
    async fn create_table(
        &self,
        table: &str,
        columns: &[MappedColumn],
        primary_key: &[String],
    ) -> Result<()>;

    /// Columns currently present on a destination table.
    async fn columns_for(&self, table: &str) -> Result<Vec<String>>;

    /// Add missing columns as nullable, widest-string-type columns.
    async fn evolve_schema(&self, table: &str, missing: &[String]) -> Result<()>;

    /// Write one batch. When `primary_key` is non-empty the write is an
    /// upsert; otherwise a plain append. Returns the record count written.
    async fn write_batch(&self, table: &str, batch: &Batch, primary_key: &[String]) -> Result<u64>;

    /// Post-load constraint DDL. Failures are recorded, never fatal.
    async fn create_indexes(&self, _table: &str, _indexes: &[IndexDef]) -> Result<()> {
        Ok(())
    }

    async fn create_unique_constraints(
        &self,
        _table: &str,
        _constraints: &[UniqueConstraint],
    ) -> Result<()> {
        Ok(())
    }

    async fn create_foreign_keys(&self, _table: &str, _fks: &[ForeignKey]) -> Result<()> {
        Ok(())
    }

    /// Adapter key, e.g. `"clickhouse"`, `"postgresql"`.
    fn destination_key(&self) -> &'static str;
}
