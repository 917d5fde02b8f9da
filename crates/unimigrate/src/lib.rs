//! # unimigrate
//!
//! Adapter-based extract/translate/load engine for scheduled multi-source
//! data migrations.
//!
//! The library provides the core of the migration worker:
//!
//! - **Adapter contracts** for pluggable sources (relational engines, SaaS
//!   APIs) and destinations (columnar analytic store, relational engines)
//! - **Batched streaming** with backpressure from source to destination
//! - **Type mapping** across heterogeneous stores, parameterised by the
//!   source family
//! - **Schema evolution** for API sources with dynamic per-tenant fields
//! - **Partial-failure semantics**: one table's failure never aborts the
//!   whole operation
//!
//! ## Example
//!
//! ```rust,no_run
//! use unimigrate::{AdapterCatalog, PipelineEngine};
//! use unimigrate::protocol::{MigrateRequest, OperationType};
//!
//! #[tokio::main]
//! async fn main() {
//!     let catalog = std::sync::Arc::new(AdapterCatalog::with_builtins());
//!     let engine = PipelineEngine::new(catalog);
//!     let request = MigrateRequest {
//!         source_type: "postgresql".into(),
//!         dest_type: "clickhouse".into(),
//!         source: serde_json::json!({"host": "db", "port": 5432}),
//!         destination: serde_json::json!({"host": "ch", "port": 8123}),
//!         operation_type: OperationType::Full,
//!         last_sync_time: None,
//!     };
//!     let result = engine.run(request).await;
//!     println!("migrated {} records", result.total_records);
//! }
//! ```

pub mod catalog;
pub mod core;
pub mod destinations;
pub mod error;
pub mod identifier;
pub mod pipeline;
pub mod protocol;
pub mod sources;

// Re-exports for convenient access
pub use catalog::AdapterCatalog;
pub use core::schema::{
    ColumnDef, ForeignKey, IndexDef, MappedColumn, TableDescriptor, UniqueConstraint,
};
pub use core::traits::{BatchStream, DestinationAdapter, SourceAdapter};
pub use core::value::{Batch, Record, Value};
pub use error::{AdapterError, Result};
pub use pipeline::{MigrationResult, PipelineEngine, TableFailed, TableMigrated};
pub use protocol::{HealthResponse, MigrateRequest, OperationType};
