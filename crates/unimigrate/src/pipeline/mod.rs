//! The pipeline engine: per-operation extract/translate/load coordinator.
//!
//! Given a [`MigrateRequest`], the engine resolves adapters from the
//! catalog, connects both sides, walks the source's tables sequentially,
//! and streams batches from source to destination with per-table failure
//! isolation. One table's failure never aborts the operation; connection
//! failures do.
//!
//! Cross-table foreign keys are created only after every table's data has
//! loaded, so referenced tables exist before the constraints that point at
//! them. Per-table post-load order is indexes, then unique constraints.

mod result;

pub use result::{MigrationResult, TableFailed, TableMigrated};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::catalog::AdapterCatalog;
use crate::core::schema::{ForeignKey, TableDescriptor};
use crate::core::traits::{DestinationAdapter, SourceAdapter};
use crate::error::Result;
use crate::protocol::{MigrateRequest, OperationType};

/// Batch size for paginated API sources. Small enough to stay under API
/// page/payload limits.
const API_BATCH_SIZE: usize = 50;

/// Batch size for relational sources.
const SQL_BATCH_SIZE: usize = 1000;

/// Additional attempts for a failed table before giving up.
const TABLE_RETRIES: usize = 2;

/// Delay before a table retry.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Emit a progress line every N batches for relational sources. API sources
/// log every batch.
const SQL_PROGRESS_EVERY: usize = 10;

/// Executes one migration operation end-to-end.
pub struct PipelineEngine {
    catalog: Arc<AdapterCatalog>,
}

impl PipelineEngine {
    pub fn new(catalog: Arc<AdapterCatalog>) -> Self {
        Self { catalog }
    }

    /// Run a migration. Failures are encoded in the returned
    /// [`MigrationResult`]; this method itself never fails.
    pub async fn run(&self, request: MigrateRequest) -> MigrationResult {
        // Pre-flight: resolve adapters before touching any network resource.
        if request.source_type == request.dest_type {
            return MigrationResult::aborted(format!(
                "Cannot migrate from {} to {}: source and destination cannot be the same",
                request.source_type, request.dest_type
            ));
        }
        if request.operation_type == OperationType::Incremental && request.last_sync_time.is_none()
        {
            return MigrationResult::aborted(
                "last_sync_time is required for incremental migration".to_string(),
            );
        }

        let mut source = match self.catalog.create_source(&request.source_type) {
            Ok(s) => s,
            Err(e) => return MigrationResult::aborted(e.to_string()),
        };
        let mut destination = match self.catalog.create_destination(&request.dest_type) {
            Ok(d) => d,
            Err(e) => return MigrationResult::aborted(e.to_string()),
        };

        info!("Connecting to source: {}", request.source_type);
        if let Err(e) = source.connect(&request.source).await {
            source.disconnect().await;
            return MigrationResult::aborted(format!(
                "Failed to connect to source {}: {}",
                request.source_type, e
            ));
        }

        info!("Connecting to destination: {}", request.dest_type);
        if let Err(e) = destination
            .connect(&request.destination, &request.source_type)
            .await
        {
            source.disconnect().await;
            destination.disconnect().await;
            return MigrationResult::aborted(format!(
                "Failed to connect to destination {}: {}",
                request.dest_type, e
            ));
        }

        let result = self
            .migrate_all(&request, source.as_ref(), destination.as_ref())
            .await;

        source.disconnect().await;
        destination.disconnect().await;
        result
    }

    async fn migrate_all(
        &self,
        request: &MigrateRequest,
        source: &dyn SourceAdapter,
        destination: &dyn DestinationAdapter,
    ) -> MigrationResult {
        let mut result = MigrationResult::default();

        let tables = match source.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                return MigrationResult::aborted(format!("Failed to list tables: {}", e));
            }
        };
        result.total_tables = tables.len();
        info!(
            "Found {} tables to migrate from {}",
            tables.len(),
            source.source_key()
        );

        if tables.is_empty() {
            warn!("No tables found in source");
            result.errors.push("No tables/modules found in source".to_string());
            result.success = true;
            return result;
        }

        // Foreign keys from successfully loaded tables, created after all
        // data loads so referenced tables exist first.
        let mut deferred_fks: Vec<(String, Vec<ForeignKey>)> = Vec::new();

        for table in &tables {
            let mut attempt = 0;
            loop {
                if attempt > 0 {
                    info!(
                        "Retrying table {} (attempt {}/{})",
                        table,
                        attempt + 1,
                        TABLE_RETRIES + 1
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }

                match self
                    .migrate_table(request, source, destination, table)
                    .await
                {
                    Ok(outcome) => {
                        info!(
                            "Successfully migrated table {}: {} records",
                            table, outcome.records
                        );
                        result.tables_migrated.push(TableMigrated {
                            table: table.clone(),
                            records: outcome.records,
                        });
                        result.total_records += outcome.records;
                        result.errors.extend(outcome.constraint_errors);
                        if !outcome.foreign_keys.is_empty() {
                            deferred_fks.push((outcome.dest_table, outcome.foreign_keys));
                        }
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Error migrating table {} (attempt {}/{}): {}",
                            table,
                            attempt + 1,
                            TABLE_RETRIES + 1,
                            e
                        );
                        if e.is_fatal_to_operation() {
                            result.tables_failed.push(TableFailed {
                                table: table.clone(),
                                error: e.to_string(),
                            });
                            result.errors.push(format!("{}: {}", table, e));
                            result.success = false;
                            return result;
                        }
                        attempt += 1;
                        if attempt > TABLE_RETRIES {
                            result.tables_failed.push(TableFailed {
                                table: table.clone(),
                                error: e.to_string(),
                            });
                            result.errors.push(format!("{}: {}", table, e));
                            break;
                        }
                    }
                }
            }
        }

        for (dest_table, fks) in deferred_fks {
            if let Err(e) = destination.create_foreign_keys(&dest_table, &fks).await {
                warn!("Could not create foreign keys for {}: {}", dest_table, e);
                result
                    .errors
                    .push(format!("{}: foreign keys not created: {}", dest_table, e));
            }
        }

        result.success = result.tables_failed.is_empty();
        info!(
            "Migration completed. Success: {}, migrated: {}, failed: {}, records: {}",
            result.success,
            result.tables_migrated.len(),
            result.tables_failed.len(),
            result.total_records
        );
        result
    }

    async fn migrate_table(
        &self,
        request: &MigrateRequest,
        source: &dyn SourceAdapter,
        destination: &dyn DestinationAdapter,
        table: &str,
    ) -> Result<TableOutcome> {
        info!("Migrating table: {}", table);
        let desc = source.get_schema(table).await?;
        debug!("Table {} has {} columns", table, desc.columns.len());

        let desc = self.load_constraints(source, desc).await;

        let mapped = destination.map_types(&desc.columns, source.source_key());
        let dest_table = destination.table_name(&desc.name, source.source_key());

        destination
            .create_table(&dest_table, &mapped, &desc.primary_key)
            .await?;

        // Live destination columns; a pre-existing narrower table gets the
        // missing mapped columns added before the first write.
        let mut known_columns: BTreeSet<String> = match destination.columns_for(&dest_table).await {
            Ok(cols) => cols.into_iter().collect(),
            Err(e) => {
                debug!("Could not list columns for {}: {}", dest_table, e);
                mapped.iter().map(|c| c.name.clone()).collect()
            }
        };
        let missing_at_create: Vec<String> = mapped
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !known_columns.contains(name))
            .collect();
        if !missing_at_create.is_empty() {
            info!(
                "Destination table {} is missing {} columns, evolving schema",
                dest_table,
                missing_at_create.len()
            );
            destination
                .evolve_schema(&dest_table, &missing_at_create)
                .await?;
            known_columns.extend(missing_at_create);
        }

        // Field names the engine has already ensured exist downstream, in
        // source space. API sources may introduce new fields mid-stream.
        let mut ensured_fields: BTreeSet<String> =
            desc.columns.iter().map(|c| c.name.clone()).collect();

        let batch_size = if source.is_api_source() {
            API_BATCH_SIZE
        } else {
            SQL_BATCH_SIZE
        };

        let mut stream = match request.operation_type {
            OperationType::Full => source.read_data(table, batch_size).await?,
            OperationType::Incremental => {
                // Presence validated in run().
                let since: DateTime<Utc> = request.last_sync_time.unwrap_or_default();
                source.read_incremental(table, since, batch_size).await?
            }
        };

        let mut records: u64 = 0;
        let mut batch_count: usize = 0;
        while let Some(batch) = stream.recv().await {
            let batch = batch?;
            batch_count += 1;
            if batch.is_empty() {
                debug!("{}: received empty batch {}, skipping", table, batch_count);
                continue;
            }

            let new_fields: Vec<String> = batch
                .column_names()
                .into_iter()
                .filter(|name| !ensured_fields.contains(name))
                .collect();
            if !new_fields.is_empty() {
                info!(
                    "{}: {} new fields observed mid-stream, evolving {}",
                    table,
                    new_fields.len(),
                    dest_table
                );
                destination.evolve_schema(&dest_table, &new_fields).await?;
                ensured_fields.extend(new_fields);
            }

            let written = destination
                .write_batch(&dest_table, &batch, &desc.primary_key)
                .await?;
            records += written;

            if source.is_api_source() {
                info!(
                    "{}: batch {}: {} records, total {}",
                    table,
                    batch_count,
                    batch.len(),
                    records
                );
            } else if batch_count % SQL_PROGRESS_EVERY == 0 {
                info!("{}: {} records in {} batches", table, records, batch_count);
            }
        }

        let mut constraint_errors = Vec::new();
        if !desc.indexes.is_empty() {
            if let Err(e) = destination.create_indexes(&dest_table, &desc.indexes).await {
                warn!("Could not create indexes for {}: {}", dest_table, e);
                constraint_errors.push(format!("{}: indexes not created: {}", table, e));
            }
        }
        if !desc.unique_constraints.is_empty() {
            if let Err(e) = destination
                .create_unique_constraints(&dest_table, &desc.unique_constraints)
                .await
            {
                warn!("Could not create unique constraints for {}: {}", dest_table, e);
                constraint_errors.push(format!("{}: unique constraints not created: {}", table, e));
            }
        }

        Ok(TableOutcome {
            dest_table,
            records,
            constraint_errors,
            foreign_keys: desc.foreign_keys,
        })
    }

    /// Load PK/FK/unique/index metadata. Errors here are non-fatal: the
    /// table migrates without the failing constraint kind.
    async fn load_constraints(
        &self,
        source: &dyn SourceAdapter,
        mut desc: TableDescriptor,
    ) -> TableDescriptor {
        let table = desc.name.clone();
        if desc.primary_key.is_empty() {
            match source.get_primary_key(&table).await {
                Ok(pk) => desc.primary_key = pk,
                Err(e) => warn!("Could not get primary key for {}: {}", table, e),
            }
        }
        if desc.foreign_keys.is_empty() {
            match source.get_foreign_keys(&table).await {
                Ok(fks) => desc.foreign_keys = fks,
                Err(e) => warn!("Could not get foreign keys for {}: {}", table, e),
            }
        }
        if desc.unique_constraints.is_empty() {
            match source.get_unique_constraints(&table).await {
                Ok(uqs) => desc.unique_constraints = uqs,
                Err(e) => warn!("Could not get unique constraints for {}: {}", table, e),
            }
        }
        if desc.indexes.is_empty() {
            match source.get_indexes(&table).await {
                Ok(idx) => desc.indexes = idx,
                Err(e) => warn!("Could not get indexes for {}: {}", table, e),
            }
        }
        desc
    }
}

struct TableOutcome {
    dest_table: String,
    records: u64,
    constraint_errors: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
}
