//! Aggregated outcome of one migration operation.

use serde::{Deserialize, Serialize};

/// A table that migrated successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMigrated {
    pub table: String,
    pub records: u64,
}

/// A table that failed after all retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFailed {
    pub table: String,
    pub error: String,
}

/// Aggregated outcome returned by the pipeline engine and serialized as the
/// worker's `/migrate` response body.
///
/// `success` holds iff `tables_failed` is empty. Post-load constraint
/// failures land in `errors` without failing their table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub success: bool,
    pub tables_migrated: Vec<TableMigrated>,
    pub tables_failed: Vec<TableFailed>,
    pub total_tables: usize,
    pub total_records: u64,
    pub errors: Vec<String>,
}

impl Default for MigrationResult {
    fn default() -> Self {
        Self {
            success: true,
            tables_migrated: Vec::new(),
            tables_failed: Vec::new(),
            total_tables: 0,
            total_records: 0,
            errors: Vec::new(),
        }
    }
}

impl MigrationResult {
    /// A result for an operation that aborted before any table was touched
    /// (pre-flight rejection or connection failure).
    pub fn aborted(error: String) -> Self {
        Self {
            success: false,
            errors: vec![error],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let result = MigrationResult {
            success: false,
            tables_migrated: vec![TableMigrated {
                table: "T1".into(),
                records: 12,
            }],
            tables_failed: vec![TableFailed {
                table: "T2".into(),
                error: "batch write error".into(),
            }],
            total_tables: 2,
            total_records: 12,
            errors: vec!["T2: batch write error".into()],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["tables_migrated"][0]["table"], "T1");
        assert_eq!(json["tables_migrated"][0]["records"], 12);
        assert_eq!(json["tables_failed"][0]["error"], "batch write error");

        let back: MigrationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_records, 12);
    }

    #[test]
    fn test_aborted_is_failure_with_single_error() {
        let result = MigrationResult::aborted("no route to host".into());
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.total_tables, 0);
    }
}
