//! Error types for the migration library.

use thiserror::Error;

/// Main error type for adapter and pipeline operations.
///
/// Table-level variants (`Schema`, `TypeMapping`, `Read`, `Write`) abort the
/// current table only; `Connection` and `UnsupportedCombination` abort the
/// whole operation. `Constraint` is recorded but never fatal.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Connection to a source or destination failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication or token exchange failed (API sources).
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Schema discovery failed for a table.
    #[error("Schema error for {table}: {message}")]
    Schema { table: String, message: String },

    /// A source type could not be mapped to a destination type.
    #[error("Type mapping error: {0}")]
    TypeMapping(String),

    /// Reading a batch from the source failed.
    #[error("Read error for {table}: {message}")]
    Read { table: String, message: String },

    /// Writing a batch to the destination failed.
    #[error("Write error for {table}: {message}")]
    Write { table: String, message: String },

    /// Post-load constraint DDL failed (non-fatal; recorded in the result).
    #[error("Constraint error for {table}: {message}")]
    Constraint { table: String, message: String },

    /// Adapter configuration was missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pre-flight rejection: unknown adapter key or source == destination.
    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    /// Postgres driver error.
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error.
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// SQL Server driver error.
    #[error("SQL Server error: {0}")]
    SqlServer(#[from] tiberius::error::Error),

    /// HTTP transport error (API sources, columnar destination).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Create a Schema error for a table.
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Read error for a table.
    pub fn read(table: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::Read {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Write error for a table.
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Constraint error for a table.
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::Constraint {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole operation rather than one table.
    pub fn is_fatal_to_operation(&self) -> bool {
        matches!(
            self,
            AdapterError::Connection(_)
                | AdapterError::Auth(_)
                | AdapterError::UnsupportedCombination(_)
        )
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_errors_carry_table_name() {
        let err = AdapterError::write("users", "duplicate key");
        assert_eq!(err.to_string(), "Write error for users: duplicate key");
    }

    #[test]
    fn test_fatality_classification() {
        assert!(AdapterError::Connection("refused".into()).is_fatal_to_operation());
        assert!(AdapterError::UnsupportedCombination("x".into()).is_fatal_to_operation());
        assert!(!AdapterError::read("t", "eof").is_fatal_to_operation());
        assert!(!AdapterError::constraint("t", "fk").is_fatal_to_operation());
    }
}
