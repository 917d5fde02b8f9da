//! Source adapter implementations.
//!
//! - [`postgres`]: Postgres-like relational source
//! - [`mysql`]: MySQL-like relational source
//! - [`sqlserver`]: SQL Server-like enterprise relational source
//! - [`zoho`]: SaaS CRM API source (OAuth refresh-token protected)
//! - [`devops`]: DevOps work-item API source (personal-token protected)

pub mod devops;
pub mod mysql;
pub mod postgres;
pub mod sqlserver;
pub mod zoho;

pub use devops::DevopsSource;
pub use mysql::MysqlSource;
pub use postgres::PostgresSource;
pub use sqlserver::SqlServerSource;
pub use zoho::ZohoSource;

use std::time::Duration;

/// Transient API failures are retried up to this many times per page.
pub(crate) const MAX_REQUEST_RETRIES: usize = 3;

/// Exponential backoff delay for API request retries: 2s, 4s, 8s.
pub(crate) fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt as u32 + 1))
}

/// Split a possibly schema-qualified identifier into (schema, table).
pub(crate) fn split_qualified(table: &str, default_schema: &str) -> (String, String) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => (default_schema.to_string(), table.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded_exponential() {
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
        assert_eq!(backoff_delay(1), Duration::from_secs(4));
        assert_eq!(backoff_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(
            split_qualified("public.users", "public"),
            ("public".into(), "users".into())
        );
        assert_eq!(
            split_qualified("users", "dbo"),
            ("dbo".into(), "users".into())
        );
    }
}
