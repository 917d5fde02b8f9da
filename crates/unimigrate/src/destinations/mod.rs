//! Destination adapter implementations.
//!
//! - [`clickhouse`]: columnar analytic store (HTTP interface)
//! - [`postgres`]: Postgres-like relational destination
//! - [`mysql`]: MySQL-like relational destination
//!
//! Each destination owns its type map, parameterised by the source family,
//! and its table namer. Type maps are total: unknown source types degrade
//! to the destination's widest string type.

pub mod clickhouse;
pub mod mysql;
pub mod postgres;

pub use clickhouse::ClickhouseDestination;
pub use mysql::MysqlDestination;
pub use postgres::PostgresDestination;

/// Translate a source column default conservatively: known engine functions
/// map 1:1, literal scalars are re-quoted, anything unrecognised is dropped
/// (the column is created without a default rather than failing creation).
pub(crate) fn translate_default(default: &str) -> Option<String> {
    let trimmed = default.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Strip Postgres-style casts: `'x'::character varying` -> `'x'`.
    let stripped = match trimmed.find("::") {
        Some(idx) => trimmed[..idx].trim(),
        None => trimmed,
    };
    let lower = stripped.to_lowercase();

    if lower.contains("nextval") {
        // Sequence-backed defaults belong to the source engine.
        return None;
    }
    if lower == "null" {
        return Some("NULL".to_string());
    }
    if lower == "true" || lower == "false" {
        return Some(lower.to_uppercase());
    }
    if lower.contains("now()")
        || lower.contains("current_timestamp")
        || lower.contains("getdate()")
        || lower.contains("getutcdate()")
        || lower.contains("sysdatetime()")
    {
        return Some("CURRENT_TIMESTAMP".to_string());
    }
    if lower == "current_date" {
        return Some("CURRENT_DATE".to_string());
    }
    if stripped.parse::<f64>().is_ok() {
        return Some(stripped.to_string());
    }
    if stripped.starts_with('\'') && stripped.ends_with('\'') && stripped.len() >= 2 {
        let inner = &stripped[1..stripped.len() - 1];
        return Some(format!("'{}'", inner.replace('\'', "''")));
    }
    // SQL Server wraps defaults in parens: (0), (N'x'), (getdate()).
    if stripped.starts_with('(') && stripped.ends_with(')') {
        let inner = stripped[1..stripped.len() - 1].trim_start_matches("N");
        return translate_default(inner);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_functions_map() {
        assert_eq!(translate_default("now()").as_deref(), Some("CURRENT_TIMESTAMP"));
        assert_eq!(
            translate_default("CURRENT_TIMESTAMP").as_deref(),
            Some("CURRENT_TIMESTAMP")
        );
        assert_eq!(
            translate_default("(getdate())").as_deref(),
            Some("CURRENT_TIMESTAMP")
        );
    }

    #[test]
    fn test_literals_requoted() {
        assert_eq!(
            translate_default("'active'::character varying").as_deref(),
            Some("'active'")
        );
        assert_eq!(translate_default("0").as_deref(), Some("0"));
        assert_eq!(translate_default("(1)").as_deref(), Some("1"));
        assert_eq!(translate_default("true").as_deref(), Some("TRUE"));
    }

    #[test]
    fn test_unrecognised_dropped() {
        assert_eq!(translate_default("nextval('users_id_seq'::regclass)"), None);
        assert_eq!(translate_default("uuid_generate_v4()"), None);
        assert_eq!(translate_default(""), None);
    }
}
