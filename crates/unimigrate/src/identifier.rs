//! Identifier quoting and sanitization helpers.
//!
//! API field names arrive with arbitrary characters (`$`, spaces, unicode);
//! destinations get a sanitized, deduplicated identifier. Relational
//! identifiers are quoted per engine.

use sha2::{Digest, Sha256};

/// Quote an identifier for PostgreSQL (`"name"`).
pub fn quote_pg(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an identifier for MySQL (`` `name` ``).
pub fn quote_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote an identifier for SQL Server (`[name]`).
pub fn quote_mssql(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote an identifier for ClickHouse (backticks).
pub fn quote_clickhouse(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

/// Convert an arbitrary field name into a safe column identifier:
/// non-alphanumeric characters become `_`, runs collapse, and a leading
/// digit gets a `col_` prefix. Empty input becomes `field`.
pub fn sanitize_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    let mut result = if trimmed.is_empty() {
        "field".to_string()
    } else {
        trimmed.to_string()
    };
    if result.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        result = format!("col_{}", result);
    }
    result
}

/// Sanitize a name, appending `_2`, `_3`, ... when the sanitized form
/// collides with an already-used identifier.
pub fn sanitize_unique(name: &str, used: &mut std::collections::HashSet<String>) -> String {
    let base = sanitize_column_name(name);
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

/// Truncate a constraint name to `max_len`, keeping uniqueness with a short
/// hash suffix. MySQL caps identifier length at 64.
pub fn truncate_constraint_name(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let keep = max_len.saturating_sub(9);
    format!("{}_{}", &name[..keep], &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_pg("users"), "\"users\"");
        assert_eq!(quote_mysql("users"), "`users`");
        assert_eq!(quote_mssql("users"), "[users]");
        assert_eq!(quote_pg("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_sanitize_column_name() {
        assert_eq!(sanitize_column_name("Email Address"), "Email_Address");
        assert_eq!(sanitize_column_name("$currency_symbol"), "currency_symbol");
        assert_eq!(sanitize_column_name("System.Title"), "System_Title");
        assert_eq!(sanitize_column_name("123abc"), "col_123abc");
        assert_eq!(sanitize_column_name("!!!"), "field");
    }

    #[test]
    fn test_sanitize_unique_dedups() {
        let mut used = HashSet::new();
        assert_eq!(sanitize_unique("a b", &mut used), "a_b");
        assert_eq!(sanitize_unique("a-b", &mut used), "a_b_2");
        assert_eq!(sanitize_unique("a.b", &mut used), "a_b_3");
    }

    #[test]
    fn test_truncate_constraint_name() {
        let short = "fk_orders_users";
        assert_eq!(truncate_constraint_name(short, 64), short);

        let long = "fk_".repeat(40);
        let truncated = truncate_constraint_name(&long, 64);
        assert_eq!(truncated.len(), 64);
        // Same input truncates identically, different inputs diverge.
        assert_eq!(truncated, truncate_constraint_name(&long, 64));
        let other = format!("{}x", long);
        assert_ne!(truncated, truncate_constraint_name(&other, 64));
    }
}
