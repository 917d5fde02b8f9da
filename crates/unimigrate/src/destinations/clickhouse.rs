//! Columnar analytic destination over the ClickHouse HTTP interface.
//!
//! Created tables are prefixed by source family (`REL_` for relational
//! sources, a per-source prefix for each API source) so multiple sources
//! coexist in one database unambiguously.
//!
//! When the source reports a primary key the table uses
//! `ReplacingMergeTree ORDER BY (pk)`, so re-runs dedup on merge and
//! retries stay idempotent; without a key the table is a plain
//! `MergeTree ORDER BY tuple()` append target.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::core::schema::{ColumnDef, MappedColumn};
use crate::core::traits::DestinationAdapter;
use crate::core::value::Batch;
use crate::error::{AdapterError, Result};
use crate::identifier::{quote_clickhouse, sanitize_column_name, sanitize_unique};

#[derive(Debug, Clone, Deserialize)]
struct ClickhouseConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(default = "default_user", alias = "username")]
    user: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    secure: bool,
}

fn default_port() -> u16 {
    8123
}

fn default_user() -> String {
    "default".to_string()
}

impl ClickhouseConfig {
    fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Destination adapter for a ClickHouse-like columnar store.
#[derive(Default)]
pub struct ClickhouseDestination {
    http: Option<reqwest::Client>,
    config: Option<ClickhouseConfig>,
}

impl ClickhouseDestination {
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&ClickhouseConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to destination".to_string()))
    }

    fn http(&self) -> reqwest::Client {
        self.http.clone().unwrap_or_default()
    }

    /// Run a statement with the configured database as context and return
    /// the raw response body.
    async fn execute(&self, query: &str) -> Result<String> {
        let config = self.config()?;
        self.execute_on(config, Some(&config.database), query).await
    }

    async fn execute_on(
        &self,
        config: &ClickhouseConfig,
        database: Option<&str>,
        query: &str,
    ) -> Result<String> {
        let mut request = self
            .http()
            .post(config.base_url())
            .header("X-ClickHouse-User", &config.user)
            .header("X-ClickHouse-Key", &config.password)
            .body(query.to_string());
        if let Some(db) = database {
            request = request.query(&[("database", db)]);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AdapterError::Write {
                table: String::new(),
                message: format!("clickhouse returned {}: {}", status, body.trim()),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl DestinationAdapter for ClickhouseDestination {
    async fn connect(&mut self, config: &serde_json::Value, _source_key: &str) -> Result<()> {
        if self.config.is_some() {
            return Ok(());
        }
        let config: ClickhouseConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid clickhouse config: {}", e)))?;
        self.http = Some(reqwest::Client::new());

        // Database bootstrap runs without a database context.
        let create = format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_clickhouse(&config.database)
        );
        self.execute_on(&config, None, &create)
            .await
            .map_err(|e| AdapterError::Connection(format!("clickhouse connect failed: {}", e)))?;
        self.config = Some(config);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.config = None;
        self.http = None;
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: ClickhouseConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid clickhouse config: {}", e)))?;
        let response = reqwest::Client::new()
            .post(config.base_url())
            .header("X-ClickHouse-User", &config.user)
            .header("X-ClickHouse-Key", &config.password)
            .body("SELECT 1")
            .send()
            .await
            .map_err(|e| AdapterError::Connection(format!("clickhouse unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(AdapterError::Connection(format!(
                "clickhouse returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn map_types(&self, columns: &[ColumnDef], source_key: &str) -> Vec<MappedColumn> {
        let mut used = HashSet::new();
        columns
            .iter()
            .map(|col| {
                let base = clickhouse_type_for(source_key, col);
                let target_type = if col.nullable {
                    format!("Nullable({})", base)
                } else {
                    base
                };
                MappedColumn {
                    name: sanitize_unique(&col.name, &mut used),
                    target_type,
                    nullable: col.nullable,
                    // Columnar tables here carry no column defaults.
                    default: None,
                }
            })
            .collect()
    }

    fn table_name(&self, source_table: &str, source_key: &str) -> String {
        let base = source_table.rsplit('.').next().unwrap_or(source_table);
        match source_key {
            "zoho" => format!("zoho_{}", base.to_lowercase()),
            "devops" => format!("devops_{}", base.to_lowercase()),
            _ => format!("REL_{}", base),
        }
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[MappedColumn],
        primary_key: &[String],
    ) -> Result<()> {
        // Sorting-key columns cannot be Nullable; API-source keys arrive
        // nullable and get the wrapper stripped here.
        let pk_names: HashSet<String> = primary_key
            .iter()
            .map(|name| sanitize_column_name(name))
            .collect();
        let column_defs: Vec<String> = columns
            .iter()
            .map(|col| {
                let target_type = if pk_names.contains(&col.name) {
                    strip_nullable(&col.target_type)
                } else {
                    col.target_type.clone()
                };
                format!("{} {}", quote_clickhouse(&col.name), target_type)
            })
            .collect();

        let pk: Vec<String> = primary_key
            .iter()
            .map(|name| quote_clickhouse(&sanitize_column_name(name)))
            .collect();
        let engine = if pk.is_empty() {
            "MergeTree() ORDER BY tuple()".to_string()
        } else {
            format!("ReplacingMergeTree() ORDER BY ({})", pk.join(", "))
        };

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {}",
            quote_clickhouse(table),
            column_defs.join(", "),
            engine
        );
        info!("Creating table: {}", table);
        self.execute(&sql)
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        Ok(())
    }

    async fn columns_for(&self, table: &str) -> Result<Vec<String>> {
        let body = self
            .execute(&format!(
                "DESCRIBE TABLE {} FORMAT JSONEachRow",
                quote_clickhouse(table)
            ))
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;

        #[derive(Deserialize)]
        struct DescribeRow {
            name: String,
        }
        let mut names = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: DescribeRow = serde_json::from_str(line)
                .map_err(|e| AdapterError::schema(table, format!("bad describe row: {}", e)))?;
            names.push(row.name);
        }
        Ok(names)
    }

    async fn evolve_schema(&self, table: &str, missing: &[String]) -> Result<()> {
        for field in missing {
            let column = sanitize_column_name(field);
            debug!("Adding column {} to {}", column, table);
            self.execute(&format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} Nullable(String)",
                quote_clickhouse(table),
                quote_clickhouse(&column)
            ))
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        }
        Ok(())
    }

    async fn write_batch(&self, table: &str, batch: &Batch, _primary_key: &[String]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut body = String::new();
        for row in &batch.rows {
            let object: serde_json::Map<String, serde_json::Value> = row
                .iter()
                .map(|(key, value)| {
                    Ok((
                        sanitize_column_name(key),
                        serde_json::to_value(value)?,
                    ))
                })
                .collect::<Result<_>>()?;
            body.push_str(&serde_json::to_string(&object)?);
            body.push('\n');
        }

        let config = self.config()?;
        let query = format!(
            "INSERT INTO {} FORMAT JSONEachRow",
            quote_clickhouse(table)
        );
        let response = self
            .http()
            .post(config.base_url())
            .header("X-ClickHouse-User", &config.user)
            .header("X-ClickHouse-Key", &config.password)
            .query(&[
                ("database", config.database.as_str()),
                ("query", query.as_str()),
                // Tolerate rows narrower/wider than the table during
                // mid-stream schema evolution.
                ("input_format_skip_unknown_fields", "1"),
            ])
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::write(
                table,
                format!("insert returned {}: {}", status, detail.trim()),
            ));
        }
        Ok(batch.len() as u64)
    }

    fn destination_key(&self) -> &'static str {
        "clickhouse"
    }
}

fn strip_nullable(target_type: &str) -> String {
    target_type
        .strip_prefix("Nullable(")
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(target_type)
        .to_string()
}

/// Per-source type map into ClickHouse types. Unknown types become String.
fn clickhouse_type_for(source_key: &str, col: &ColumnDef) -> String {
    let base = col.base_type().to_lowercase();
    match source_key {
        "zoho" | "devops" => match base.as_str() {
            "integer" | "bigint" => "Int64".to_string(),
            "double" => "Float64".to_string(),
            "boolean" => "UInt8".to_string(),
            "datetime" => "DateTime".to_string(),
            "date" => "Date".to_string(),
            _ => "String".to_string(),
        },
        "mysql" => mysql_to_clickhouse(&base, col),
        "sqlserver" => mssql_to_clickhouse(&base, col),
        // Postgres-like types are the fallback relational map.
        _ => postgres_to_clickhouse(&base, col),
    }
}

fn decimal_type(col: &ColumnDef) -> String {
    match col.precision_scale() {
        Some((precision, scale)) => format!("Decimal({},{})", precision, scale),
        None => "Decimal64(2)".to_string(),
    }
}

fn postgres_to_clickhouse(base: &str, col: &ColumnDef) -> String {
    if base.ends_with("[]") {
        return "String".to_string();
    }
    match base {
        "smallint" | "smallserial" => "Int16".to_string(),
        "integer" | "int" | "int4" | "serial" => "Int32".to_string(),
        "bigint" | "int8" | "bigserial" => "Int64".to_string(),
        "real" => "Float32".to_string(),
        "double precision" | "float8" => "Float64".to_string(),
        "numeric" | "decimal" | "money" => decimal_type(col),
        "boolean" | "bool" => "UInt8".to_string(),
        "timestamp" | "timestamp without time zone" | "timestamp with time zone"
        | "timestamptz" => "DateTime".to_string(),
        "date" => "Date".to_string(),
        "uuid" => "UUID".to_string(),
        "varchar" | "character varying" | "char" | "character" | "text" | "json" | "jsonb"
        | "bytea" | "interval" | "time" | "time without time zone" | "time with time zone" => {
            "String".to_string()
        }
        _ => "String".to_string(),
    }
}

fn mysql_to_clickhouse(base: &str, col: &ColumnDef) -> String {
    let unsigned = col.source_type.to_lowercase().contains("unsigned");
    match base {
        "tinyint" => {
            // tinyint(1) is the MySQL boolean idiom.
            if col.length() == Some(1) {
                "UInt8".to_string()
            } else if unsigned {
                "UInt8".to_string()
            } else {
                "Int8".to_string()
            }
        }
        "smallint" => if unsigned { "UInt16" } else { "Int16" }.to_string(),
        "mediumint" | "int" | "integer" => if unsigned { "UInt32" } else { "Int32" }.to_string(),
        "bigint" => if unsigned { "UInt64" } else { "Int64" }.to_string(),
        "float" => "Float32".to_string(),
        "double" => "Float64".to_string(),
        "decimal" | "numeric" => decimal_type(col),
        "datetime" | "timestamp" => "DateTime".to_string(),
        "date" => "Date".to_string(),
        _ => "String".to_string(),
    }
}

fn mssql_to_clickhouse(base: &str, col: &ColumnDef) -> String {
    match base {
        "tinyint" => "UInt8".to_string(),
        "smallint" => "Int16".to_string(),
        "int" => "Int32".to_string(),
        "bigint" => "Int64".to_string(),
        "bit" => "UInt8".to_string(),
        "real" => "Float32".to_string(),
        "float" => "Float64".to_string(),
        "decimal" | "numeric" => decimal_type(col),
        "money" | "smallmoney" => "Decimal(19,4)".to_string(),
        "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => "DateTime".to_string(),
        "date" => "Date".to_string(),
        "uniqueidentifier" => "UUID".to_string(),
        _ => "String".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, source_type: &str, nullable: bool) -> ColumnDef {
        ColumnDef::new(name, source_type, nullable)
    }

    #[test]
    fn test_relational_prefix() {
        let dest = ClickhouseDestination::new();
        assert_eq!(dest.table_name("public.users", "postgresql"), "REL_users");
        assert_eq!(dest.table_name("dbo.Orders", "sqlserver"), "REL_Orders");
    }

    #[test]
    fn test_api_prefixes() {
        let dest = ClickhouseDestination::new();
        assert_eq!(dest.table_name("Contacts", "zoho"), "zoho_contacts");
        assert_eq!(dest.table_name("work_items", "devops"), "devops_work_items");
    }

    #[test]
    fn test_postgres_type_map() {
        let dest = ClickhouseDestination::new();
        let mapped = dest.map_types(
            &[
                col("id", "integer", false),
                col("name", "varchar(50)", true),
                col("created", "timestamp", false),
            ],
            "postgresql",
        );
        assert_eq!(mapped[0].target_type, "Int32");
        assert_eq!(mapped[1].target_type, "Nullable(String)");
        assert_eq!(mapped[2].target_type, "DateTime");
    }

    #[test]
    fn test_decimal_precision_preserved() {
        let dest = ClickhouseDestination::new();
        let mapped = dest.map_types(&[col("amount", "numeric(12,4)", true)], "postgresql");
        assert_eq!(mapped[0].target_type, "Nullable(Decimal(12,4))");
    }

    #[test]
    fn test_unknown_type_degrades_to_string() {
        let dest = ClickhouseDestination::new();
        let mapped = dest.map_types(&[col("geo", "geography", true)], "postgresql");
        assert_eq!(mapped[0].target_type, "Nullable(String)");
    }

    #[test]
    fn test_api_fields_sanitized_and_deduped() {
        let dest = ClickhouseDestination::new();
        let mapped = dest.map_types(
            &[
                col("$currency_symbol", "string", true),
                col("currency symbol", "string", true),
            ],
            "zoho",
        );
        assert_eq!(mapped[0].name, "currency_symbol");
        assert_eq!(mapped[1].name, "currency_symbol_2");
    }

    #[test]
    fn test_primary_key_columns_lose_nullable_wrapper() {
        assert_eq!(strip_nullable("Nullable(String)"), "String");
        assert_eq!(strip_nullable("Int64"), "Int64");
    }

    #[test]
    fn test_mysql_unsigned_widening() {
        let dest = ClickhouseDestination::new();
        let mapped = dest.map_types(&[col("n", "int(10) unsigned", false)], "mysql");
        assert_eq!(mapped[0].target_type, "UInt32");
        let mapped = dest.map_types(&[col("flag", "tinyint(1)", false)], "mysql");
        assert_eq!(mapped[0].target_type, "UInt8");
    }
}
