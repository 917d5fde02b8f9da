//! MySQL-like relational destination adapter.
//!
//! Creates the database on connect, preserves fixed-point precision, maps
//! UUIDs to `CHAR(36)` and arrays/JSON to `JSON`, truncates constraint
//! names to MySQL's 64-character limit with a hash suffix, and upserts via
//! `ON DUPLICATE KEY UPDATE` when a primary key is known.

use std::sync::Arc;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::schema::{ColumnDef, ForeignKey, IndexDef, MappedColumn, UniqueConstraint};
use crate::core::traits::DestinationAdapter;
use crate::core::value::{Batch, Value};
use crate::destinations::translate_default;
use crate::error::{AdapterError, Result};
use crate::identifier::{quote_mysql, truncate_constraint_name};

/// MySQL identifier length cap.
const MAX_IDENT_LEN: usize = 64;

#[derive(Debug, Clone, Deserialize)]
struct MysqlDestConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(alias = "username")]
    user: String,
    password: String,
}

fn default_port() -> u16 {
    3306
}

impl MysqlDestConfig {
    fn opts(&self, with_db: bool) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()));
        if with_db {
            builder.db_name(Some(self.database.clone())).into()
        } else {
            builder.into()
        }
    }
}

/// Destination adapter for MySQL-like engines.
#[derive(Default)]
pub struct MysqlDestination {
    conn: Option<Arc<Mutex<Conn>>>,
}

impl MysqlDestination {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<&Arc<Mutex<Conn>>> {
        self.conn
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to destination".to_string()))
    }
}

#[async_trait]
impl DestinationAdapter for MysqlDestination {
    async fn connect(&mut self, config: &serde_json::Value, _source_key: &str) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let config: MysqlDestConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid mysql dest config: {}", e)))?;

        // Bootstrap the database from a database-less connection first.
        let mut admin = Conn::new(config.opts(false))
            .await
            .map_err(|e| AdapterError::Connection(format!("mysql connect failed: {}", e)))?;
        admin
            .query_drop(format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                quote_mysql(&config.database)
            ))
            .await
            .map_err(|e| AdapterError::Connection(format!("create database failed: {}", e)))?;
        admin.disconnect().await.ok();

        let conn = Conn::new(config.opts(true))
            .await
            .map_err(|e| AdapterError::Connection(format!("mysql connect failed: {}", e)))?;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mutex) = Arc::try_unwrap(conn) {
                if let Err(e) = mutex.into_inner().disconnect().await {
                    debug!("mysql disconnect: {}", e);
                }
            }
        }
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: MysqlDestConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid mysql dest config: {}", e)))?;
        let mut conn = Conn::new(config.opts(false))
            .await
            .map_err(|e| AdapterError::Connection(format!("mysql connect failed: {}", e)))?;
        conn.query_drop("SELECT 1").await?;
        conn.disconnect().await?;
        Ok(())
    }

    fn map_types(&self, columns: &[ColumnDef], source_key: &str) -> Vec<MappedColumn> {
        columns
            .iter()
            .map(|col| MappedColumn {
                name: col.name.clone(),
                target_type: mysql_type_for(source_key, col),
                nullable: col.nullable,
                default: col.default.as_deref().and_then(translate_default),
            })
            .collect()
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[MappedColumn],
        primary_key: &[String],
    ) -> Result<()> {
        let mut defs: Vec<String> = columns
            .iter()
            .map(|col| {
                let mut def = format!("{} {}", quote_mysql(&col.name), col.target_type);
                if !col.nullable {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &col.default {
                    // TEXT/BLOB/JSON columns cannot carry literal defaults.
                    let base = col.target_type.to_uppercase();
                    if !base.starts_with("TEXT")
                        && !base.starts_with("JSON")
                        && !base.contains("BLOB")
                    {
                        def.push_str(&format!(" DEFAULT {}", default));
                    }
                }
                def
            })
            .collect();
        if !primary_key.is_empty() {
            let pk: Vec<String> = primary_key.iter().map(|c| quote_mysql(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_mysql(table),
            defs.join(", ")
        );
        info!("Creating table: {}", table);
        let mut conn = self.conn()?.lock().await;
        conn.query_drop(sql)
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        Ok(())
    }

    async fn columns_for(&self, table: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?.lock().await;
        let columns: Vec<String> = conn
            .exec(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position",
                (table,),
            )
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        Ok(columns)
    }

    async fn evolve_schema(&self, table: &str, missing: &[String]) -> Result<()> {
        // MySQL has no ADD COLUMN IF NOT EXISTS; diff against live columns.
        let existing: std::collections::HashSet<String> =
            self.columns_for(table).await?.into_iter().collect();
        let mut conn = self.conn()?.lock().await;
        for column in missing {
            if existing.contains(column) {
                continue;
            }
            debug!("Adding column {} to {}", column, table);
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT NULL",
                quote_mysql(table),
                quote_mysql(column)
            );
            conn.query_drop(sql)
                .await
                .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        }
        Ok(())
    }

    async fn write_batch(&self, table: &str, batch: &Batch, primary_key: &[String]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = batch.column_names().into_iter().collect();
        let quoted: Vec<String> = columns.iter().map(|c| quote_mysql(c)).collect();
        let marks = vec!["?"; columns.len()].join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_mysql(table),
            quoted.join(", "),
            marks
        );
        if !primary_key.is_empty() {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !primary_key.contains(c))
                .map(|c| format!("{} = VALUES({})", quote_mysql(c), quote_mysql(c)))
                .collect();
            if updates.is_empty() {
                // All columns are key columns; keep the existing row.
                sql = sql.replacen("INSERT", "INSERT IGNORE", 1);
            } else {
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")));
            }
        }

        let params: Vec<Params> = batch
            .rows
            .iter()
            .map(|row| {
                Params::Positional(
                    columns
                        .iter()
                        .map(|name| mysql_param(row.get(name).unwrap_or(&Value::Null)))
                        .collect(),
                )
            })
            .collect();

        let mut conn = self.conn()?.lock().await;
        conn.exec_batch(sql, params)
            .await
            .map_err(|e| AdapterError::write(table, e.to_string()))?;
        Ok(batch.len() as u64)
    }

    async fn create_indexes(&self, table: &str, indexes: &[IndexDef]) -> Result<()> {
        let mut conn = self.conn()?.lock().await;
        for index in indexes {
            let name = truncate_constraint_name(&index.name, MAX_IDENT_LEN);
            let columns: Vec<String> = index.columns.iter().map(|c| quote_mysql(c)).collect();
            let unique = if index.is_unique { "UNIQUE " } else { "" };
            let sql = format!(
                "CREATE {}INDEX {} ON {} ({})",
                unique,
                quote_mysql(&name),
                quote_mysql(table),
                columns.join(", ")
            );
            if let Err(e) = conn.query_drop(sql).await {
                if !is_duplicate(&e) {
                    return Err(AdapterError::constraint(table, e.to_string()));
                }
                warn!("Index {} already exists", name);
            }
        }
        Ok(())
    }

    async fn create_unique_constraints(
        &self,
        table: &str,
        constraints: &[UniqueConstraint],
    ) -> Result<()> {
        let mut conn = self.conn()?.lock().await;
        for constraint in constraints {
            let name = truncate_constraint_name(&constraint.name, MAX_IDENT_LEN);
            let columns: Vec<String> = constraint.columns.iter().map(|c| quote_mysql(c)).collect();
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                quote_mysql(table),
                quote_mysql(&name),
                columns.join(", ")
            );
            if let Err(e) = conn.query_drop(sql).await {
                if !is_duplicate(&e) {
                    return Err(AdapterError::constraint(table, e.to_string()));
                }
                warn!("Unique constraint {} already exists", name);
            }
        }
        Ok(())
    }

    async fn create_foreign_keys(&self, table: &str, fks: &[ForeignKey]) -> Result<()> {
        let mut conn = self.conn()?.lock().await;
        for fk in fks {
            let name = truncate_constraint_name(&fk.name, MAX_IDENT_LEN);
            let columns: Vec<String> = fk.columns.iter().map(|c| quote_mysql(c)).collect();
            let ref_columns: Vec<String> = fk.ref_columns.iter().map(|c| quote_mysql(c)).collect();
            let ref_table = fk.ref_table.rsplit('.').next().unwrap_or(&fk.ref_table);
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_mysql(table),
                quote_mysql(&name),
                columns.join(", "),
                quote_mysql(ref_table),
                ref_columns.join(", ")
            );
            if let Err(e) = conn.query_drop(sql).await {
                if !is_duplicate(&e) {
                    return Err(AdapterError::constraint(table, e.to_string()));
                }
                warn!("Foreign key {} already exists", name);
            }
        }
        Ok(())
    }

    fn destination_key(&self) -> &'static str {
        "mysql"
    }
}

fn is_duplicate(e: &mysql_async::Error) -> bool {
    let message = e.to_string().to_lowercase();
    message.contains("duplicate") || message.contains("already exists")
}

fn mysql_param(value: &Value) -> mysql_async::Value {
    use mysql_async::Value as M;
    match value {
        Value::Null => M::NULL,
        Value::Bool(b) => M::Int(*b as i64),
        Value::I64(i) => M::Int(*i),
        Value::F64(f) => M::Double(*f),
        Value::Decimal(d) => M::Bytes(d.to_string().into_bytes()),
        Value::Text(s) => M::Bytes(s.clone().into_bytes()),
        Value::Bytes(b) => M::Bytes(b.clone()),
        Value::Uuid(u) => M::Bytes(u.to_string().into_bytes()),
        Value::Date(d) => {
            use chrono::Datelike;
            M::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::DateTime(dt) => datetime_param(dt),
        Value::DateTimeTz(dt) => datetime_param(&dt.naive_utc()),
        Value::Json(v) => M::Bytes(v.to_string().into_bytes()),
    }
}

fn datetime_param(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    use chrono::{Datelike, Timelike};
    mysql_async::Value::Date(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
        dt.and_utc().timestamp_subsec_micros(),
    )
}

/// Per-source type map into MySQL types. Unknown types become TEXT.
fn mysql_type_for(source_key: &str, col: &ColumnDef) -> String {
    match source_key {
        "zoho" | "devops" => match col.base_type() {
            "integer" => "BIGINT".to_string(),
            "double" => "DOUBLE".to_string(),
            "boolean" => "TINYINT(1)".to_string(),
            "datetime" => "DATETIME".to_string(),
            "date" => "DATE".to_string(),
            _ => "TEXT".to_string(),
        },
        "sqlserver" => mssql_to_mysql(col),
        // Postgres-like types are the fallback relational map.
        _ => postgres_to_mysql(col),
    }
}

fn decimal(col: &ColumnDef) -> String {
    match col.precision_scale() {
        Some((p, s)) => format!("DECIMAL({},{})", p.min(65), s.min(30)),
        None => "DECIMAL(65,30)".to_string(),
    }
}

fn varchar(col: &ColumnDef) -> String {
    match col.length() {
        Some(len) if len <= 16383 => format!("VARCHAR({})", len),
        Some(_) => "TEXT".to_string(),
        None => "VARCHAR(255)".to_string(),
    }
}

fn postgres_to_mysql(col: &ColumnDef) -> String {
    let base = col.base_type().to_lowercase();
    if base.ends_with("[]") {
        return "JSON".to_string();
    }
    match base.as_str() {
        "smallint" | "smallserial" => "SMALLINT".to_string(),
        "integer" | "int" | "int4" => "INT".to_string(),
        "serial" => "INT AUTO_INCREMENT".to_string(),
        "bigint" | "int8" => "BIGINT".to_string(),
        "bigserial" => "BIGINT AUTO_INCREMENT".to_string(),
        "real" => "FLOAT".to_string(),
        "double precision" | "float8" => "DOUBLE".to_string(),
        "numeric" | "decimal" => decimal(col),
        "money" => "DECIMAL(19,4)".to_string(),
        "boolean" | "bool" => "TINYINT(1)".to_string(),
        "varchar" | "character varying" => varchar(col),
        "char" | "character" => match col.length() {
            Some(len) if len <= 255 => format!("CHAR({})", len),
            _ => varchar(col),
        },
        "text" => "TEXT".to_string(),
        "timestamp" | "timestamp without time zone" | "timestamp with time zone"
        | "timestamptz" => "DATETIME".to_string(),
        "date" => "DATE".to_string(),
        "time" | "time without time zone" | "time with time zone" => "TIME".to_string(),
        "interval" => "VARCHAR(100)".to_string(),
        "bytea" => "LONGBLOB".to_string(),
        "json" | "jsonb" => "JSON".to_string(),
        "uuid" => "CHAR(36)".to_string(),
        _ => "TEXT".to_string(),
    }
}

fn mssql_to_mysql(col: &ColumnDef) -> String {
    let base = col.base_type().to_lowercase();
    let is_max = col.source_type.to_lowercase().contains("(max)");
    match base.as_str() {
        "tinyint" => "TINYINT UNSIGNED".to_string(),
        "smallint" => "SMALLINT".to_string(),
        "int" => "INT".to_string(),
        "bigint" => "BIGINT".to_string(),
        "bit" => "TINYINT(1)".to_string(),
        "real" => "FLOAT".to_string(),
        "float" => "DOUBLE".to_string(),
        "decimal" | "numeric" => decimal(col),
        "money" | "smallmoney" => "DECIMAL(19,4)".to_string(),
        "varchar" | "nvarchar" => {
            if is_max {
                "LONGTEXT".to_string()
            } else {
                varchar(col)
            }
        }
        "char" | "nchar" => match col.length() {
            Some(len) if len <= 255 => format!("CHAR({})", len),
            _ => varchar(col),
        },
        "text" | "ntext" | "xml" => "LONGTEXT".to_string(),
        "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => "DATETIME".to_string(),
        "date" => "DATE".to_string(),
        "time" => "TIME".to_string(),
        "uniqueidentifier" => "CHAR(36)".to_string(),
        "binary" | "varbinary" | "image" => "LONGBLOB".to_string(),
        _ => "TEXT".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, source_type: &str, nullable: bool) -> ColumnDef {
        ColumnDef::new(name, source_type, nullable)
    }

    #[test]
    fn test_postgres_type_map() {
        let dest = MysqlDestination::new();
        let mapped = dest.map_types(
            &[
                col("id", "serial", false),
                col("tags", "text[]", true),
                col("payload", "jsonb", true),
                col("key", "uuid", false),
                col("amount", "numeric(12,4)", true),
            ],
            "postgresql",
        );
        assert_eq!(mapped[0].target_type, "INT AUTO_INCREMENT");
        assert_eq!(mapped[1].target_type, "JSON");
        assert_eq!(mapped[2].target_type, "JSON");
        assert_eq!(mapped[3].target_type, "CHAR(36)");
        assert_eq!(mapped[4].target_type, "DECIMAL(12,4)");
    }

    #[test]
    fn test_varchar_length_preserved() {
        let dest = MysqlDestination::new();
        let mapped = dest.map_types(&[col("name", "varchar(50)", true)], "postgresql");
        assert_eq!(mapped[0].target_type, "VARCHAR(50)");
        let mapped = dest.map_types(&[col("blob", "varchar(100000)", true)], "postgresql");
        assert_eq!(mapped[0].target_type, "TEXT");
    }

    #[test]
    fn test_mysql_param_conversions() {
        assert_eq!(mysql_param(&Value::Null), mysql_async::Value::NULL);
        assert_eq!(mysql_param(&Value::Bool(true)), mysql_async::Value::Int(1));
        assert_eq!(
            mysql_param(&Value::Text("x".into())),
            mysql_async::Value::Bytes(b"x".to_vec())
        );
        assert!(matches!(
            mysql_param(&Value::DateTime(
                chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(3, 4, 5)
                    .unwrap()
            )),
            mysql_async::Value::Date(2024, 1, 2, 3, 4, 5, _)
        ));
    }

    #[test]
    fn test_unknown_type_degrades_to_text() {
        let dest = MysqlDestination::new();
        let mapped = dest.map_types(&[col("geo", "geometry", true)], "sqlserver");
        assert_eq!(mapped[0].target_type, "TEXT");
    }
}
