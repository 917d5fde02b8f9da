//! Postgres-like relational destination adapter.
//!
//! Creates the target database if missing, maps source types with
//! precision preserved, translates defaults conservatively, and writes
//! batches as multi-row INSERTs — upserts via `ON CONFLICT` when a primary
//! key is known.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::NaiveDateTime;
use serde::Deserialize;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::core::schema::{ColumnDef, ForeignKey, IndexDef, MappedColumn, UniqueConstraint};
use crate::core::traits::DestinationAdapter;
use crate::core::value::{Batch, Value};
use crate::destinations::translate_default;
use crate::error::{AdapterError, Result};
use crate::identifier::quote_pg;

#[derive(Debug, Clone, Deserialize)]
struct PostgresDestConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(alias = "username")]
    user: String,
    password: String,
}

fn default_port() -> u16 {
    5432
}

impl PostgresDestConfig {
    fn connection_string(&self, database: &str) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, database, self.user, self.password
        )
    }
}

/// NULL placeholder for rows narrower than the batch's column union.
static NULL_VALUE: Value = Value::Null;

/// Destination adapter for Postgres-like engines.
#[derive(Default)]
pub struct PostgresDestination {
    client: Option<Arc<Client>>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl PostgresDestination {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Arc<Client>> {
        self.client
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to destination".to_string()))
    }

    async fn open(conn_string: &str) -> Result<(Client, tokio::task::JoinHandle<()>)> {
        let (client, connection) = tokio_postgres::connect(conn_string, NoTls)
            .await
            .map_err(|e| AdapterError::Connection(format!("postgres connect failed: {}", e)))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection closed: {}", e);
            }
        });
        Ok((client, driver))
    }

    /// Connect to the target database, creating it from the maintenance
    /// database when it does not exist yet.
    async fn open_or_create(config: &PostgresDestConfig) -> Result<(Client, tokio::task::JoinHandle<()>)> {
        match Self::open(&config.connection_string(&config.database)).await {
            Ok(pair) => Ok(pair),
            Err(first_error) => {
                info!(
                    "Database {} not reachable, attempting to create it",
                    config.database
                );
                let (admin, admin_driver) =
                    Self::open(&config.connection_string("postgres")).await.map_err(|_| first_error)?;
                let create = format!("CREATE DATABASE {}", quote_pg(&config.database));
                if let Err(e) = admin.execute(&create, &[]).await {
                    // Lost a create race or the original failure was
                    // something else entirely; surface it unless the
                    // database exists now.
                    debug!("create database: {}", e);
                }
                admin_driver.abort();
                Self::open(&config.connection_string(&config.database)).await
            }
        }
    }
}

#[async_trait]
impl DestinationAdapter for PostgresDestination {
    async fn connect(&mut self, config: &serde_json::Value, _source_key: &str) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let config: PostgresDestConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid postgres dest config: {}", e)))?;
        let (client, driver) = Self::open_or_create(&config).await?;
        self.client = Some(Arc::new(client));
        self.driver = Some(driver);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: PostgresDestConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid postgres dest config: {}", e)))?;
        let (client, driver) = Self::open(&config.connection_string(&config.database)).await?;
        let result = client.simple_query("SELECT 1").await;
        driver.abort();
        result?;
        Ok(())
    }

    fn map_types(&self, columns: &[ColumnDef], source_key: &str) -> Vec<MappedColumn> {
        columns
            .iter()
            .map(|col| MappedColumn {
                name: col.name.clone(),
                target_type: postgres_type_for(source_key, col),
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
                let mut def = format!("{} {}", quote_pg(&col.name), col.target_type);
                if !col.nullable {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &col.default {
                    def.push_str(&format!(" DEFAULT {}", default));
                }
                def
            })
            .collect();
        if !primary_key.is_empty() {
            let pk: Vec<String> = primary_key.iter().map(|c| quote_pg(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_pg(table),
            defs.join(", ")
        );
        info!("Creating table: {}", table);
        self.client()?
            .execute(&sql, &[])
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        Ok(())
    }

    async fn columns_for(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client()?
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn evolve_schema(&self, table: &str, missing: &[String]) -> Result<()> {
        for column in missing {
            debug!("Adding column {} to {}", column, table);
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} text",
                quote_pg(table),
                quote_pg(column)
            );
            self.client()?
                .execute(&sql, &[])
                .await
                .map_err(|e| AdapterError::schema(table, e.to_string()))?;
        }
        Ok(())
    }

    async fn write_batch(&self, table: &str, batch: &Batch, primary_key: &[String]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let client = self.client()?;
        let columns: Vec<String> = batch.column_names().into_iter().collect();

        // Column types drive parameter encoding.
        let type_rows = client
            .query(
                "SELECT column_name, udt_name FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1",
                &[&table],
            )
            .await
            .map_err(|e| AdapterError::write(table, e.to_string()))?;
        let column_types: std::collections::HashMap<String, String> = type_rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect();

        let quoted: Vec<String> = columns.iter().map(|c| quote_pg(c)).collect();
        let mut placeholders = Vec::with_capacity(batch.len());
        let mut params: Vec<PgParam<'_>> = Vec::with_capacity(batch.len() * columns.len());
        let mut idx = 1usize;
        for row in &batch.rows {
            let marks: Vec<String> = columns
                .iter()
                .map(|name| {
                    let mark = format!("${}", idx);
                    idx += 1;
                    let value = row.get(name).unwrap_or(&NULL_VALUE);
                    params.push(PgParam {
                        value,
                        udt: column_types.get(name).map(String::as_str).unwrap_or("text"),
                    });
                    mark
                })
                .collect();
            placeholders.push(format!("({})", marks.join(", ")));
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_pg(table),
            quoted.join(", "),
            placeholders.join(", ")
        );
        if !primary_key.is_empty() {
            let pk: Vec<String> = primary_key.iter().map(|c| quote_pg(c)).collect();
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !primary_key.contains(c))
                .map(|c| format!("{} = EXCLUDED.{}", quote_pg(c), quote_pg(c)))
                .collect();
            if updates.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", pk.join(", ")));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    pk.join(", "),
                    updates.join(", ")
                ));
            }
        }

        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        client
            .execute(&sql, &param_refs)
            .await
            .map_err(|e| AdapterError::write(table, e.to_string()))?;
        Ok(batch.len() as u64)
    }

    async fn create_indexes(&self, table: &str, indexes: &[IndexDef]) -> Result<()> {
        for index in indexes {
            let columns: Vec<String> = index.columns.iter().map(|c| quote_pg(c)).collect();
            let unique = if index.is_unique { "UNIQUE " } else { "" };
            let sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                unique,
                quote_pg(&index.name),
                quote_pg(table),
                columns.join(", ")
            );
            self.client()?
                .execute(&sql, &[])
                .await
                .map_err(|e| AdapterError::constraint(table, e.to_string()))?;
        }
        Ok(())
    }

    async fn create_unique_constraints(
        &self,
        table: &str,
        constraints: &[UniqueConstraint],
    ) -> Result<()> {
        for constraint in constraints {
            let columns: Vec<String> = constraint.columns.iter().map(|c| quote_pg(c)).collect();
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                quote_pg(table),
                quote_pg(&constraint.name),
                columns.join(", ")
            );
            if let Err(e) = self.client()?.execute(&sql, &[]).await {
                // Re-runs hit "already exists"; anything else is reported.
                if !e.to_string().contains("already exists") {
                    return Err(AdapterError::constraint(table, e.to_string()));
                }
                warn!("Unique constraint {} already exists", constraint.name);
            }
        }
        Ok(())
    }

    async fn create_foreign_keys(&self, table: &str, fks: &[ForeignKey]) -> Result<()> {
        for fk in fks {
            let columns: Vec<String> = fk.columns.iter().map(|c| quote_pg(c)).collect();
            let ref_columns: Vec<String> = fk.ref_columns.iter().map(|c| quote_pg(c)).collect();
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_pg(table),
                quote_pg(&fk.name),
                columns.join(", "),
                quote_pg(&fk.ref_table),
                ref_columns.join(", ")
            );
            if let Err(e) = self.client()?.execute(&sql, &[]).await {
                if !e.to_string().contains("already exists") {
                    return Err(AdapterError::constraint(table, e.to_string()));
                }
                warn!("Foreign key {} already exists", fk.name);
            }
        }
        Ok(())
    }

    fn destination_key(&self) -> &'static str {
        "postgresql"
    }
}

/// A [`Value`] bound as a query parameter, encoded according to the live
/// destination column type rather than the value's own shape. Values that
/// cannot be coerced encode as NULL, matching the permissive write path of
/// the rest of the adapter.
#[derive(Debug)]
struct PgParam<'a> {
    value: &'a Value,
    udt: &'a str,
}

impl PgParam<'_> {
    fn as_i64(&self) -> Option<i64> {
        match self.value {
            Value::I64(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::F64(f) => Some(*f as i64),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self.value {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Decimal(d) => d.to_string().parse().ok(),
            _ => None,
        }
    }

    fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self.value {
            Value::DateTime(dt) => Some(*dt),
            Value::DateTimeTz(dt) => Some(dt.naive_utc()),
            Value::Date(d) => d.and_hms_opt(0, 0, 0),
            Value::Text(s) => parse_datetime(s),
            _ => None,
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

impl ToSql for PgParam<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        if self.value.is_null() {
            return Ok(IsNull::Yes);
        }
        match self.udt {
            "int2" => match self.as_i64() {
                Some(v) => (v as i16).to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "int4" => match self.as_i64() {
                Some(v) => (v as i32).to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "int8" => match self.as_i64() {
                Some(v) => v.to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "float4" => match self.as_f64() {
                Some(v) => (v as f32).to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "float8" => match self.as_f64() {
                Some(v) => v.to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "numeric" => match self.value {
                Value::Decimal(d) => d.to_sql(ty, out),
                _ => match self
                    .value
                    .to_text()
                    .parse::<rust_decimal::Decimal>()
                {
                    Ok(d) => d.to_sql(ty, out),
                    Err(_) => Ok(IsNull::Yes),
                },
            },
            "bool" => match self.value {
                Value::Bool(b) => b.to_sql(ty, out),
                Value::I64(i) => (*i != 0).to_sql(ty, out),
                Value::Text(s) => match s.parse::<bool>() {
                    Ok(b) => b.to_sql(ty, out),
                    Err(_) => Ok(IsNull::Yes),
                },
                _ => Ok(IsNull::Yes),
            },
            "timestamp" => match self.as_datetime() {
                Some(dt) => dt.to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "timestamptz" => match self.as_datetime() {
                Some(dt) => dt.and_utc().to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
            "date" => match self.value {
                Value::Date(d) => d.to_sql(ty, out),
                _ => match self.as_datetime() {
                    Some(dt) => dt.date().to_sql(ty, out),
                    None => Ok(IsNull::Yes),
                },
            },
            "uuid" => match self.value {
                Value::Uuid(u) => u.to_sql(ty, out),
                Value::Text(s) => match s.parse::<uuid::Uuid>() {
                    Ok(u) => u.to_sql(ty, out),
                    Err(_) => Ok(IsNull::Yes),
                },
                _ => Ok(IsNull::Yes),
            },
            "json" | "jsonb" => match self.value {
                Value::Json(v) => v.to_sql(ty, out),
                other => serde_json::json!(other.to_text()).to_sql(ty, out),
            },
            "bytea" => match self.value {
                Value::Bytes(b) => b.as_slice().to_sql(ty, out),
                other => other.to_text().into_bytes().to_sql(ty, out),
            },
            // text, varchar, and anything unknown take the textual form.
            _ => self.value.to_text().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Per-source type map into Postgres types. Unknown types become text.
fn postgres_type_for(source_key: &str, col: &ColumnDef) -> String {
    match source_key {
        "zoho" | "devops" => match col.base_type() {
            "integer" => "bigint".to_string(),
            "double" => "double precision".to_string(),
            "boolean" => "boolean".to_string(),
            "datetime" => "timestamp".to_string(),
            "date" => "date".to_string(),
            _ => "text".to_string(),
        },
        "mysql" => mysql_to_postgres(col),
        "sqlserver" => mssql_to_postgres(col),
        _ => "text".to_string(),
    }
}

fn sized(type_name: &str, col: &ColumnDef) -> String {
    match col.length() {
        Some(len) => format!("{}({})", type_name, len),
        None => "text".to_string(),
    }
}

fn numeric(col: &ColumnDef) -> String {
    match col.precision_scale() {
        Some((p, s)) => format!("numeric({},{})", p, s),
        None => "numeric".to_string(),
    }
}

fn mysql_to_postgres(col: &ColumnDef) -> String {
    let base = col.base_type().to_lowercase();
    let unsigned = col.source_type.to_lowercase().contains("unsigned");
    match base.as_str() {
        "tinyint" => {
            if col.length() == Some(1) {
                "boolean".to_string()
            } else {
                "smallint".to_string()
            }
        }
        "smallint" => if unsigned { "integer" } else { "smallint" }.to_string(),
        "mediumint" | "int" | "integer" => if unsigned { "bigint" } else { "integer" }.to_string(),
        "bigint" => if unsigned { "numeric(20,0)" } else { "bigint" }.to_string(),
        "float" => "real".to_string(),
        "double" => "double precision".to_string(),
        "decimal" | "numeric" => numeric(col),
        "varchar" => sized("varchar", col),
        "char" => sized("char", col),
        "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" => "text".to_string(),
        "datetime" | "timestamp" => "timestamp".to_string(),
        "date" => "date".to_string(),
        "time" => "time".to_string(),
        "json" => "jsonb".to_string(),
        "tinyblob" | "blob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
            "bytea".to_string()
        }
        _ => "text".to_string(),
    }
}

fn mssql_to_postgres(col: &ColumnDef) -> String {
    let base = col.base_type().to_lowercase();
    let is_max = col.source_type.to_lowercase().contains("(max)");
    match base.as_str() {
        "tinyint" | "smallint" => "smallint".to_string(),
        "int" => "integer".to_string(),
        "bigint" => "bigint".to_string(),
        "bit" => "boolean".to_string(),
        "real" => "real".to_string(),
        "float" => "double precision".to_string(),
        "decimal" | "numeric" => numeric(col),
        "money" | "smallmoney" => "numeric(19,4)".to_string(),
        "varchar" | "nvarchar" => {
            if is_max {
                "text".to_string()
            } else {
                sized("varchar", col)
            }
        }
        "char" | "nchar" => sized("char", col),
        "text" | "ntext" | "xml" => "text".to_string(),
        "datetime" | "datetime2" | "smalldatetime" => "timestamp".to_string(),
        "datetimeoffset" => "timestamptz".to_string(),
        "date" => "date".to_string(),
        "time" => "time".to_string(),
        "uniqueidentifier" => "uuid".to_string(),
        "binary" | "varbinary" | "image" => "bytea".to_string(),
        _ => "text".to_string(),
    }
}
