//! SQL Server-like enterprise relational source adapter.
//!
//! Supports named instances (resolved via the SQL Browser service) and both
//! SQL and Windows authentication. Tables are listed across all non-system
//! schemas and identified as `schema.table`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::warn;

use crate::core::schema::{ColumnDef, TableDescriptor, WATERMARK_CANDIDATES};
use crate::core::traits::{BatchStream, SourceAdapter, STREAM_CHANNEL_CAPACITY};
use crate::core::value::{Batch, Record, Value};
use crate::error::{AdapterError, Result};
use crate::identifier::quote_mssql;
use crate::sources::split_qualified;

type MssqlClient = Client<Compat<TcpStream>>;

#[derive(Debug, Clone, Deserialize)]
struct SqlServerSourceConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(default, alias = "username")]
    user: String,
    #[serde(default)]
    password: String,
    /// Named instance (e.g. `SQLEXPRESS`); resolved via the SQL Browser
    /// service instead of `port`.
    #[serde(default)]
    instance: Option<String>,
    /// Use Windows (NTLM) authentication instead of SQL logins.
    #[serde(default)]
    windows_auth: bool,
    #[serde(default)]
    encrypt: bool,
    #[serde(default = "default_true")]
    trust_server_cert: bool,
}

fn default_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

impl SqlServerSourceConfig {
    fn tiberius_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.database(&self.database);
        if let Some(instance) = &self.instance {
            config.instance_name(instance);
        } else {
            config.port(self.port);
        }
        if self.windows_auth {
            config.authentication(AuthMethod::windows(&self.user, &self.password));
        } else {
            config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        }
        if self.encrypt {
            if self.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        config
    }
}

/// Source adapter for SQL Server-like engines.
#[derive(Default)]
pub struct SqlServerSource {
    client: Option<Arc<Mutex<MssqlClient>>>,
}

impl SqlServerSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Arc<Mutex<MssqlClient>>> {
        self.client
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to source".to_string()))
    }

    async fn open(config: &SqlServerSourceConfig) -> Result<MssqlClient> {
        let tib_config = config.tiberius_config();
        let tcp = if config.instance.is_some() {
            TcpStream::connect_named(&tib_config)
                .await
                .map_err(|e| AdapterError::Connection(format!("sqlserver connect failed: {}", e)))?
        } else {
            TcpStream::connect(tib_config.get_addr())
                .await
                .map_err(|e| AdapterError::Connection(format!("sqlserver connect failed: {}", e)))?
        };
        tcp.set_nodelay(true).ok();
        Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| AdapterError::Connection(format!("sqlserver login failed: {}", e)))
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<tiberius::Row>> {
        let mut client = self.client()?.lock().await;
        let rows = client
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for SqlServerSource {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let config: SqlServerSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid sqlserver source config: {}", e)))?;
        let client = Self::open(&config).await?;
        self.client = Some(Arc::new(Mutex::new(client)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the client closes the TDS stream.
        self.client = None;
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: SqlServerSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid sqlserver source config: {}", e)))?;
        let mut client = Self::open(&config).await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .query_rows(
                "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_TYPE = 'BASE TABLE' \
                 AND TABLE_SCHEMA NOT IN ('sys', 'INFORMATION_SCHEMA') \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME",
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let schema: Option<&str> = row.get(0);
                let name: Option<&str> = row.get(1);
                Some(format!("{}.{}", schema?, name?))
            })
            .collect())
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let (schema, name) = split_qualified(table, "dbo");
        let sql = format!(
            "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, NUMERIC_PRECISION, \
                    NUMERIC_SCALE, IS_NULLABLE, COLUMN_DEFAULT \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' \
             ORDER BY ORDINAL_POSITION",
            schema.replace('\'', "''"),
            name.replace('\'', "''")
        );
        let rows = self.query_rows(&sql).await?;
        if rows.is_empty() {
            return Err(AdapterError::schema(table, "table not found"));
        }

        let columns = rows
            .iter()
            .filter_map(|row| {
                let column_name: &str = row.get(0)?;
                let data_type: &str = row.get(1)?;
                let max_length: Option<i32> = row.get(2);
                let precision: Option<u8> = row.get(3);
                let scale: Option<i32> = row.get(4);
                let is_nullable: &str = row.get::<&str, _>(5).unwrap_or("YES");
                let default: Option<&str> = row.get(6);

                Some(ColumnDef {
                    name: column_name.to_string(),
                    source_type: render_mssql_type(data_type, max_length, precision, scale),
                    nullable: is_nullable.eq_ignore_ascii_case("yes"),
                    default: default.map(|d| d.to_string()),
                })
            })
            .collect();
        Ok(TableDescriptor::new(table, columns))
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let (schema, name) = split_qualified(table, "dbo");
        let sql = format!(
            "SELECT kcu.COLUMN_NAME \
             FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
               ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
              AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
               AND tc.TABLE_SCHEMA = '{}' AND tc.TABLE_NAME = '{}' \
             ORDER BY kcu.ORDINAL_POSITION",
            schema.replace('\'', "''"),
            name.replace('\'', "''")
        );
        let rows = self.query_rows(&sql).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<&str, _>(0).map(str::to_string))
            .collect())
    }

    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream> {
        self.stream_query(table, batch_size, None)
    }

    async fn read_incremental(
        &self,
        table: &str,
        since: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<BatchStream> {
        let desc = self.get_schema(table).await?;
        match desc.find_watermark_column(WATERMARK_CANDIDATES) {
            Some(column) => {
                let filter = format!(
                    "{} > '{}'",
                    quote_mssql(&column),
                    since.naive_utc().format("%Y-%m-%d %H:%M:%S")
                );
                self.stream_query(table, batch_size, Some(filter))
            }
            None => {
                warn!("No timestamp column found in {}, reading all data", table);
                self.stream_query(table, batch_size, None)
            }
        }
    }

    fn source_key(&self) -> &'static str {
        "sqlserver"
    }
}

impl SqlServerSource {
    /// Page through the table with OFFSET/FETCH in a producer task.
    fn stream_query(
        &self,
        table: &str,
        batch_size: usize,
        filter: Option<String>,
    ) -> Result<BatchStream> {
        let client = Arc::clone(self.client()?);
        let (schema, name) = split_qualified(table, "dbo");
        let table = table.to_string();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let where_clause = filter
                .map(|f| format!(" WHERE {}", f))
                .unwrap_or_default();
            let mut offset: usize = 0;
            loop {
                let sql = format!(
                    "SELECT * FROM {}.{}{} ORDER BY (SELECT NULL) \
                     OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                    quote_mssql(&schema),
                    quote_mssql(&name),
                    where_clause,
                    offset,
                    batch_size
                );
                let rows = {
                    let mut guard = client.lock().await;
                    let result = match guard.simple_query(&sql).await {
                        Ok(stream) => stream.into_first_result().await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(rows) => rows,
                        Err(e) => {
                            let _ = tx
                                .send(Err(AdapterError::read(&table, e.to_string())))
                                .await;
                            return;
                        }
                    }
                };
                let count = rows.len();
                if count == 0 {
                    return;
                }
                let records: Vec<Record> = rows.iter().map(row_to_record).collect();
                if tx.send(Ok(Batch::new(records))).await.is_err() {
                    return;
                }
                if count < batch_size {
                    return;
                }
                offset += batch_size;
            }
        });
        Ok(rx)
    }
}

fn row_to_record(row: &tiberius::Row) -> Record {
    let mut record = Record::new();
    for (idx, col) in row.columns().iter().enumerate() {
        record.insert(col.name().to_string(), mssql_value(row, idx));
    }
    record
}

/// Extract a value by trying each supported Rust type in turn. Tiberius is
/// strict about widths, so exactly one of these succeeds for any non-null
/// column value; all of them return `Ok(None)` for NULL.
fn mssql_value(row: &tiberius::Row, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::I64(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::I64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::I64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::I64(v as i64);
    }
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::F64(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::F64(v as f64);
    }
    if let Ok(Some(v)) = row.try_get::<rust_decimal::Decimal, _>(idx) {
        return Value::Decimal(v);
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return Value::Uuid(v);
    }
    if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(idx) {
        return Value::DateTime(v);
    }
    if let Ok(Some(v)) = row.try_get::<DateTime<Utc>, _>(idx) {
        return Value::DateTimeTz(v.fixed_offset());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
        return Value::Date(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::Text(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
        return Value::Bytes(v.to_vec());
    }
    Value::Null
}

fn render_mssql_type(
    data_type: &str,
    max_length: Option<i32>,
    precision: Option<u8>,
    scale: Option<i32>,
) -> String {
    match data_type {
        "varchar" | "nvarchar" | "char" | "nchar" | "varbinary" | "binary" => match max_length {
            Some(-1) => format!("{}(max)", data_type),
            Some(len) => format!("{}({})", data_type, len),
            None => data_type.to_string(),
        },
        "decimal" | "numeric" => match (precision, scale) {
            (Some(p), Some(s)) => format!("{}({},{})", data_type, p, s),
            _ => data_type.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_mssql_type() {
        assert_eq!(render_mssql_type("nvarchar", Some(50), None, None), "nvarchar(50)");
        assert_eq!(render_mssql_type("nvarchar", Some(-1), None, None), "nvarchar(max)");
        assert_eq!(
            render_mssql_type("decimal", None, Some(18), Some(4)),
            "decimal(18,4)"
        );
        assert_eq!(render_mssql_type("datetime2", None, None, None), "datetime2");
    }

    #[test]
    fn test_config_defaults() {
        let cfg: SqlServerSourceConfig = serde_json::from_value(serde_json::json!({
            "host": "db", "database": "app", "user": "sa", "password": "pw"
        }))
        .unwrap();
        assert_eq!(cfg.port, 1433);
        assert!(cfg.instance.is_none());
        assert!(!cfg.windows_auth);
        assert!(cfg.trust_server_cert);
    }

    #[test]
    fn test_named_instance_config() {
        let cfg: SqlServerSourceConfig = serde_json::from_value(serde_json::json!({
            "host": "db", "database": "app", "user": "corp\\svc", "password": "pw",
            "instance": "SQLEXPRESS", "windows_auth": true
        }))
        .unwrap();
        assert_eq!(cfg.instance.as_deref(), Some("SQLEXPRESS"));
        assert!(cfg.windows_auth);
    }
}
