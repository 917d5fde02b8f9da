//! MySQL-like relational source adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::schema::{
    ColumnDef, ForeignKey, IndexDef, TableDescriptor, UniqueConstraint, WATERMARK_CANDIDATES,
};
use crate::core::traits::{BatchStream, SourceAdapter, STREAM_CHANNEL_CAPACITY};
use crate::core::value::{Batch, Record, Value};
use crate::error::{AdapterError, Result};
use crate::identifier::quote_mysql;

#[derive(Debug, Clone, Deserialize)]
struct MysqlSourceConfig {
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

impl MysqlSourceConfig {
    fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database.clone()))
            .into()
    }
}

/// Source adapter for MySQL-like engines.
#[derive(Default)]
pub struct MysqlSource {
    conn: Option<Arc<Mutex<Conn>>>,
}

impl MysqlSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<&Arc<Mutex<Conn>>> {
        self.conn
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to source".to_string()))
    }
}

#[async_trait]
impl SourceAdapter for MysqlSource {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let config: MysqlSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid mysql source config: {}", e)))?;
        let conn = Conn::new(config.opts())
            .await
            .map_err(|e| AdapterError::Connection(format!("mysql connect failed: {}", e)))?;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            match Arc::try_unwrap(conn) {
                Ok(mutex) => {
                    if let Err(e) = mutex.into_inner().disconnect().await {
                        debug!("mysql disconnect: {}", e);
                    }
                }
                Err(_) => debug!("mysql connection still referenced by a reader; dropping"),
            }
        }
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: MysqlSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid mysql source config: {}", e)))?;
        let mut conn = Conn::new(config.opts())
            .await
            .map_err(|e| AdapterError::Connection(format!("mysql connect failed: {}", e)))?;
        conn.query_drop("SELECT 1").await?;
        conn.disconnect().await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.conn()?.lock().await;
        let tables: Vec<String> = conn
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
            )
            .await?;
        Ok(tables)
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let mut conn = self.conn()?.lock().await;
        let rows: Vec<(String, String, String, Option<String>)> = conn
            .exec(
                "SELECT column_name, column_type, is_nullable, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position",
                (table,),
            )
            .await?;
        if rows.is_empty() {
            return Err(AdapterError::schema(table, "table not found"));
        }

        let columns = rows
            .into_iter()
            .map(|(name, column_type, is_nullable, default)| ColumnDef {
                name,
                source_type: column_type,
                nullable: is_nullable.eq_ignore_ascii_case("yes"),
                default,
            })
            .collect();
        Ok(TableDescriptor::new(table, columns))
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?.lock().await;
        let columns: Vec<String> = conn
            .exec(
                "SELECT column_name FROM information_schema.key_column_usage \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 AND constraint_name = 'PRIMARY' ORDER BY ordinal_position",
                (table,),
            )
            .await?;
        Ok(columns)
    }

    async fn get_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let mut conn = self.conn()?.lock().await;
        let rows: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT constraint_name, column_name, referenced_table_name, referenced_column_name \
                 FROM information_schema.key_column_usage \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 AND referenced_table_name IS NOT NULL \
                 ORDER BY constraint_name, ordinal_position",
                (table,),
            )
            .await?;

        let mut grouped: HashMap<String, ForeignKey> = HashMap::new();
        for (constraint, column, ref_table, ref_column) in rows {
            let fk = grouped.entry(constraint.clone()).or_insert_with(|| ForeignKey {
                name: constraint,
                columns: Vec::new(),
                ref_table,
                ref_columns: Vec::new(),
            });
            fk.columns.push(column);
            fk.ref_columns.push(ref_column);
        }
        Ok(grouped.into_values().collect())
    }

    async fn get_unique_constraints(&self, table: &str) -> Result<Vec<UniqueConstraint>> {
        let mut conn = self.conn()?.lock().await;
        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT index_name, column_name FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 AND non_unique = 0 AND index_name <> 'PRIMARY' \
                 ORDER BY index_name, seq_in_index",
                (table,),
            )
            .await?;

        let mut grouped: HashMap<String, UniqueConstraint> = HashMap::new();
        for (index_name, column) in rows {
            grouped
                .entry(index_name.clone())
                .or_insert_with(|| UniqueConstraint {
                    name: index_name,
                    columns: Vec::new(),
                })
                .columns
                .push(column);
        }
        Ok(grouped.into_values().collect())
    }

    async fn get_indexes(&self, table: &str) -> Result<Vec<IndexDef>> {
        let mut conn = self.conn()?.lock().await;
        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT index_name, column_name FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 AND non_unique = 1 \
                 ORDER BY index_name, seq_in_index",
                (table,),
            )
            .await?;

        let mut grouped: HashMap<String, IndexDef> = HashMap::new();
        for (index_name, column) in rows {
            grouped
                .entry(index_name.clone())
                .or_insert_with(|| IndexDef {
                    name: index_name,
                    columns: Vec::new(),
                    is_unique: false,
                })
                .columns
                .push(column);
        }
        Ok(grouped.into_values().collect())
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
                    quote_mysql(&column),
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
        "mysql"
    }
}

impl MysqlSource {
    /// Page through the table with LIMIT/OFFSET in a producer task. The
    /// connection mutex is held per page, not for the whole stream.
    fn stream_query(
        &self,
        table: &str,
        batch_size: usize,
        filter: Option<String>,
    ) -> Result<BatchStream> {
        let conn = Arc::clone(self.conn()?);
        let table = table.to_string();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let where_clause = filter
                .map(|f| format!(" WHERE {}", f))
                .unwrap_or_default();
            let mut offset: usize = 0;
            loop {
                let sql = format!(
                    "SELECT * FROM {}{} LIMIT {} OFFSET {}",
                    quote_mysql(&table),
                    where_clause,
                    batch_size,
                    offset
                );
                let rows: Vec<Row> = {
                    let mut guard = conn.lock().await;
                    match guard.query(sql).await {
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
                let records: Vec<Record> = rows.into_iter().map(row_to_record).collect();
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

fn row_to_record(row: Row) -> Record {
    let columns = row.columns();
    let values = row.unwrap();
    let mut record = Record::new();
    for (col, value) in columns.iter().zip(values) {
        record.insert(col.name_str().into_owned(), mysql_value(value));
    }
    record
}

fn mysql_value(value: mysql_async::Value) -> Value {
    use mysql_async::Value as V;
    match value {
        V::NULL => Value::Null,
        V::Int(i) => Value::I64(i),
        V::UInt(u) => i64::try_from(u).map_or_else(|_| Value::Text(u.to_string()), Value::I64),
        V::Float(f) => Value::F64(f as f64),
        V::Double(d) => Value::F64(d),
        V::Bytes(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
        V::Date(y, m, d, 0, 0, 0, 0) => NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
            .map_or(Value::Null, Value::Date),
        V::Date(y, m, d, h, mi, s, us) => NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
            .and_then(|date| date.and_hms_micro_opt(h as u32, mi as u32, s as u32, us))
            .map_or(Value::Null, Value::DateTime),
        V::Time(neg, days, h, m, s, _) => {
            let sign = if neg { "-" } else { "" };
            Value::Text(format!("{}{:02}:{:02}:{:02}", sign, days * 24 + h as u32, m, s))
        }
    }
}
