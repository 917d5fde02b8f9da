//! Postgres-like relational source adapter.
//!
//! Metadata comes from `information_schema` and `pg_catalog`; data is
//! streamed with `query_raw` and chunked into batches in a producer task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{pin_mut, TryStreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use crate::core::schema::{
    ColumnDef, ForeignKey, IndexDef, TableDescriptor, UniqueConstraint, WATERMARK_CANDIDATES,
};
use crate::core::traits::{BatchStream, SourceAdapter, STREAM_CHANNEL_CAPACITY};
use crate::core::value::{Batch, Record, Value};
use crate::error::{AdapterError, Result};
use crate::identifier::quote_pg;
use crate::sources::split_qualified;

#[derive(Debug, Clone, Deserialize)]
struct PostgresSourceConfig {
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

impl PostgresSourceConfig {
    fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// Source adapter for Postgres-like engines.
#[derive(Default)]
pub struct PostgresSource {
    client: Option<Arc<Client>>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl PostgresSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Arc<Client>> {
        self.client
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to source".to_string()))
    }

    async fn open(config: &PostgresSourceConfig) -> Result<(Client, tokio::task::JoinHandle<()>)> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(|e| AdapterError::Connection(format!("postgres connect failed: {}", e)))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection closed: {}", e);
            }
        });
        Ok((client, driver))
    }
}

#[async_trait]
impl SourceAdapter for PostgresSource {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let config: PostgresSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid postgres source config: {}", e)))?;
        let (client, driver) = Self::open(&config).await?;
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
        let config: PostgresSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid postgres source config: {}", e)))?;
        let (client, driver) = Self::open(&config).await?;
        let result = client.simple_query("SELECT 1").await;
        driver.abort();
        result?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = self
            .client()?
            .query(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                 AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| format!("{}.{}", r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let (schema, name) = split_qualified(table, "public");
        let rows = self
            .client()?
            .query(
                "SELECT column_name, data_type, udt_name, character_maximum_length, \
                        numeric_precision, numeric_scale, is_nullable, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &name],
            )
            .await?;
        if rows.is_empty() {
            return Err(AdapterError::schema(table, "table not found"));
        }

        let columns = rows
            .iter()
            .map(|row| {
                let column_name: String = row.get(0);
                let data_type: String = row.get(1);
                let udt_name: String = row.get(2);
                let max_length: Option<i32> = row.get(3);
                let precision: Option<i32> = row.get(4);
                let scale: Option<i32> = row.get(5);
                let is_nullable: String = row.get(6);
                let default: Option<String> = row.get(7);

                let source_type = render_pg_type(&data_type, &udt_name, max_length, precision, scale);
                ColumnDef {
                    name: column_name,
                    source_type,
                    nullable: is_nullable.eq_ignore_ascii_case("yes"),
                    default,
                }
            })
            .collect();

        Ok(TableDescriptor::new(table, columns))
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let (schema, name) = split_qualified(table, "public");
        let rows = self
            .client()?
            .query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary \
                 ORDER BY a.attnum",
                &[&schema, &name],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn get_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let (schema, name) = split_qualified(table, "public");
        let rows = self
            .client()?
            .query(
                "SELECT tc.constraint_name, kcu.column_name, \
                        ccu.table_name AS ref_table, ccu.column_name AS ref_column \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON ccu.constraint_name = tc.constraint_name \
                  AND ccu.table_schema = tc.table_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2",
                &[&schema, &name],
            )
            .await?;

        let mut grouped: HashMap<String, ForeignKey> = HashMap::new();
        for row in &rows {
            let constraint: String = row.get(0);
            let column: String = row.get(1);
            let ref_table: String = row.get(2);
            let ref_column: String = row.get(3);
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
        let (schema, name) = split_qualified(table, "public");
        let rows = self
            .client()?
            .query(
                "SELECT tc.constraint_name, kcu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 WHERE tc.constraint_type = 'UNIQUE' \
                   AND tc.table_schema = $1 AND tc.table_name = $2 \
                 ORDER BY tc.constraint_name, kcu.ordinal_position",
                &[&schema, &name],
            )
            .await?;

        let mut grouped: HashMap<String, UniqueConstraint> = HashMap::new();
        for row in &rows {
            let constraint: String = row.get(0);
            let column: String = row.get(1);
            grouped
                .entry(constraint.clone())
                .or_insert_with(|| UniqueConstraint {
                    name: constraint,
                    columns: Vec::new(),
                })
                .columns
                .push(column);
        }
        Ok(grouped.into_values().collect())
    }

    async fn get_indexes(&self, table: &str) -> Result<Vec<IndexDef>> {
        let (schema, name) = split_qualified(table, "public");
        let rows = self
            .client()?
            .query(
                "SELECT indexname, indexdef FROM pg_indexes \
                 WHERE schemaname = $1 AND tablename = $2",
                &[&schema, &name],
            )
            .await?;

        let mut indexes = Vec::new();
        for row in &rows {
            let index_name: String = row.get(0);
            let indexdef: String = row.get(1);
            // Primary key indexes are created with the table.
            if index_name.ends_with("_pkey") {
                continue;
            }
            let columns = parse_index_columns(&indexdef);
            if columns.is_empty() {
                continue;
            }
            indexes.push(IndexDef {
                name: index_name,
                columns,
                is_unique: indexdef.to_uppercase().contains("UNIQUE INDEX"),
            });
        }
        Ok(indexes)
    }

    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream> {
        self.stream_query(table, batch_size, None).await
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
                self.stream_query(table, batch_size, Some((column, since.naive_utc())))
                    .await
            }
            None => {
                warn!("No timestamp column found in {}, reading all data", table);
                self.stream_query(table, batch_size, None).await
            }
        }
    }

    fn source_key(&self) -> &'static str {
        "postgresql"
    }
}

impl PostgresSource {
    async fn stream_query(
        &self,
        table: &str,
        batch_size: usize,
        watermark: Option<(String, NaiveDateTime)>,
    ) -> Result<BatchStream> {
        let client = Arc::clone(self.client()?);
        let (schema, name) = split_qualified(table, "public");
        let table_name = table.to_string();

        let sql = match &watermark {
            Some((column, _)) => format!(
                "SELECT * FROM {}.{} WHERE {} > $1",
                quote_pg(&schema),
                quote_pg(&name),
                quote_pg(column)
            ),
            None => format!("SELECT * FROM {}.{}", quote_pg(&schema), quote_pg(&name)),
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let since = watermark.map(|(_, ts)| ts);
            if let Err(e) = stream_rows(&client, &sql, since, batch_size, &tx).await {
                let _ = tx
                    .send(Err(AdapterError::read(&table_name, e.to_string())))
                    .await;
            }
        });
        Ok(rx)
    }
}

async fn stream_rows(
    client: &Client,
    sql: &str,
    since: Option<NaiveDateTime>,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let params: Vec<&(dyn ToSql + Sync)> = match &since {
        Some(ts) => vec![ts as &(dyn ToSql + Sync)],
        None => Vec::new(),
    };
    let stream = client.query_raw(sql, params).await?;
    pin_mut!(stream);

    let mut rows: Vec<Record> = Vec::with_capacity(batch_size);
    while let Some(row) = stream.try_next().await? {
        rows.push(row_to_record(&row));
        if rows.len() >= batch_size
            && tx
                .send(Ok(Batch::new(std::mem::take(&mut rows))))
                .await
                .is_err()
        {
            // Receiver dropped: the table was aborted downstream.
            return Ok(());
        }
    }
    if !rows.is_empty() {
        let _ = tx.send(Ok(Batch::new(rows))).await;
    }
    Ok(())
}

fn row_to_record(row: &Row) -> Record {
    let mut record = Record::new();
    for (idx, col) in row.columns().iter().enumerate() {
        record.insert(col.name().to_string(), pg_value(row, idx, col.type_().name()));
    }
    record
}

fn pg_value(row: &Row, idx: usize, type_name: &str) -> Value {
    match type_name {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::I64(v as i64)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::I64(v as i64)),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::I64),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::F64(v as f64)),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::F64),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Decimal),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Uuid),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::DateTime),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<chrono::FixedOffset>>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::DateTimeTz),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Date),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Json),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Bytes),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Text),
    }
}

fn render_pg_type(
    data_type: &str,
    udt_name: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    match data_type {
        "character varying" => match max_length {
            Some(len) => format!("varchar({})", len),
            None => "text".to_string(),
        },
        "character" => match max_length {
            Some(len) => format!("char({})", len),
            None => "char".to_string(),
        },
        "numeric" => match (precision, scale) {
            (Some(p), Some(s)) => format!("numeric({},{})", p, s),
            (Some(p), None) => format!("numeric({})", p),
            _ => "numeric".to_string(),
        },
        "ARRAY" => format!("{}[]", udt_name.trim_start_matches('_')),
        other => other.to_string(),
    }
}

/// Pull the column list out of a `CREATE INDEX ... (col, col)` definition.
fn parse_index_columns(indexdef: &str) -> Vec<String> {
    let open = match indexdef.find('(') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let close = match indexdef.rfind(')') {
        Some(i) => i,
        None => return Vec::new(),
    };
    indexdef[open + 1..close]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pg_type() {
        assert_eq!(
            render_pg_type("character varying", "varchar", Some(50), None, None),
            "varchar(50)"
        );
        assert_eq!(
            render_pg_type("numeric", "numeric", None, Some(10), Some(2)),
            "numeric(10,2)"
        );
        assert_eq!(render_pg_type("ARRAY", "_int4", None, None, None), "int4[]");
        assert_eq!(render_pg_type("integer", "int4", None, None, None), "integer");
    }

    #[test]
    fn test_parse_index_columns() {
        assert_eq!(
            parse_index_columns("CREATE INDEX idx_users_email ON public.users USING btree (email)"),
            vec!["email"]
        );
        assert_eq!(
            parse_index_columns(
                "CREATE UNIQUE INDEX u ON t USING btree (\"userId\", created_at)"
            ),
            vec!["userId", "created_at"]
        );
        assert!(parse_index_columns("garbage").is_empty());
    }

    #[test]
    fn test_config_aliases_username() {
        let cfg: PostgresSourceConfig = serde_json::from_value(serde_json::json!({
            "host": "db", "database": "app", "username": "svc", "password": "pw"
        }))
        .unwrap();
        assert_eq!(cfg.user, "svc");
        assert_eq!(cfg.port, 5432);
    }
}
