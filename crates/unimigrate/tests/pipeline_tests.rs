//! Pipeline engine integration tests over instrumented in-memory adapters.
//!
//! The mock source/destination pair counts connects and disconnects,
//! records observed batch sizes and every written row, and can be told to
//! fail specific writes, so partial-failure semantics, schema evolution,
//! retries, and idempotent re-runs are all observable without a live
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use unimigrate::catalog::AdapterCatalog;
use unimigrate::core::schema::{ColumnDef, ForeignKey, MappedColumn, TableDescriptor};
use unimigrate::core::traits::{BatchStream, DestinationAdapter, SourceAdapter};
use unimigrate::core::value::{Batch, Record, Value};
use unimigrate::error::{AdapterError, Result};
use unimigrate::pipeline::PipelineEngine;
use unimigrate::protocol::{MigrateRequest, OperationType};

#[derive(Default)]
struct MockState {
    // Source side
    source_connects: usize,
    source_disconnects: usize,
    tables: Vec<MockTable>,
    batch_sizes_seen: Vec<usize>,
    // Destination side
    dest_connects: usize,
    dest_disconnects: usize,
    created: HashMap<String, Vec<String>>,
    pre_existing: HashMap<String, Vec<String>>,
    evolved: HashMap<String, Vec<String>>,
    written: HashMap<String, Vec<Record>>,
    write_failures: HashMap<String, FailPlan>,
    write_attempts: HashMap<String, usize>,
    events: Vec<String>,
    columnar_prefix: bool,
}

struct FailPlan {
    /// Fail the Nth write call (1-based) ...
    at_batch: usize,
    /// ... this many times before succeeding (usize::MAX = always).
    times: usize,
}

#[derive(Clone)]
struct MockTable {
    name: String,
    descriptor: TableDescriptor,
    batches: Vec<Vec<Record>>,
}

type Shared = Arc<Mutex<MockState>>;

struct MockSource {
    state: Shared,
    api: bool,
}

struct MockDest {
    state: Shared,
}

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<BTreeMap<_, _>>()
}

fn users_descriptor() -> TableDescriptor {
    let mut desc = TableDescriptor::new(
        "public.users",
        vec![
            ColumnDef::new("id", "integer", false),
            ColumnDef::new("name", "varchar(50)", true),
            ColumnDef::new("created", "timestamp", true),
        ],
    );
    desc.primary_key = vec!["id".to_string()];
    desc
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn users_rows() -> Vec<Record> {
    vec![
        record(&[
            ("id", Value::I64(1)),
            ("name", Value::Text("a".into())),
            ("created", Value::DateTime(ts(100).naive_utc())),
        ]),
        record(&[
            ("id", Value::I64(2)),
            ("name", Value::Text("b".into())),
            ("created", Value::DateTime(ts(200).naive_utc())),
        ]),
        record(&[
            ("id", Value::I64(3)),
            ("name", Value::Text("c".into())),
            ("created", Value::DateTime(ts(300).naive_utc())),
        ]),
    ]
}

#[async_trait]
impl SourceAdapter for MockSource {
    async fn connect(&mut self, _config: &serde_json::Value) -> Result<()> {
        self.state.lock().unwrap().source_connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().source_disconnects += 1;
    }

    async fn test_connection(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .iter()
            .map(|t| t.name.clone())
            .collect())
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.descriptor.clone())
            .ok_or_else(|| AdapterError::schema(table, "not found"))
    }

    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream> {
        let batches = {
            let mut state = self.state.lock().unwrap();
            state.batch_sizes_seen.push(batch_size);
            state
                .tables
                .iter()
                .find(|t| t.name == table)
                .map(|t| t.batches.clone())
                .ok_or_else(|| AdapterError::read(table, "not found"))?
        };
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for batch in batches {
                if tx.send(Ok(Batch::new(batch))).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn read_incremental(
        &self,
        table: &str,
        since: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<BatchStream> {
        let batches = {
            let mut state = self.state.lock().unwrap();
            state.batch_sizes_seen.push(batch_size);
            state
                .tables
                .iter()
                .find(|t| t.name == table)
                .map(|t| t.batches.clone())
                .ok_or_else(|| AdapterError::read(table, "not found"))?
        };
        // Watermark filter: strictly newer `created` values only.
        let cutoff = since.naive_utc();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for batch in batches {
                let filtered: Vec<Record> = batch
                    .into_iter()
                    .filter(|row| match row.get("created") {
                        Some(Value::DateTime(dt)) => *dt > cutoff,
                        _ => true,
                    })
                    .collect();
                if !filtered.is_empty() && tx.send(Ok(Batch::new(filtered))).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn source_key(&self) -> &'static str {
        if self.api {
            "mock-api"
        } else {
            "mock-sql"
        }
    }

    fn is_api_source(&self) -> bool {
        self.api
    }
}

#[async_trait]
impl DestinationAdapter for MockDest {
    async fn connect(&mut self, _config: &serde_json::Value, _source_key: &str) -> Result<()> {
        self.state.lock().unwrap().dest_connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().dest_disconnects += 1;
    }

    async fn test_connection(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn map_types(&self, columns: &[ColumnDef], _source_key: &str) -> Vec<MappedColumn> {
        columns
            .iter()
            .map(|col| MappedColumn {
                name: col.name.clone(),
                target_type: "text".to_string(),
                nullable: col.nullable,
                default: None,
            })
            .collect()
    }

    fn table_name(&self, source_table: &str, _source_key: &str) -> String {
        let base = source_table.rsplit('.').next().unwrap_or(source_table);
        if self.state.lock().unwrap().columnar_prefix {
            format!("REL_{}", base)
        } else {
            base.to_string()
        }
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[MappedColumn],
        _primary_key: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("create:{}", table));
        if state.pre_existing.contains_key(table) {
            // Idempotent: never drop or recreate a pre-existing table.
            return Ok(());
        }
        let names = columns.iter().map(|c| c.name.clone()).collect();
        state.created.insert(table.to_string(), names);
        Ok(())
    }

    async fn columns_for(&self, table: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut columns = state
            .pre_existing
            .get(table)
            .or_else(|| state.created.get(table))
            .cloned()
            .unwrap_or_default();
        if let Some(extra) = state.evolved.get(table) {
            columns.extend(extra.iter().cloned());
        }
        Ok(columns)
    }

    async fn evolve_schema(&self, table: &str, missing: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("evolve:{}", table));
        state
            .evolved
            .entry(table.to_string())
            .or_default()
            .extend(missing.iter().cloned());
        Ok(())
    }

    async fn write_batch(&self, table: &str, batch: &Batch, primary_key: &[String]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let attempt = state.write_attempts.entry(table.to_string()).or_default();
        *attempt += 1;
        let attempt = *attempt;
        if let Some(plan) = state.write_failures.get_mut(table) {
            if attempt >= plan.at_batch && plan.times > 0 {
                plan.times -= 1;
                return Err(AdapterError::write(table, "batch write error"));
            }
        }
        state.events.push(format!("write:{}", table));
        let rows = state.written.entry(table.to_string()).or_default();
        for row in &batch.rows {
            if primary_key.is_empty() {
                rows.push(row.clone());
            } else {
                // Upsert: replace the row with a matching key.
                let key: Vec<_> = primary_key.iter().map(|k| row.get(k).cloned()).collect();
                if let Some(existing) = rows.iter_mut().find(|r| {
                    primary_key
                        .iter()
                        .zip(&key)
                        .all(|(k, v)| r.get(k) == v.as_ref())
                }) {
                    *existing = row.clone();
                } else {
                    rows.push(row.clone());
                }
            }
        }
        Ok(batch.len() as u64)
    }

    async fn create_foreign_keys(&self, table: &str, _fks: &[ForeignKey]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .events
            .push(format!("fks:{}", table));
        Ok(())
    }

    fn destination_key(&self) -> &'static str {
        "mock-dest"
    }
}

fn build_engine(state: &Shared, api_source: bool) -> PipelineEngine {
    let mut catalog = AdapterCatalog::new();
    let source_key = if api_source { "mock-api" } else { "mock-sql" };
    let source_state = Arc::clone(state);
    catalog.register_source(source_key, move || {
        Box::new(MockSource {
            state: Arc::clone(&source_state),
            api: api_source,
        })
    });
    let dest_state = Arc::clone(state);
    catalog.register_destination("mock-dest", move || {
        Box::new(MockDest {
            state: Arc::clone(&dest_state),
        })
    });
    PipelineEngine::new(Arc::new(catalog))
}

fn request(api_source: bool) -> MigrateRequest {
    MigrateRequest {
        source_type: if api_source { "mock-api" } else { "mock-sql" }.to_string(),
        dest_type: "mock-dest".to_string(),
        source: serde_json::json!({}),
        destination: serde_json::json!({}),
        operation_type: OperationType::Full,
        last_sync_time: None,
    }
}

#[tokio::test]
async fn relational_full_reload_lands_in_prefixed_table() {
    let state: Shared = Arc::new(Mutex::new(MockState {
        columnar_prefix: true,
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    assert_eq!(result.total_tables, 1);
    assert_eq!(result.total_records, 3);
    assert_eq!(result.tables_migrated.len(), 1);
    assert_eq!(result.tables_migrated[0].records, 3);

    let state = state.lock().unwrap();
    assert_eq!(state.written["REL_users"].len(), 3);
    assert!(state.created.contains_key("REL_users"));
    // Relational sources read in large batches.
    assert!(state.batch_sizes_seen.iter().all(|&s| s >= 500));
}

#[tokio::test]
async fn connect_and_disconnect_pair_on_every_exit_path() {
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "t".into(),
            descriptor: TableDescriptor::new("t", vec![ColumnDef::new("id", "integer", false)]),
            batches: vec![],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let _ = engine.run(request(false)).await;

    let state = state.lock().unwrap();
    assert_eq!(state.source_connects, 1);
    assert_eq!(state.source_disconnects, 1);
    assert_eq!(state.dest_connects, 1);
    assert_eq!(state.dest_disconnects, 1);
}

#[tokio::test]
async fn api_source_grows_schema_mid_stream() {
    let contacts = TableDescriptor::new(
        "Contacts",
        vec![
            ColumnDef::new("id", "string", true),
            ColumnDef::new("name", "string", true),
        ],
    );
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "Contacts".into(),
            descriptor: contacts,
            batches: vec![
                vec![record(&[
                    ("id", Value::Text("1".into())),
                    ("name", Value::Text("a".into())),
                ])],
                vec![record(&[
                    ("id", Value::Text("2".into())),
                    ("name", Value::Text("b".into())),
                    ("email", Value::Text("b@x".into())),
                ])],
            ],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, true);
    let result = engine.run(request(true)).await;

    assert!(result.success);
    assert_eq!(result.total_records, 2);

    let state = state.lock().unwrap();
    // The new field was added before the second page's write.
    assert_eq!(state.evolved["Contacts"], vec!["email".to_string()]);
    assert_eq!(state.written["Contacts"].len(), 2);
    // Every field observed in any batch has a destination column (P8).
    let all_columns: Vec<String> = state.created["Contacts"]
        .iter()
        .chain(state.evolved["Contacts"].iter())
        .cloned()
        .collect();
    for field in ["id", "name", "email"] {
        assert!(all_columns.contains(&field.to_string()));
    }
    // API sources read in small batches.
    assert!(state.batch_sizes_seen.iter().all(|&s| s <= 100));
}

#[tokio::test]
async fn one_failing_table_does_not_abort_the_operation() {
    let t1 = MockTable {
        name: "T1".into(),
        descriptor: users_descriptor(),
        batches: vec![users_rows()],
    };
    let mut t2_descriptor =
        TableDescriptor::new("public.T2", vec![ColumnDef::new("id", "integer", false)]);
    t2_descriptor.primary_key = vec!["id".to_string()];
    let t2 = MockTable {
        name: "T2".into(),
        descriptor: t2_descriptor,
        batches: vec![
            vec![record(&[("id", Value::I64(10))])],
            vec![record(&[("id", Value::I64(11))])],
            vec![record(&[("id", Value::I64(12))])],
        ],
    };

    let mut write_failures = HashMap::new();
    // Second write to T2 fails on every attempt.
    write_failures.insert(
        "T2".to_string(),
        FailPlan {
            at_batch: 2,
            times: usize::MAX,
        },
    );

    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![t1, t2],
        write_failures,
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(!result.success);
    assert_eq!(result.tables_migrated.len(), 1);
    assert_eq!(result.tables_migrated[0].table, "T1");
    assert_eq!(result.tables_failed.len(), 1);
    assert_eq!(result.tables_failed[0].table, "T2");
    assert!(result.tables_failed[0].error.contains("batch write error"));

    let state = state.lock().unwrap();
    // T1 is fully present; T2 keeps its first batch (no rollback).
    assert_eq!(state.written["users"].len(), 3);
    assert!(!state.written["T2"].is_empty());
    // Adapters still disconnected exactly once each.
    assert_eq!(state.source_disconnects, 1);
    assert_eq!(state.dest_disconnects, 1);
}

#[tokio::test]
async fn transient_write_failure_is_retried_and_upsert_dedups() {
    let mut write_failures = HashMap::new();
    // First write fails once; the retry re-streams the table.
    write_failures.insert(
        "users".to_string(),
        FailPlan {
            at_batch: 1,
            times: 1,
        },
    );
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        write_failures,
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    assert_eq!(result.tables_migrated[0].records, 3);
    // Upsert on the primary key keeps the row-set identical to a single
    // clean run even though the table streamed twice.
    assert_eq!(state.lock().unwrap().written["users"].len(), 3);
}

#[tokio::test]
async fn rerun_against_primary_key_destination_is_idempotent() {
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let first = engine.run(request(false)).await;
    let second = engine.run(request(false)).await;

    assert!(first.success && second.success);
    let state = state.lock().unwrap();
    assert_eq!(state.written["users"].len(), 3);
    // Both runs opened and closed their own adapter instances.
    assert_eq!(state.source_connects, 2);
    assert_eq!(state.source_disconnects, 2);
}

#[tokio::test]
async fn empty_source_table_counts_as_migrated() {
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.empty".into(),
            descriptor: users_descriptor(),
            batches: vec![],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    assert_eq!(result.tables_migrated.len(), 1);
    assert_eq!(result.tables_migrated[0].records, 0);
    // The destination table exists and is empty.
    let state = state.lock().unwrap();
    assert!(state.created.contains_key("empty"));
    assert!(!state.written.contains_key("empty"));
}

#[tokio::test]
async fn preexisting_superset_table_is_left_alone() {
    let mut pre_existing = HashMap::new();
    pre_existing.insert(
        "users".to_string(),
        vec![
            "id".to_string(),
            "name".to_string(),
            "created".to_string(),
            "legacy_flag".to_string(),
        ],
    );
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        pre_existing,
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    let state = state.lock().unwrap();
    assert!(state.evolved.is_empty());
    assert_eq!(state.written["users"].len(), 3);
}

#[tokio::test]
async fn preexisting_narrower_table_is_widened_before_first_write() {
    let mut pre_existing = HashMap::new();
    pre_existing.insert("users".to_string(), vec!["id".to_string()]);
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        pre_existing,
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    let state = state.lock().unwrap();
    let evolved = &state.evolved["users"];
    assert!(evolved.contains(&"name".to_string()));
    assert!(evolved.contains(&"created".to_string()));
    // Evolution happened before any write.
    let evolve_pos = state.events.iter().position(|e| e == "evolve:users").unwrap();
    let write_pos = state.events.iter().position(|e| e == "write:users").unwrap();
    assert!(evolve_pos < write_pos);
}

#[tokio::test]
async fn incremental_reads_only_rows_after_watermark() {
    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![MockTable {
            name: "public.users".into(),
            descriptor: users_descriptor(),
            batches: vec![users_rows()],
        }],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let mut req = request(false);
    req.operation_type = OperationType::Incremental;
    // Strictly-greater cutoff: the row at t=200 is excluded.
    req.last_sync_time = Some(ts(200));
    let result = engine.run(req).await;

    assert!(result.success);
    assert_eq!(result.total_records, 1);
    let state = state.lock().unwrap();
    assert_eq!(state.written["users"].len(), 1);
    assert_eq!(state.written["users"][0].get("id"), Some(&Value::I64(3)));
}

#[tokio::test]
async fn foreign_keys_created_after_all_tables_load() {
    let mut orders = TableDescriptor::new(
        "public.orders",
        vec![
            ColumnDef::new("id", "integer", false),
            ColumnDef::new("user_id", "integer", true),
        ],
    );
    orders.primary_key = vec!["id".to_string()];
    orders.foreign_keys = vec![ForeignKey {
        name: "fk_orders_users".into(),
        columns: vec!["user_id".into()],
        ref_table: "users".into(),
        ref_columns: vec!["id".into()],
    }];

    let state: Shared = Arc::new(Mutex::new(MockState {
        tables: vec![
            MockTable {
                name: "public.orders".into(),
                descriptor: orders,
                batches: vec![vec![record(&[
                    ("id", Value::I64(1)),
                    ("user_id", Value::I64(1)),
                ])]],
            },
            MockTable {
                name: "public.users".into(),
                descriptor: users_descriptor(),
                batches: vec![users_rows()],
            },
        ],
        ..Default::default()
    }));

    let engine = build_engine(&state, false);
    let result = engine.run(request(false)).await;

    assert!(result.success);
    let state = state.lock().unwrap();
    let fk_pos = state.events.iter().position(|e| e == "fks:orders").unwrap();
    let last_write = state
        .events
        .iter()
        .rposition(|e| e.starts_with("write:"))
        .unwrap();
    // Referenced tables finished loading before any FK was created.
    assert!(fk_pos > last_write);
}
