//! Row values crossing heterogeneous stores.
//!
//! Rows are keyed by column name rather than position because API sources
//! carry dynamic per-tenant schemas: two pages of the same module may
//! disagree on the field set. The pipeline diffs batch keys against the
//! destination's live columns and evolves the schema additively.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::ser::{Serialize, Serializer};
use uuid::Uuid;

/// A single value read from a source or written to a destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    /// Fixed-point numeric with preserved precision.
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeTz(DateTime<FixedOffset>),
    /// Structured data (arrays, nested objects) from JSON-capable sources.
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert an API payload value into a `Value`.
    ///
    /// Scalars map directly; arrays and objects are kept structured so a
    /// JSON-capable destination column can hold them.
    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else {
                    Value::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    /// Render as text, for destinations that degrade unknowns to strings.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F64(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Uuid(u) => u.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::DateTimeTz(dt) => dt.to_rfc3339(),
            Value::Json(v) => v.to_string(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::I64(i) => serializer.serialize_i64(*i),
            Value::F64(f) => serializer.serialize_f64(*f),
            Value::Decimal(d) => serializer.serialize_str(&d.to_string()),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Uuid(u) => serializer.serialize_str(&u.to_string()),
            Value::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => {
                serializer.serialize_str(&dt.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            Value::DateTimeTz(dt) => {
                // Columnar stores parse naive datetimes; normalise to UTC.
                let utc = dt.with_timezone(&chrono::Utc);
                serializer.serialize_str(&utc.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

/// A row keyed by column name.
pub type Record = BTreeMap<String, Value>;

/// An ordered list of records, the unit of streaming between adapters.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Record>,
}

impl Batch {
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of column names present across the batch's rows.
    ///
    /// Used by the schema evolver to detect fields the destination does not
    /// know about yet.
    pub fn column_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for row in &self.rows {
            for key in row.keys() {
                if !names.contains(key) {
                    names.insert(key.clone());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(Value::from_json(serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from_json(serde_json::json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(serde_json::json!(42)), Value::I64(42));
        assert_eq!(
            Value::from_json(serde_json::json!("hi")),
            Value::Text("hi".into())
        );
    }

    #[test]
    fn test_from_json_keeps_structures() {
        let v = Value::from_json(serde_json::json!({"a": 1}));
        assert!(matches!(v, Value::Json(_)));
        let v = Value::from_json(serde_json::json!([1, 2]));
        assert!(matches!(v, Value::Json(_)));
    }

    #[test]
    fn test_serialize_wire_forms() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let json = serde_json::to_string(&Value::DateTime(dt)).unwrap();
        assert_eq!(json, "\"2024-03-01 12:30:00\"");

        let json = serde_json::to_string(&Value::I64(7)).unwrap();
        assert_eq!(json, "7");

        let json = serde_json::to_string(&Value::Null).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_batch_column_union() {
        let mut r1 = Record::new();
        r1.insert("id".into(), Value::I64(1));
        r1.insert("name".into(), Value::Text("a".into()));
        let mut r2 = Record::new();
        r2.insert("id".into(), Value::I64(2));
        r2.insert("email".into(), Value::Text("b@c".into()));

        let batch = Batch::new(vec![r1, r2]);
        let names: Vec<_> = batch.column_names().into_iter().collect();
        assert_eq!(names, vec!["email", "id", "name"]);
    }
}
