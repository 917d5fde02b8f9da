//! Schema and metadata types for tables, columns, indexes, and constraints.
//!
//! These types provide an adapter-neutral representation of source schema
//! metadata. Relational sources fill every field from catalog queries; API
//! sources produce a best-effort union of observed fields and leave the
//! constraint lists empty.

use serde::{Deserialize, Serialize};

/// Table metadata as discovered from a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table identifier, possibly schema-qualified (`schema.table`).
    /// For API sources this is the logical module/resource name.
    pub name: String,

    /// Column definitions, in the order the source reports them.
    /// Destination DDL is emitted in this order.
    pub columns: Vec<ColumnDef>,

    /// Primary key column names (empty where the source has no concept).
    pub primary_key: Vec<String>,

    /// Foreign key constraints.
    pub foreign_keys: Vec<ForeignKey>,

    /// Unique constraints.
    pub unique_constraints: Vec<UniqueConstraint>,

    /// Non-primary-key indexes.
    pub indexes: Vec<IndexDef>,
}

impl TableDescriptor {
    /// Descriptor with columns only; constraints are loaded separately.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// The unqualified table name (last segment of `schema.table`).
    pub fn base_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Find the first date/timestamp column matching the candidate names,
    /// used as the change-tracking watermark for incremental sync.
    ///
    /// For timezone-naive types a warning is logged since mismatched
    /// timezones can silently skip rows.
    pub fn find_watermark_column(&self, candidates: &[&str]) -> Option<String> {
        for name in candidates {
            if let Some(col) = self
                .columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
            {
                if is_date_type(&col.source_type) {
                    if is_timezone_naive(&col.source_type) {
                        tracing::warn!(
                            "Table {}: using timezone-naive column '{}' ({}) for incremental sync; \
                             ensure the database timezone matches UTC",
                            self.name,
                            col.name,
                            col.source_type
                        );
                    }
                    return Some(col.name.clone());
                }
            }
        }
        // Fall back to any date/time column in schema order.
        self.columns
            .iter()
            .find(|c| is_date_type(&c.source_type))
            .map(|c| c.name.clone())
    }
}

/// Candidate watermark column names checked before falling back to the
/// first date/time column.
pub const WATERMARK_CANDIDATES: &[&str] = &[
    "updated_at",
    "modified_at",
    "last_modified",
    "modified_time",
    "changed_date",
    "created_at",
];

fn is_date_type(source_type: &str) -> bool {
    let t = source_type.to_lowercase();
    t.contains("timestamp") || t.contains("datetime") || t.contains("date") || t.contains("time")
}

fn is_timezone_naive(source_type: &str) -> bool {
    let t = source_type.to_lowercase();
    (t.starts_with("datetime") && !t.contains("offset"))
        || t == "timestamp"
        || t.contains("without time zone")
}

/// Column metadata as reported by a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column (or API field) name.
    pub name: String,

    /// Source type rendered as text, including length/precision where the
    /// source reports them (e.g. `varchar(50)`, `numeric(10,2)`, `string`).
    pub source_type: String,

    /// Whether the column allows NULL. API-source fields are always nullable.
    pub nullable: bool,

    /// Column default expression, verbatim from the source catalog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            nullable,
            default: None,
        }
    }

    /// Parse `(precision, scale)` out of a rendered type like `numeric(10,2)`.
    pub fn precision_scale(&self) -> Option<(u32, u32)> {
        let open = self.source_type.find('(')?;
        let close = self.source_type.find(')')?;
        let inner = &self.source_type[open + 1..close];
        let mut parts = inner.splitn(2, ',');
        let precision = parts.next()?.trim().parse().ok()?;
        let scale = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
        Some((precision, scale))
    }

    /// Parse a length out of a rendered type like `varchar(255)`.
    pub fn length(&self) -> Option<u32> {
        self.precision_scale().map(|(p, _)| p)
    }

    /// The bare type name without length/precision decoration.
    pub fn base_type(&self) -> &str {
        match self.source_type.find('(') {
            Some(idx) => self.source_type[..idx].trim_end(),
            None => &self.source_type,
        }
    }
}

/// A column after type mapping, ready for destination DDL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedColumn {
    /// Destination column name (sanitized where the destination requires it).
    pub name: String,

    /// Destination type string (e.g. `Nullable(String)`, `varchar(255)`).
    pub target_type: String,

    /// Whether the destination column allows NULL.
    pub nullable: bool,

    /// Translated default expression, if one survived translation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Foreign key metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Referencing column names.
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced column names.
    pub ref_columns: Vec<String>,
}

/// Unique constraint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Index metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(columns: Vec<ColumnDef>) -> TableDescriptor {
        TableDescriptor::new("public.users", columns)
    }

    #[test]
    fn test_base_name_strips_schema() {
        let t = table_with(vec![]);
        assert_eq!(t.base_name(), "users");
        let t2 = TableDescriptor::new("Contacts", vec![]);
        assert_eq!(t2.base_name(), "Contacts");
    }

    #[test]
    fn test_precision_scale_parsing() {
        let col = ColumnDef::new("amount", "numeric(10,2)", true);
        assert_eq!(col.precision_scale(), Some((10, 2)));
        assert_eq!(col.base_type(), "numeric");

        let col = ColumnDef::new("name", "varchar(50)", true);
        assert_eq!(col.length(), Some(50));

        let col = ColumnDef::new("id", "integer", false);
        assert_eq!(col.precision_scale(), None);
        assert_eq!(col.base_type(), "integer");
    }

    #[test]
    fn test_watermark_prefers_candidates() {
        let t = table_with(vec![
            ColumnDef::new("id", "integer", false),
            ColumnDef::new("created", "timestamp", true),
            ColumnDef::new("updated_at", "timestamp with time zone", true),
        ]);
        assert_eq!(
            t.find_watermark_column(WATERMARK_CANDIDATES).as_deref(),
            Some("updated_at")
        );
    }

    #[test]
    fn test_watermark_falls_back_to_first_date_column() {
        let t = table_with(vec![
            ColumnDef::new("id", "integer", false),
            ColumnDef::new("created", "timestamp", true),
        ]);
        assert_eq!(
            t.find_watermark_column(WATERMARK_CANDIDATES).as_deref(),
            Some("created")
        );
    }

    #[test]
    fn test_watermark_none_without_date_columns() {
        let t = table_with(vec![
            ColumnDef::new("id", "integer", false),
            ColumnDef::new("name", "varchar(50)", true),
        ]);
        assert_eq!(t.find_watermark_column(WATERMARK_CANDIDATES), None);
    }
}
