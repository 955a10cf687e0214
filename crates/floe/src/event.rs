//! Change event model.
//!
//! Events arrive from the upstream source as a single stream of DDL and
//! DML records, each carrying an opaque offset and a monotonically
//! non-decreasing sequence number assigned by the source. The consumer
//! never invents either; it only records and commits them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::{ColumnType, TableSchema};

/// Opaque source offset: a set of key/value markers owned by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub BTreeMap<String, String>);

/// How the source orders its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrdering {
    #[default]
    Ordered,
    Unordered,
}

/// Capabilities declared by the upstream source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SourceProperties {
    #[serde(default)]
    pub ordering: SourceOrdering,
    #[serde(default)]
    pub row_id_supported: bool,
}

/// The kind of a DDL event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlKind {
    CreateDatabase,
    DropDatabase,
    CreateTable,
    DropTable,
    AlterTable,
    TruncateTable,
    RenameTable,
}

impl DdlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlKind::CreateDatabase => "create_database",
            DdlKind::DropDatabase => "drop_database",
            DdlKind::CreateTable => "create_table",
            DdlKind::DropTable => "drop_table",
            DdlKind::AlterTable => "alter_table",
            DdlKind::TruncateTable => "truncate_table",
            DdlKind::RenameTable => "rename_table",
        }
    }
}

impl fmt::Display for DdlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schema-changing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlEvent {
    pub kind: DdlKind,
    pub database: String,
    /// Schema name within the source database, where the source has one.
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    /// Previous table name, set only for renames.
    #[serde(default)]
    pub prev_table: Option<String>,
    /// Post-event column schema, absent for database-level events.
    #[serde(default)]
    pub schema: Option<TableSchema>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    pub offset: Offset,
    pub sequence_number: i64,
    #[serde(default)]
    pub snapshot: bool,
}

/// The kind of a DML event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

impl DmlKind {
    /// The `_op` column value written to staged rows.
    pub fn op_value(&self) -> &'static str {
        match self {
            DmlKind::Insert => "INSERT",
            DmlKind::Update => "UPDATE",
            DmlKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for DmlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_value())
    }
}

/// One sort key value carried by events from unordered sources.
///
/// Sort keys totally order events when the sequence number cannot; the
/// tuple of values is compared lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub key_type: ColumnType,
    pub value: Value,
}

/// A row-changing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmlEvent {
    pub kind: DmlKind,
    pub database: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    pub table: String,
    /// Before-image of the primary key columns; set for updates whose key
    /// changed.
    #[serde(default)]
    pub before: Option<BTreeMap<String, Value>>,
    /// Post-image row values, keyed by source column name.
    pub after: BTreeMap<String, Value>,
    /// Opaque per-row identifier, present when the source assigns one.
    #[serde(default)]
    pub row_id: Option<String>,
    /// Event time at the source, microseconds since epoch.
    #[serde(default)]
    pub source_timestamp: Option<i64>,
    #[serde(default)]
    pub sort_keys: Option<Vec<SortKey>>,
    pub offset: Offset,
    pub sequence_number: i64,
    #[serde(default)]
    pub snapshot: bool,
}

impl DmlEvent {
    /// The value used to locate the existing row for a primary key column:
    /// the before-image when present, otherwise the post-image.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        if let Some(before) = &self.before {
            if let Some(value) = before.get(column) {
                return Some(value);
            }
        }
        self.after.get(column)
    }
}

/// A change event of either kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Ddl(DdlEvent),
    Dml(DmlEvent),
}

impl ChangeEvent {
    pub fn sequence_number(&self) -> i64 {
        match self {
            ChangeEvent::Ddl(event) => event.sequence_number,
            ChangeEvent::Dml(event) => event.sequence_number,
        }
    }
}
