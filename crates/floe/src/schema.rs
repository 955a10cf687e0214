//! Column schema model and target/staging schema derivation.
//!
//! The source delivers a column schema with every table-level DDL event.
//! Before anything lands in BigQuery the schema is augmented with
//! bookkeeping columns: the target table carries sequence and tombstone
//! tracking, the staging table additionally carries the per-event columns
//! the merge query joins on.

use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};

use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_schema::TableSchema as BqTableSchema;

use crate::event::{SortKey, SourceOrdering};
use crate::names::normalize_field_name;

/// Latest sequence number applied to the row.
pub const SEQUENCE_NUM: &str = "_sequence_num";
/// Tombstone marker, used by soft deletes and unordered sources.
pub const IS_DELETED: &str = "_is_deleted";
/// Source-assigned row identifier.
pub const ROW_ID: &str = "_row_id";
/// Event time at the source, microseconds.
pub const SOURCE_TIMESTAMP: &str = "_source_timestamp";
/// Struct of sort key values for unordered sources.
pub const SORT_KEYS: &str = "_sort";
/// Field prefix within the `_sort` struct: `_key_0`, `_key_1`, ...
pub const SORT_KEY_FIELD: &str = "_key";
/// Change operation: INSERT, UPDATE or DELETE. Staging only.
pub const OP: &str = "_op";
/// Batch the row was staged under. Staging only.
pub const BATCH_ID: &str = "_batch_id";
/// Before-image column prefix for primary key columns. Staging only.
pub const BEFORE_PREFIX: &str = "_before_";

/// A column's data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    Numeric,
    String,
    Bytes,
    Date,
    Time,
    Datetime,
    Timestamp,
    Struct(Vec<ColumnSchema>),
}

impl ColumnType {
    /// Whether BigQuery accepts this type as a clustering column.
    pub fn is_clustering_supported(&self) -> bool {
        matches!(
            self,
            ColumnType::Bool
                | ColumnType::Int64
                | ColumnType::Numeric
                | ColumnType::String
                | ColumnType::Date
                | ColumnType::Datetime
                | ColumnType::Timestamp
        )
    }

    /// Whether the Avro load path can carry this type faithfully.
    pub fn is_avro_supported(&self) -> bool {
        match self {
            ColumnType::Numeric | ColumnType::Datetime => false,
            ColumnType::Struct(fields) => {
                fields.iter().all(|f| f.column_type.is_avro_supported())
            }
            _ => true,
        }
    }
}

/// A single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// An ordered set of columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub fields: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<ColumnSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&ColumnSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Identity of this schema version. A change in fingerprint ends the
    /// current batch shard for the table.
    pub fn fingerprint(&self) -> u64 {
        let serialized = serde_json::to_string(self).expect("schema serializes");
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether every column survives the Avro load path; otherwise the
    /// batch falls back to newline-delimited JSON.
    pub fn is_avro_supported(&self) -> bool {
        self.fields.iter().all(|f| f.column_type.is_avro_supported())
    }
}

/// Primary key columns eligible for clustering, normalized, in key order.
pub fn clustering_supported_keys(primary_keys: &[String], schema: &TableSchema) -> Vec<String> {
    primary_keys
        .iter()
        .filter(|key| {
            schema
                .field(key)
                .is_some_and(|f| f.column_type.is_clustering_supported())
        })
        .map(|key| normalize_field_name(key))
        .collect()
}

/// The `_sort` struct column for the given sort key types.
pub fn sort_keys_column(sort_key_types: &[ColumnType]) -> ColumnSchema {
    let fields = sort_key_types
        .iter()
        .enumerate()
        .map(|(i, key_type)| ColumnSchema::nullable(format!("{SORT_KEY_FIELD}_{i}"), key_type.clone()))
        .collect();
    ColumnSchema::nullable(SORT_KEYS, ColumnType::Struct(fields))
}

/// Sort key types carried by an event.
pub fn sort_key_types(sort_keys: &[SortKey]) -> Vec<ColumnType> {
    sort_keys.iter().map(|k| k.key_type.clone()).collect()
}

/// Build the target table schema: bookkeeping columns followed by the
/// source columns. The `_sort` struct is added only for unordered sources
/// whose sort key types are known.
pub fn target_schema(
    source: &TableSchema,
    ordering: SourceOrdering,
    sort_key_types: Option<&[ColumnType]>,
) -> TableSchema {
    let mut fields = Vec::with_capacity(source.fields.len() + 5);
    fields.push(ColumnSchema::required(SEQUENCE_NUM, ColumnType::Int64));
    fields.push(ColumnSchema::nullable(IS_DELETED, ColumnType::Bool));
    fields.push(ColumnSchema::nullable(ROW_ID, ColumnType::String));
    fields.push(ColumnSchema::nullable(SOURCE_TIMESTAMP, ColumnType::Int64));
    if ordering == SourceOrdering::Unordered {
        if let Some(types) = sort_key_types {
            if !types.is_empty() {
                fields.push(sort_keys_column(types));
            }
        }
    }
    fields.extend(source.fields.iter().cloned());
    TableSchema::new(fields)
}

/// Build the staging table schema for one batch shard: per-event
/// bookkeeping, then key before-images, then the source columns.
pub fn staging_schema(
    source: &TableSchema,
    primary_keys: &[String],
    row_id_supported: bool,
    ordering: SourceOrdering,
    sort_key_types: Option<&[ColumnType]>,
) -> TableSchema {
    let mut fields = Vec::with_capacity(source.fields.len() + primary_keys.len() + 6);
    fields.push(ColumnSchema::required(OP, ColumnType::String));
    fields.push(ColumnSchema::required(BATCH_ID, ColumnType::Int64));
    fields.push(ColumnSchema::required(SEQUENCE_NUM, ColumnType::Int64));
    if row_id_supported {
        fields.push(ColumnSchema::nullable(ROW_ID, ColumnType::String));
    } else {
        for key in primary_keys {
            let key_type = source
                .field(key)
                .map(|f| f.column_type.clone())
                .unwrap_or(ColumnType::String);
            fields.push(ColumnSchema::nullable(
                format!("{BEFORE_PREFIX}{}", normalize_field_name(key)),
                key_type,
            ));
        }
    }
    if ordering == SourceOrdering::Unordered {
        fields.push(ColumnSchema::nullable(SOURCE_TIMESTAMP, ColumnType::Int64));
        if let Some(types) = sort_key_types {
            if !types.is_empty() {
                fields.push(sort_keys_column(types));
            }
        }
    }
    fields.extend(source.fields.iter().cloned());
    TableSchema::new(fields)
}

/// Convert to the BigQuery API schema model.
pub fn to_bigquery_schema(schema: &TableSchema) -> BqTableSchema {
    BqTableSchema::new(schema.fields.iter().map(to_bigquery_field).collect())
}

fn to_bigquery_field(column: &ColumnSchema) -> TableFieldSchema {
    let mut field = match &column.column_type {
        ColumnType::Bool => TableFieldSchema::bool(&column.name),
        ColumnType::Int64 => TableFieldSchema::integer(&column.name),
        ColumnType::Float64 => TableFieldSchema::float(&column.name),
        ColumnType::Numeric => TableFieldSchema::numeric(&column.name),
        ColumnType::String => TableFieldSchema::string(&column.name),
        ColumnType::Bytes => TableFieldSchema::bytes(&column.name),
        ColumnType::Date => TableFieldSchema::date(&column.name),
        ColumnType::Time => TableFieldSchema::time(&column.name),
        ColumnType::Datetime => TableFieldSchema::date_time(&column.name),
        ColumnType::Timestamp => TableFieldSchema::timestamp(&column.name),
        ColumnType::Struct(fields) => TableFieldSchema::record(
            &column.name,
            fields.iter().map(to_bigquery_field).collect(),
        ),
    };
    field.mode = Some(if column.nullable { "NULLABLE" } else { "REQUIRED" }.to_string());
    field
}
