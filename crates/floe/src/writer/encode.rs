//! Batch blob encoding.
//!
//! Staged rows are written as a single Avro object container file per
//! shard, using logical types for temporal columns. Shards whose schema
//! contains a type the Avro load path cannot carry (NUMERIC, DATETIME)
//! are written as newline-delimited JSON instead; the load stage picks
//! the matching source format.

use apache_avro::types::Value as AvroValue;
use apache_avro::{Schema as AvroSchema, Writer as AvroWriter};
use base64::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike};
use serde_json::{json, Map, Value};
use snafu::prelude::*;

use crate::error::{AvroEncodeSnafu, AvroSchemaSnafu, BlobError, JsonEncodeSnafu};
use crate::schema::{ColumnSchema, ColumnType, TableSchema};

/// A staged row: column name to JSON value, bookkeeping columns included.
pub type StagedRow = Map<String, Value>;

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch is a valid date")
}

fn avro_type_json(column_type: &ColumnType, name: &str) -> Result<Value, BlobError> {
    let type_json = match column_type {
        ColumnType::Bool => json!("boolean"),
        ColumnType::Int64 => json!("long"),
        ColumnType::Float64 => json!("double"),
        ColumnType::String => json!("string"),
        ColumnType::Bytes => json!("bytes"),
        ColumnType::Timestamp => json!({"type": "long", "logicalType": "timestamp-micros"}),
        ColumnType::Time => json!({"type": "long", "logicalType": "time-micros"}),
        ColumnType::Date => json!({"type": "int", "logicalType": "date"}),
        ColumnType::Struct(fields) => {
            let field_json = fields
                .iter()
                .map(|f| field_schema_json(f))
                .collect::<Result<Vec<_>, _>>()?;
            json!({"type": "record", "name": format!("{name}_struct"), "fields": field_json})
        }
        ColumnType::Numeric | ColumnType::Datetime => {
            return crate::error::ValueMismatchSnafu {
                column: name,
                message: "type has no Avro representation, use the JSON format".to_string(),
            }
            .fail();
        }
    };
    Ok(type_json)
}

fn field_schema_json(column: &ColumnSchema) -> Result<Value, BlobError> {
    let base = avro_type_json(&column.column_type, &column.name)?;
    let type_json = if column.nullable {
        json!(["null", base])
    } else {
        base
    };
    Ok(json!({"name": column.name, "type": type_json}))
}

/// Build the Avro schema for a shard.
pub fn avro_schema(schema: &TableSchema, record_name: &str) -> Result<AvroSchema, BlobError> {
    let fields = schema
        .fields
        .iter()
        .map(field_schema_json)
        .collect::<Result<Vec<_>, _>>()?;
    let record = json!({
        "type": "record",
        "name": record_name,
        "fields": fields,
    });
    AvroSchema::parse(&record).context(AvroSchemaSnafu)
}

fn timestamp_micros(value: &Value, column: &str) -> Result<i64, BlobError> {
    match value {
        Value::Number(n) => n.as_i64().context(crate::error::ValueMismatchSnafu {
            column,
            message: "timestamp must be an integer microsecond count".to_string(),
        }),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_micros())
            .ok()
            .context(crate::error::ValueMismatchSnafu {
                column,
                message: format!("'{s}' is not an RFC 3339 timestamp"),
            }),
        _ => crate::error::ValueMismatchSnafu {
            column,
            message: "timestamp must be an integer or RFC 3339 string".to_string(),
        }
        .fail(),
    }
}

fn date_days(value: &Value, column: &str) -> Result<i32, BlobError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|d| d as i32)
            .context(crate::error::ValueMismatchSnafu {
                column,
                message: "date must be an integer day count".to_string(),
            }),
        Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| (d - epoch()).num_days() as i32)
            .ok()
            .context(crate::error::ValueMismatchSnafu {
                column,
                message: format!("'{s}' is not a YYYY-MM-DD date"),
            }),
        _ => crate::error::ValueMismatchSnafu {
            column,
            message: "date must be an integer or YYYY-MM-DD string".to_string(),
        }
        .fail(),
    }
}

fn time_micros(value: &Value, column: &str) -> Result<i64, BlobError> {
    match value {
        Value::Number(n) => n.as_i64().context(crate::error::ValueMismatchSnafu {
            column,
            message: "time must be an integer microsecond count".to_string(),
        }),
        Value::String(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
            .map(|t| t.num_seconds_from_midnight() as i64 * 1_000_000 + (t.nanosecond() / 1000) as i64)
            .ok()
            .context(crate::error::ValueMismatchSnafu {
                column,
                message: format!("'{s}' is not a HH:MM:SS time"),
            }),
        _ => crate::error::ValueMismatchSnafu {
            column,
            message: "time must be an integer or HH:MM:SS string".to_string(),
        }
        .fail(),
    }
}

fn scalar_avro_value(value: &Value, column: &ColumnSchema) -> Result<AvroValue, BlobError> {
    let name = column.name.as_str();
    let mismatch = |message: String| crate::error::ValueMismatchSnafu {
        column: name,
        message,
    };

    let avro = match &column.column_type {
        ColumnType::Bool => AvroValue::Boolean(
            value
                .as_bool()
                .context(mismatch("expected a boolean".to_string()))?,
        ),
        ColumnType::Int64 => AvroValue::Long(
            value
                .as_i64()
                .context(mismatch("expected an integer".to_string()))?,
        ),
        ColumnType::Float64 => AvroValue::Double(
            value
                .as_f64()
                .context(mismatch("expected a number".to_string()))?,
        ),
        ColumnType::String => match value {
            Value::String(s) => AvroValue::String(s.clone()),
            other => AvroValue::String(other.to_string()),
        },
        ColumnType::Bytes => {
            let encoded = value
                .as_str()
                .context(mismatch("expected base64-encoded bytes".to_string()))?;
            let bytes = BASE64_STANDARD
                .decode(encoded)
                .ok()
                .context(mismatch("invalid base64".to_string()))?;
            AvroValue::Bytes(bytes)
        }
        ColumnType::Timestamp => AvroValue::TimestampMicros(timestamp_micros(value, name)?),
        ColumnType::Time => AvroValue::TimeMicros(time_micros(value, name)?),
        ColumnType::Date => AvroValue::Date(date_days(value, name)?),
        ColumnType::Struct(fields) => {
            let object = value
                .as_object()
                .context(mismatch("expected an object".to_string()))?;
            let record = fields
                .iter()
                .map(|field| {
                    let field_value = object.get(&field.name).unwrap_or(&Value::Null);
                    avro_value(field_value, field).map(|v| (field.name.clone(), v))
                })
                .collect::<Result<Vec<_>, _>>()?;
            AvroValue::Record(record)
        }
        ColumnType::Numeric | ColumnType::Datetime => {
            return mismatch("type has no Avro representation".to_string()).fail();
        }
    };
    Ok(avro)
}

fn avro_value(value: &Value, column: &ColumnSchema) -> Result<AvroValue, BlobError> {
    if column.nullable {
        if value.is_null() {
            Ok(AvroValue::Union(0, Box::new(AvroValue::Null)))
        } else {
            let inner = scalar_avro_value(value, column)?;
            Ok(AvroValue::Union(1, Box::new(inner)))
        }
    } else if value.is_null() {
        crate::error::ValueMismatchSnafu {
            column: &column.name,
            message: "null value for a required column".to_string(),
        }
        .fail()
    } else {
        scalar_avro_value(value, column)
    }
}

/// Encode staged rows as an Avro object container file.
pub fn encode_avro(
    schema: &TableSchema,
    record_name: &str,
    rows: &[StagedRow],
) -> Result<Vec<u8>, BlobError> {
    let avro = avro_schema(schema, record_name)?;
    let mut writer = AvroWriter::new(&avro, Vec::new());
    for row in rows {
        let record = schema
            .fields
            .iter()
            .map(|field| {
                let value = row.get(&field.name).unwrap_or(&Value::Null);
                avro_value(value, field).map(|v| (field.name.clone(), v))
            })
            .collect::<Result<Vec<_>, _>>()?;
        writer
            .append(AvroValue::Record(record))
            .context(AvroEncodeSnafu)?;
    }
    writer.into_inner().context(AvroEncodeSnafu)
}

/// Render a temporal or binary value the way the JSON load path expects.
fn json_load_value(value: &Value, column: &ColumnSchema) -> Result<Value, BlobError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let rendered = match &column.column_type {
        ColumnType::Timestamp => {
            let micros = timestamp_micros(value, &column.name)?;
            let dt = DateTime::from_timestamp_micros(micros).context(
                crate::error::ValueMismatchSnafu {
                    column: &column.name,
                    message: "timestamp out of range".to_string(),
                },
            )?;
            Value::String(dt.to_rfc3339())
        }
        ColumnType::Date => {
            let days = date_days(value, &column.name)?;
            let date = epoch() + chrono::Days::new(days.max(0) as u64);
            Value::String(date.format("%Y-%m-%d").to_string())
        }
        ColumnType::Time => {
            let micros = time_micros(value, &column.name)?;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1000) as u32,
            )
            .context(crate::error::ValueMismatchSnafu {
                column: &column.name,
                message: "time out of range".to_string(),
            })?;
            Value::String(time.format("%H:%M:%S%.6f").to_string())
        }
        ColumnType::Struct(fields) => {
            let object = value.as_object().context(crate::error::ValueMismatchSnafu {
                column: &column.name,
                message: "expected an object".to_string(),
            })?;
            let mut rendered = Map::new();
            for field in fields {
                let field_value = object.get(&field.name).unwrap_or(&Value::Null);
                rendered.insert(field.name.clone(), json_load_value(field_value, field)?);
            }
            Value::Object(rendered)
        }
        _ => value.clone(),
    };
    Ok(rendered)
}

/// Encode staged rows as newline-delimited JSON.
pub fn encode_ndjson(schema: &TableSchema, rows: &[StagedRow]) -> Result<Vec<u8>, BlobError> {
    let mut out = Vec::new();
    for row in rows {
        let mut rendered = Map::new();
        for field in &schema.fields {
            let value = row.get(&field.name).unwrap_or(&Value::Null);
            rendered.insert(field.name.clone(), json_load_value(value, field)?);
        }
        serde_json::to_writer(&mut out, &Value::Object(rendered)).context(JsonEncodeSnafu)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::Reader;
    use serde_json::json;

    fn staged_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::required("_op", ColumnType::String),
            ColumnSchema::required("_batch_id", ColumnType::Int64),
            ColumnSchema::required("_sequence_num", ColumnType::Int64),
            ColumnSchema::nullable("_before_id", ColumnType::Int64),
            ColumnSchema::required("id", ColumnType::Int64),
            ColumnSchema::nullable("name", ColumnType::String),
        ])
    }

    fn row(op: &str, seq: i64, before: Option<i64>, id: i64, name: &str) -> StagedRow {
        let mut row = Map::new();
        row.insert("_op".to_string(), json!(op));
        row.insert("_batch_id".to_string(), json!(1234567890i64));
        row.insert("_sequence_num".to_string(), json!(seq));
        row.insert("_before_id".to_string(), before.map(|v| json!(v)).unwrap_or(Value::Null));
        row.insert("id".to_string(), json!(id));
        row.insert("name".to_string(), json!(name));
        row
    }

    #[test]
    fn test_avro_roundtrip() {
        let schema = staged_schema();
        let rows = vec![
            row("INSERT", 2, Some(0), 0, "alice"),
            row("UPDATE", 3, Some(0), 1, "alice"),
        ];
        let bytes = encode_avro(&schema, "users_batch", &rows).unwrap();

        let reader = Reader::new(&bytes[..]).unwrap();
        let decoded: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 2);

        match &decoded[0] {
            AvroValue::Record(fields) => {
                let by_name: std::collections::HashMap<_, _> =
                    fields.iter().map(|(n, v)| (n.as_str(), v)).collect();
                assert_eq!(**by_name.get("_op").unwrap(), AvroValue::String("INSERT".into()));
                assert_eq!(**by_name.get("_sequence_num").unwrap(), AvroValue::Long(2));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_avro_null_for_required_column_rejected() {
        let schema = staged_schema();
        let mut bad = row("INSERT", 2, None, 0, "alice");
        bad.insert("id".to_string(), Value::Null);

        let err = encode_avro(&schema, "users_batch", &[bad]).unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_avro_temporal_logical_types() {
        let schema = TableSchema::new(vec![
            ColumnSchema::nullable("ts", ColumnType::Timestamp),
            ColumnSchema::nullable("day", ColumnType::Date),
        ]);
        let mut row = Map::new();
        row.insert("ts".to_string(), json!("2024-05-01T10:30:00Z"));
        row.insert("day".to_string(), json!("2024-05-01"));

        let bytes = encode_avro(&schema, "temporal", &[row]).unwrap();
        let reader = Reader::new(&bytes[..]).unwrap();
        let decoded: Vec<_> = reader.map(|r| r.unwrap()).collect();
        match &decoded[0] {
            AvroValue::Record(fields) => {
                assert!(matches!(
                    fields[0].1,
                    AvroValue::Union(1, ref inner)
                        if matches!(**inner, AvroValue::TimestampMicros(_))
                ));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_numeric_has_no_avro_schema() {
        let schema = TableSchema::new(vec![ColumnSchema::nullable("amount", ColumnType::Numeric)]);
        assert!(avro_schema(&schema, "r").is_err());
    }

    #[test]
    fn test_ndjson_renders_timestamps_as_strings() {
        let schema = TableSchema::new(vec![
            ColumnSchema::required("id", ColumnType::Int64),
            ColumnSchema::nullable("ts", ColumnType::Timestamp),
        ]);
        let mut row = Map::new();
        row.insert("id".to_string(), json!(1));
        // 2024-05-01T00:00:00Z in microseconds
        row.insert("ts".to_string(), json!(1_714_521_600_000_000i64));

        let bytes = encode_ndjson(&schema, &[row]).unwrap();
        let line = String::from_utf8(bytes).unwrap();
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["id"], json!(1));
        assert!(parsed["ts"].as_str().unwrap().starts_with("2024-05-01T00:00:00"));
    }

    #[test]
    fn test_ndjson_one_line_per_row() {
        let schema = staged_schema();
        let rows = vec![row("INSERT", 1, None, 1, "a"), row("DELETE", 2, Some(1), 1, "a")];
        let bytes = encode_ndjson(&schema, &rows).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 2);
    }
}
