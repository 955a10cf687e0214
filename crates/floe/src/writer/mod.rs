//! Multi-table batch writer.
//!
//! Buffers change events per table and schema version, then flushes every
//! open shard as one immutable object in the staging bucket. Batches never
//! span a DDL event for their table: the consumer flushes before applying
//! schema changes, and a schema fingerprint change opens a fresh shard.
//!
//! Rows stay in memory until the object write succeeds. There is no local
//! spill: if the process dies before a flush the events are replayed from
//! the last committed offset, and the merge query absorbs the duplicates.

pub mod encode;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use object_store::path::Path;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use floe_core::retry::{run_with_retries, ErrorClass, RetryPolicy};
use floe_core::{emit, StorageProviderRef};

use crate::error::BlobError;
use crate::event::{DmlEvent, SourceOrdering, SourceProperties};
use crate::metrics::events::BlobWritten;
use crate::schema::{
    staging_schema, target_schema, ColumnType, TableSchema, BATCH_ID, BEFORE_PREFIX, OP, ROW_ID,
    SEQUENCE_NUM, SORT_KEYS, SORT_KEY_FIELD, SOURCE_TIMESTAMP,
};
use crate::warehouse::{LoadFormat, TableId};

use encode::StagedRow;

/// How many blob writes run concurrently during a flush.
const MAX_CONCURRENT_WRITES: usize = 4;

/// Whether a batch holds snapshot or streaming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    /// Initial-copy data, bulk loaded straight into the target table.
    Snapshot,
    /// Live replication data, loaded to staging and merged.
    Streaming,
}

/// Per-table information resolved by the consumer for each append.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub table: TableId,
    pub source_schema_name: Option<String>,
    pub source_schema: TableSchema,
    pub primary_keys: Vec<String>,
    pub sort_key_types: Option<Vec<ColumnType>>,
}

/// Descriptor for one written batch object.
#[derive(Debug, Clone)]
pub struct TableBlob {
    pub table: TableId,
    pub source_schema_name: Option<String>,
    pub batch_id: i64,
    pub blob_type: BlobType,
    pub path: Path,
    pub staging_schema: TableSchema,
    pub target_schema: TableSchema,
    pub num_events: usize,
    pub format: LoadFormat,
}

/// Result of a flush, grouped by how the blobs are applied.
#[derive(Debug, Default)]
pub struct FlushedBatches {
    pub snapshot: Vec<TableBlob>,
    pub streaming: Vec<TableBlob>,
}

impl FlushedBatches {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty() && self.streaming.is_empty()
    }
}

struct Shard {
    spec: ShardSpec,
    batch_id: i64,
    snapshot_only: bool,
    staging_schema: TableSchema,
    target_schema: TableSchema,
    rows: Vec<StagedRow>,
}

/// Buffers events per `(table, schema fingerprint)` and writes each shard
/// as one object under `<prefix>/<dataset>/<table>/<batch_id>`.
pub struct BatchWriter {
    storage: StorageProviderRef,
    object_prefix: String,
    source: SourceProperties,
    shards: IndexMap<(TableId, u64), Shard>,
}

impl BatchWriter {
    pub fn new(storage: StorageProviderRef, application_name: &str, source: SourceProperties) -> Self {
        Self {
            storage,
            object_prefix: format!("cdap/delta/{application_name}"),
            source,
            shards: IndexMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Buffer one event into the shard for its table and schema version.
    pub fn append(&mut self, event: &DmlEvent, spec: &ShardSpec) {
        let fingerprint = spec.source_schema.fingerprint();
        let key = (spec.table.clone(), fingerprint);
        let source = self.source;

        let shard = self.shards.entry(key).or_insert_with(|| {
            debug!(table = %spec.table, fingerprint, "Opening batch shard");
            Shard {
                batch_id: Utc::now().timestamp_millis(),
                snapshot_only: true,
                staging_schema: staging_schema(
                    &spec.source_schema,
                    &spec.primary_keys,
                    source.row_id_supported,
                    source.ordering,
                    spec.sort_key_types.as_deref(),
                ),
                target_schema: target_schema(
                    &spec.source_schema,
                    source.ordering,
                    spec.sort_key_types.as_deref(),
                ),
                spec: spec.clone(),
                rows: Vec::new(),
            }
        });

        shard.snapshot_only &= event.snapshot;
        let row = staged_row(event, shard, source);
        shard.rows.push(row);
    }

    /// Close every open shard and write each as one immutable object.
    ///
    /// Write failures are retried under the batch-write policy; once the
    /// policy is exhausted the error propagates so the host can reset to
    /// the last committed offset and replay.
    pub async fn flush(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<FlushedBatches, BlobError> {
        let shards: Vec<Shard> = self
            .shards
            .drain(..)
            .map(|(_, shard)| shard)
            .filter(|shard| !shard.rows.is_empty())
            .collect();
        if shards.is_empty() {
            return Ok(FlushedBatches::default());
        }

        let policy = write_retry_policy();
        let blobs: Vec<TableBlob> = futures::stream::iter(shards.into_iter().map(|shard| {
            let storage = self.storage.clone();
            let prefix = self.object_prefix.clone();
            let policy = policy.clone();
            async move { write_shard(storage, &prefix, shard, &policy, shutdown).await }
        }))
        .buffer_unordered(MAX_CONCURRENT_WRITES)
        .try_collect()
        .await?;

        let mut flushed = FlushedBatches::default();
        for blob in blobs {
            match blob.blob_type {
                BlobType::Snapshot => flushed.snapshot.push(blob),
                BlobType::Streaming => flushed.streaming.push(blob),
            }
        }
        Ok(flushed)
    }
}

/// Retry policy for staging bucket writes.
fn write_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 25,
        max_duration: std::time::Duration::from_secs(120),
        base_delay: std::time::Duration::from_secs(1),
        max_delay: std::time::Duration::from_secs(30),
        jitter: 0.1,
    }
}

fn staged_row(event: &DmlEvent, shard: &Shard, source: SourceProperties) -> StagedRow {
    let mut row = Map::new();
    row.insert(OP.to_string(), Value::from(event.kind.op_value()));
    row.insert(BATCH_ID.to_string(), Value::from(shard.batch_id));
    row.insert(SEQUENCE_NUM.to_string(), Value::from(event.sequence_number));

    if source.row_id_supported {
        row.insert(
            ROW_ID.to_string(),
            event.row_id.clone().map(Value::from).unwrap_or(Value::Null),
        );
    } else {
        for key in &shard.spec.primary_keys {
            let value = event.key_value(key).cloned().unwrap_or(Value::Null);
            row.insert(format!("{BEFORE_PREFIX}{key}"), value);
        }
    }

    if source.ordering == SourceOrdering::Unordered {
        row.insert(
            SOURCE_TIMESTAMP.to_string(),
            event.source_timestamp.map(Value::from).unwrap_or(Value::Null),
        );
        if shard
            .staging_schema
            .field(SORT_KEYS)
            .is_some()
        {
            let sort_value = event
                .sort_keys
                .as_ref()
                .filter(|keys| !keys.is_empty())
                .map(|keys| {
                    let mut sort = Map::new();
                    for (i, key) in keys.iter().enumerate() {
                        sort.insert(format!("{SORT_KEY_FIELD}_{i}"), key.value.clone());
                    }
                    Value::Object(sort)
                })
                .unwrap_or(Value::Null);
            row.insert(SORT_KEYS.to_string(), sort_value);
        }
    }

    for field in &shard.spec.source_schema.fields {
        let value = event.after.get(&field.name).cloned().unwrap_or(Value::Null);
        row.insert(field.name.clone(), value);
    }
    row
}

async fn write_shard(
    storage: StorageProviderRef,
    prefix: &str,
    shard: Shard,
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
) -> Result<TableBlob, BlobError> {
    let table = shard.spec.table.clone();
    let record_name = format!("{}_batch", table.table);

    let (bytes, format) = if shard.staging_schema.is_avro_supported() {
        (
            encode::encode_avro(&shard.staging_schema, &record_name, &shard.rows)?,
            LoadFormat::Avro,
        )
    } else {
        (
            encode::encode_ndjson(&shard.staging_schema, &shard.rows)?,
            LoadFormat::Json,
        )
    };

    let path = Path::from(format!(
        "{prefix}/{}/{}/{}",
        table.dataset, table.table, shard.batch_id
    ));
    let payload = bytes::Bytes::from(bytes);
    let size = payload.len();

    run_with_retries(
        policy,
        shutdown,
        |_| ErrorClass::Transient,
        |attempt, error| {
            tracing::warn!(table = %table, attempt, %error, "Batch object write failed");
        },
        |_| {
            let storage = storage.clone();
            let path = path.clone();
            let payload = payload.clone();
            async move { storage.put(&path, payload).await }
        },
    )
    .await
    .map_err(|e| match e.into_source() {
        Some(source) => BlobError::Write { source },
        None => BlobError::Write {
            source: floe_core::StorageError::Io {
                source: std::io::Error::other("batch write cancelled by shutdown"),
            },
        },
    })?;

    emit!(BlobWritten {
        table: table.to_string(),
        bytes: size,
        events: shard.rows.len(),
    });
    info!(
        table = %table,
        batch_id = shard.batch_id,
        events = shard.rows.len(),
        bytes = size,
        "Wrote batch object"
    );

    Ok(TableBlob {
        table,
        source_schema_name: shard.spec.source_schema_name.clone(),
        batch_id: shard.batch_id,
        blob_type: if shard.snapshot_only {
            BlobType::Snapshot
        } else {
            BlobType::Streaming
        },
        path,
        staging_schema: shard.staging_schema,
        target_schema: shard.target_schema,
        num_events: shard.rows.len(),
        format,
    })
}
