//! Consumer orchestrator.
//!
//! Receives change events from the host, buffers DML into the batch
//! writer, applies DDL, and periodically flushes: every open shard is
//! written to the staging bucket, loaded, merged, and only then is the
//! offset committed. Public operations are serialized behind one lock;
//! per-table load/merge work inside a flush runs on a bounded pool.
//!
//! A failed scheduled flush latches its error: the next public call
//! re-throws it and the pipeline stops. Replay after a crash is safe
//! because events at or below the per-table merged sequence number are
//! dropped on arrival, and the merge query filters the rest.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use floe_core::retry::{
    run_with_retries, BackoffDecision, ErrorClass, Retrier, RetryError, RetryPolicy,
};
use floe_core::{emit, StorageProviderRef};

use crate::config::Config;
use crate::context::TargetContext;
use crate::ddl::{DdlApplier, NormalizedNames};
use crate::error::ReplicationError;
use crate::event::{DdlEvent, DdlKind, DmlEvent, Offset, SourceOrdering, SourceProperties};
use crate::merge::{delete_mode, run_merge, DeleteMode};
use crate::metrics::events::{EventReceived, FlushCompleted, FlushFailed, OffsetCommitted};
use crate::names::normalize_field_name;
use crate::schema::{sort_key_types, ColumnSchema, ColumnType, TableSchema};
use crate::state::{direct_load_key, encode_bool, SortKeyEntry, TableCache};
use crate::warehouse::{JobKind, TableId, Warehouse, WarehouseError};
use crate::writer::{BatchWriter, BlobType, ShardSpec, TableBlob};

/// How long `stop` waits for in-flight work before abandoning it.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Settings the consumer needs, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub application_name: String,
    pub load_interval: Duration,
    pub staging_table_prefix: String,
    pub require_manual_drops: bool,
    pub soft_deletes: bool,
    pub dataset_name: Option<String>,
    pub max_clustering_columns: usize,
    pub retain_staging_table: bool,
    pub bucket_location: Option<String>,
    pub max_retry_seconds: u64,
    /// Base backoff delay for warehouse metadata operations.
    pub base_retry_delay: Duration,
    /// Bound on tables loaded and merged concurrently in one flush.
    pub max_parallel_tables: usize,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            application_name: config.application_name.clone(),
            load_interval: Duration::from_secs(config.load_interval_secs),
            staging_table_prefix: config.staging_table_prefix.clone(),
            require_manual_drops: config.require_manual_drops,
            soft_deletes: config.soft_deletes,
            dataset_name: config.dataset_name.clone(),
            max_clustering_columns: config.max_clustering_columns(),
            retain_staging_table: config.retain_staging_table(),
            bucket_location: config.staging_bucket_location.clone(),
            max_retry_seconds: config.max_retry_seconds,
            base_retry_delay: Duration::from_secs(10),
            max_parallel_tables: 8,
        }
    }

    /// Policy for warehouse metadata operations and sequence seeding.
    fn base_policy(&self) -> RetryPolicy {
        if self.max_retry_seconds < 1 {
            return RetryPolicy::no_retries();
        }
        RetryPolicy {
            max_attempts: u32::MAX,
            max_duration: Duration::from_secs(self.max_retry_seconds),
            base_delay: self.base_retry_delay,
            max_delay: self.base_retry_delay.max(self.load_interval) + Duration::from_secs(1),
            jitter: 0.1,
        }
    }

    /// Policy for load and merge jobs: long base delay, budget capped by
    /// the configured retry window.
    fn job_policy(&self) -> RetryPolicy {
        if self.max_retry_seconds < 1 {
            return RetryPolicy::no_retries();
        }
        let base = self.max_retry_seconds.min(91).saturating_sub(1).max(1);
        RetryPolicy {
            max_attempts: u32::MAX,
            max_duration: Duration::from_secs(self.max_retry_seconds),
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(base.max(self.load_interval.as_secs()) + 1),
            jitter: 0.1,
        }
    }

    /// Policy for offset commits: effectively unbounded attempts within a
    /// five minute budget.
    fn commit_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            max_duration: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

struct Shared {
    warehouse: Arc<dyn Warehouse>,
    context: Arc<dyn TargetContext>,
    storage: StorageProviderRef,
    settings: ConsumerSettings,
    source: SourceProperties,
    ddl: DdlApplier,
    shutdown: CancellationToken,
}

struct Inner {
    writer: BatchWriter,
    cache: TableCache,
    latest_seen: HashMap<TableId, i64>,
    latest_merged: HashMap<TableId, i64>,
    latest_offset: Option<Offset>,
    latest_sequence: i64,
    /// Error from a failed scheduled flush; re-thrown from the next
    /// public call.
    flush_error: Option<String>,
}

/// Work item for the per-table pool inside one flush.
struct TableWork {
    blob: TableBlob,
    primary_keys: Vec<String>,
    latest_merged: i64,
    sort_entry: Option<SortKeyEntry>,
}

/// The event consumer.
pub struct EventConsumer {
    shared: Arc<Shared>,
    inner: Arc<Mutex<Inner>>,
    flush_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        context: Arc<dyn TargetContext>,
        storage: StorageProviderRef,
        settings: ConsumerSettings,
    ) -> Self {
        let source = context.source_properties();
        let ddl = DdlApplier::new(
            warehouse.clone(),
            context.clone(),
            settings.require_manual_drops,
            settings.max_clustering_columns,
            settings.bucket_location.clone(),
        );
        let writer = BatchWriter::new(storage.clone(), &settings.application_name, source);
        Self {
            shared: Arc::new(Shared {
                warehouse,
                context,
                storage,
                settings,
                source,
                ddl,
                shutdown: CancellationToken::new(),
            }),
            inner: Arc::new(Mutex::new(Inner {
                writer,
                cache: TableCache::default(),
                latest_seen: HashMap::new(),
                latest_merged: HashMap::new(),
                latest_offset: None,
                latest_sequence: 0,
                flush_error: None,
            })),
            flush_task: std::sync::Mutex::new(None),
        }
    }

    /// Start the periodic flush.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let inner = self.inner.clone();
        let interval = shared.settings.load_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut guard = inner.lock().await;
                if guard.flush_error.is_some() {
                    continue;
                }
                if let Err(e) = flush_locked(&shared, &mut guard).await {
                    error!(error = %e, "Scheduled flush failed");
                    emit!(FlushFailed);
                    guard.flush_error = Some(e.to_string());
                }
            }
        });
        *self.flush_task.lock().expect("flush task lock") = Some(handle);
        info!(
            interval_secs = interval.as_secs(),
            "Started scheduled flush"
        );
    }

    /// Stop the consumer: cancel the scheduled flush, signal in-flight
    /// retries to abort, and wait a bounded grace period.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let handle = self.flush_task.lock().expect("flush task lock").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Scheduled flush did not stop within the grace period");
            }
        }
    }

    /// Apply a DDL event.
    pub async fn apply_ddl(&self, event: DdlEvent) -> Result<(), ReplicationError> {
        let shared = &self.shared;
        let mut inner = self.inner.lock().await;
        check_flush_error(&inner)?;

        let names = NormalizedNames::resolve(
            &event.database,
            event.table.as_deref(),
            shared.settings.dataset_name.as_deref(),
            &shared.settings.staging_table_prefix,
        );

        // No batch may span a table-altering event.
        if matches!(
            event.kind,
            DdlKind::DropTable | DdlKind::AlterTable | DdlKind::TruncateTable
        ) {
            flush_locked(shared, &mut inner).await?;
        }

        // Each attempt re-borrows the table cache, so this drives the
        // retrier directly instead of going through `run_with_retries`.
        let mut retrier = Retrier::new(shared.settings.base_policy());
        let result = loop {
            match shared.ddl.apply(&event, &names, &mut inner.cache).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    error!(
                        attempt = retrier.attempt(),
                        kind = %event.kind,
                        error = %e,
                        "Failed to apply DDL event"
                    );
                    if let Some(table) = &names.table {
                        shared
                            .context
                            .set_table_error(&names.dataset, table, &e.to_string());
                    }
                    if classify_replication_error(&e) == ErrorClass::Fatal {
                        break Err(RetryError::Aborted { source: e });
                    }
                    match retrier.backoff(&shared.shutdown).await {
                        BackoffDecision::Retry => {}
                        BackoffDecision::Exhausted => {
                            break Err(RetryError::Exhausted {
                                attempts: retrier.attempt() + 1,
                                source: e,
                            });
                        }
                        BackoffDecision::Cancelled => break Err(RetryError::Cancelled),
                    }
                }
            }
        };
        map_retry_result(result, || format!("apply '{}' DDL event", event.kind))?;

        inner.latest_offset = Some(event.offset.clone());
        inner.latest_sequence = event.sequence_number;
        shared.context.increment_count(event.kind.as_str());
        emit!(EventReceived {
            operation: event.kind.as_str(),
        });
        if let Some(table) = &names.table {
            if event.snapshot {
                shared.context.set_table_snapshotting(&names.dataset, table);
            } else {
                shared.context.set_table_replicating(&names.dataset, table);
            }
        }
        Ok(())
    }

    /// Apply a DML event.
    pub async fn apply_dml(&self, event: DmlEvent) -> Result<(), ReplicationError> {
        let shared = &self.shared;
        let mut inner = self.inner.lock().await;
        check_flush_error(&inner)?;

        let names = NormalizedNames::resolve(
            &event.database,
            Some(&event.table),
            shared.settings.dataset_name.as_deref(),
            &shared.settings.staging_table_prefix,
        );
        let table = TableId::new(
            names.dataset.clone(),
            names.table.clone().unwrap_or_default(),
        );
        let event = normalize_dml(event);

        // The first event for a table seeds the merged high-water mark
        // from the target, so replay across restarts drops duplicates.
        if !inner.latest_merged.contains_key(&table) {
            let seeded = seed_latest_merged(shared, &table).await?;
            debug!(table = %table, latest_merged = seeded, "Seeded merged sequence number");
            inner.latest_merged.insert(table.clone(), seeded);
            inner.latest_seen.insert(table.clone(), seeded);
        }

        // Remember sort keys the first time an unordered source sends
        // them, before the event is buffered: the shard opened for this
        // event must already carry the `_sort` column.
        if shared.source.ordering == SourceOrdering::Unordered {
            let have_sort_keys = inner
                .cache
                .sort_keys(shared.context.as_ref(), &table)
                .await?
                .is_some();
            if !have_sort_keys {
                if let Some(keys) = &event.sort_keys {
                    inner
                        .cache
                        .store_sort_keys(shared.context.as_ref(), &table, sort_key_types(keys))
                        .await?;
                }
            }
        }

        let latest_merged = inner.latest_merged[&table];
        if event.sequence_number > latest_merged {
            let inner_ref = &mut *inner;
            let source_schema = match inner_ref.cache.schema(&table) {
                Some(schema) => schema.clone(),
                None => {
                    let inferred = infer_schema(&event.after);
                    warn!(
                        table = %table,
                        "No schema seen for table; inferring one from row values"
                    );
                    inner_ref.cache.cache_schema(&table, inferred.clone());
                    inferred
                }
            };
            let primary_keys = inner_ref
                .cache
                .primary_keys(shared.context.as_ref(), &table)
                .await?;
            let sort_entry = inner_ref.cache.sort_keys(shared.context.as_ref(), &table).await?;

            let spec = ShardSpec {
                table: table.clone(),
                source_schema_name: event.schema_name.clone(),
                source_schema,
                primary_keys,
                sort_key_types: sort_entry.map(|e| e.types),
            };
            inner_ref.writer.append(&event, &spec);
            inner_ref.latest_seen.insert(table.clone(), event.sequence_number);
        } else {
            debug!(
                table = %table,
                sequence_number = event.sequence_number,
                latest_merged,
                "Dropping already-merged event"
            );
        }

        inner.latest_offset = Some(event.offset.clone());
        inner.latest_sequence = event.sequence_number;
        shared.context.increment_count(event.kind.op_value());
        emit!(EventReceived {
            operation: event.kind.op_value(),
        });
        if let Some(table_name) = &names.table {
            if event.snapshot {
                shared
                    .context
                    .set_table_snapshotting(&names.dataset, table_name);
            } else {
                shared
                    .context
                    .set_table_replicating(&names.dataset, table_name);
            }
        }
        Ok(())
    }

    /// Flush buffered batches now.
    pub async fn flush(&self) -> Result<(), ReplicationError> {
        let mut inner = self.inner.lock().await;
        check_flush_error(&inner)?;
        flush_locked(&self.shared, &mut inner).await
    }
}

fn check_flush_error(inner: &Inner) -> Result<(), ReplicationError> {
    match &inner.flush_error {
        Some(message) => Err(ReplicationError::FlushFailed {
            message: message.clone(),
        }),
        None => Ok(()),
    }
}

fn classify_replication_error(error: &ReplicationError) -> ErrorClass {
    let invalid_op = matches!(
        error,
        ReplicationError::Warehouse { source } if source.is_invalid_operation()
    );
    if invalid_op || error.is_fatal() {
        ErrorClass::Fatal
    } else {
        ErrorClass::Transient
    }
}

fn classify_warehouse_error(error: &WarehouseError) -> ErrorClass {
    if error.is_invalid_operation() {
        ErrorClass::Fatal
    } else {
        ErrorClass::Transient
    }
}

fn map_retry_result<T>(
    result: Result<T, RetryError<ReplicationError>>,
    operation: impl Fn() -> String,
) -> Result<T, ReplicationError> {
    match result {
        Ok(value) => Ok(value),
        Err(RetryError::Aborted { source }) => match source {
            ReplicationError::Warehouse { source } if source.is_invalid_operation() => {
                Err(ReplicationError::InvalidOperation {
                    operation: operation(),
                    source,
                })
            }
            other => Err(other),
        },
        Err(RetryError::Exhausted { source, .. }) => match source {
            ReplicationError::Warehouse { source } => Err(ReplicationError::RetriesExhausted {
                message: format!("Exhausted retries trying to {}", operation()),
                source,
            }),
            other => Err(other),
        },
        Err(RetryError::Cancelled) => Err(ReplicationError::Cancelled),
    }
}

/// Read the highest merged sequence number from the target table.
async fn seed_latest_merged(shared: &Shared, table: &TableId) -> Result<i64, ReplicationError> {
    let policy = shared.settings.base_policy();
    let result = run_with_retries(
        &policy,
        &shared.shutdown,
        classify_warehouse_error,
        |attempt, e: &WarehouseError| {
            error!(table = %table, attempt, error = %e, "Failed to read maximum sequence number");
        },
        |_| shared.warehouse.max_sequence_number(table),
    )
    .await;
    map_retry_result(
        result.map_err(|e| match e {
            RetryError::Aborted { source } => RetryError::Aborted {
                source: ReplicationError::Warehouse { source },
            },
            RetryError::Exhausted { attempts, source } => RetryError::Exhausted {
                attempts,
                source: ReplicationError::Warehouse { source },
            },
            RetryError::Cancelled => RetryError::Cancelled,
        }),
        || format!("read the maximum sequence number for {table}"),
    )
}

/// Flush every open shard and apply the resulting blobs.
async fn flush_locked(shared: &Shared, inner: &mut Inner) -> Result<(), ReplicationError> {
    let started = Instant::now();
    let flushed = inner.writer.flush(&shared.shutdown).await?;
    let table_count = flushed.snapshot.len() + flushed.streaming.len();

    let snapshot_work = prepare_work(shared, inner, flushed.snapshot).await?;
    let streaming_work = prepare_work(shared, inner, flushed.streaming).await?;

    process_in_parallel(shared, snapshot_work).await?;
    let merged_tables = process_in_parallel(shared, streaming_work).await?;

    // Sort-key upgrades performed during the merges are now visible in
    // the target; persist the flag so later merges skip the check.
    for table in merged_tables {
        inner
            .cache
            .mark_sort_key_added(shared.context.as_ref(), &table)
            .await?;
    }

    let latest_seen = inner.latest_seen.clone();
    inner.latest_merged.clear();
    inner.latest_merged.extend(latest_seen);

    commit_offset(shared, inner).await?;

    emit!(FlushCompleted {
        tables: table_count,
        duration: started.elapsed(),
    });
    Ok(())
}

/// Resolve the per-table inputs each blob's load/merge task needs.
async fn prepare_work(
    shared: &Shared,
    inner: &mut Inner,
    blobs: Vec<TableBlob>,
) -> Result<Vec<TableWork>, ReplicationError> {
    let mut work = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let primary_keys = inner
            .cache
            .primary_keys(shared.context.as_ref(), &blob.table)
            .await?;
        let sort_entry = inner
            .cache
            .sort_keys(shared.context.as_ref(), &blob.table)
            .await?;
        let latest_merged = inner.latest_merged.get(&blob.table).copied().unwrap_or(0);
        work.push(TableWork {
            blob,
            primary_keys,
            latest_merged,
            sort_entry,
        });
    }
    Ok(work)
}

/// Run one group of table tasks on the bounded pool: concurrent across
/// tables, sequential (oldest batch first) within a table. Returns the
/// tables whose streaming batches merged with sort keys present.
async fn process_in_parallel(
    shared: &Shared,
    work: Vec<TableWork>,
) -> Result<Vec<TableId>, ReplicationError> {
    if work.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_table: IndexMap<TableId, Vec<TableWork>> = IndexMap::new();
    for item in work {
        by_table
            .entry(item.blob.table.clone())
            .or_default()
            .push(item);
    }

    let semaphore = Arc::new(Semaphore::new(shared.settings.max_parallel_tables));
    let task_shared = shared_handle(shared);
    let mut tasks: JoinSet<Result<Vec<TableId>, ReplicationError>> = JoinSet::new();

    for (_, mut items) in by_table {
        items.sort_by_key(|item| item.blob.batch_id);
        let semaphore = semaphore.clone();
        let shared = task_shared.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.expect("pool semaphore");
            let mut merged = Vec::new();
            for item in items {
                if let Some(table) = process_table_work(&shared, item).await? {
                    merged.push(table);
                }
            }
            Ok(merged)
        });
    }

    let mut merged = Vec::new();
    let mut first_error: Option<ReplicationError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(tables)) => merged.extend(tables),
            Ok(Err(e)) => {
                error!(error = %e, "Table batch failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(source) => {
                if first_error.is_none() {
                    first_error = Some(ReplicationError::TaskJoin { source });
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(merged),
    }
}

// The per-table tasks only need the shared half of the consumer; the
// lock over `Inner` stays with the caller.
fn shared_handle(shared: &Shared) -> Arc<SharedTask> {
    Arc::new(SharedTask {
        warehouse: shared.warehouse.clone(),
        context: shared.context.clone(),
        storage: shared.storage.clone(),
        settings: shared.settings.clone(),
        source: shared.source,
        shutdown: shared.shutdown.clone(),
    })
}

struct SharedTask {
    warehouse: Arc<dyn Warehouse>,
    context: Arc<dyn TargetContext>,
    storage: StorageProviderRef,
    settings: ConsumerSettings,
    source: SourceProperties,
    shutdown: CancellationToken,
}

/// Load (and for streaming batches, merge) one blob.
async fn process_table_work(
    shared: &SharedTask,
    work: TableWork,
) -> Result<Option<TableId>, ReplicationError> {
    let blob = &work.blob;
    let table = &blob.table;
    let marker_key = direct_load_key(&table.dataset, &table.table);

    match blob.blob_type {
        BlobType::Snapshot => {
            shared
                .context
                .put_state(&marker_key, encode_bool(true))
                .await?;
            direct_load(shared, &work).await?;
            Ok(None)
        }
        BlobType::Streaming => {
            shared
                .context
                .put_state(&marker_key, encode_bool(false))
                .await?;
            let sorted = merge_table_changes(shared, &work).await?;
            Ok(sorted)
        }
    }
}

/// Bulk load a snapshot batch straight into the target table.
async fn direct_load(shared: &SharedTask, work: &TableWork) -> Result<(), ReplicationError> {
    let blob = &work.blob;
    let uri = shared.storage.uri_for(&blob.path);
    let policy = shared.settings.job_policy();

    let result = run_with_retries(
        &policy,
        &shared.shutdown,
        classify_warehouse_error,
        |attempt, e: &WarehouseError| {
            error!(
                table = %blob.table,
                attempt,
                error = %e,
                "Failed to load a batch of changes into the target table"
            );
            shared
                .context
                .set_table_error(&blob.table.dataset, &blob.table.table, &e.to_string());
        },
        |attempt| {
            crate::load::load_blob(
                shared.warehouse.as_ref(),
                &shared.settings.application_name,
                blob,
                &blob.table,
                JobKind::LoadTarget,
                &uri,
                &work.primary_keys,
                shared.settings.max_clustering_columns,
                attempt,
            )
        },
    )
    .await;
    map_warehouse_retry(result, || {
        format!(
            "load a batch of changes into target table {}",
            blob.table
        )
    })?;

    delete_blob_best_effort(shared, blob).await;
    Ok(())
}

/// Load a streaming batch to staging and merge it into the target.
/// Returns the table when its batch merged with sort keys present.
async fn merge_table_changes(
    shared: &SharedTask,
    work: &TableWork,
) -> Result<Option<TableId>, ReplicationError> {
    let blob = &work.blob;
    let staging_table = TableId::new(
        blob.table.dataset.clone(),
        crate::names::normalize_table_name(&format!(
            "{}{}",
            shared.settings.staging_table_prefix, blob.table.table
        )),
    );
    let uri = shared.storage.uri_for(&blob.path);
    let policy = shared.settings.job_policy();

    let load_result = run_with_retries(
        &policy,
        &shared.shutdown,
        classify_warehouse_error,
        |attempt, e: &WarehouseError| {
            error!(
                table = %blob.table,
                attempt,
                error = %e,
                "Failed to load a batch of changes into the staging table"
            );
            shared
                .context
                .set_table_error(&blob.table.dataset, &blob.table.table, &e.to_string());
        },
        |attempt| {
            crate::load::load_blob(
                shared.warehouse.as_ref(),
                &shared.settings.application_name,
                blob,
                &staging_table,
                JobKind::LoadStaging,
                &uri,
                &work.primary_keys,
                shared.settings.max_clustering_columns,
                attempt,
            )
        },
    )
    .await;
    map_warehouse_retry(load_result, || {
        format!("load a batch of changes into staging table {staging_table}")
    })?;

    let sort_types = work.sort_entry.as_ref().map(|e| e.types.clone());
    let sort_added = work.sort_entry.as_ref().is_some_and(|e| e.added_to_target);
    let mode: DeleteMode = delete_mode(shared.settings.soft_deletes, shared.source.ordering);

    let merge_result = run_with_retries(
        &policy,
        &shared.shutdown,
        classify_warehouse_error,
        |attempt, e: &WarehouseError| {
            error!(
                table = %blob.table,
                attempt,
                error = %e,
                "Failed to merge a batch of changes into the target table"
            );
            shared
                .context
                .set_table_error(&blob.table.dataset, &blob.table.table, &e.to_string());
        },
        |attempt| {
            run_merge(
                shared.warehouse.as_ref(),
                &shared.settings.application_name,
                blob,
                &staging_table,
                &work.primary_keys,
                work.latest_merged,
                shared.source.row_id_supported,
                shared.source.ordering,
                mode,
                sort_types.as_deref(),
                sort_added,
                attempt,
            )
        },
    )
    .await;
    map_warehouse_retry(merge_result, || {
        format!(
            "merge changes into target table {}. Check that the service account \
             has the right permissions and the table was not modified",
            blob.table
        )
    })?;

    delete_blob_best_effort(shared, blob).await;

    // Staging table cleanup is best-effort; a leftover table does not
    // affect the next batch.
    if !shared.settings.retain_staging_table {
        if let Err(e) = shared.warehouse.delete_table(&staging_table).await {
            warn!(table = %staging_table, error = %e, "Failed to delete staging table");
        }
    }

    let merged_with_sort_keys = sort_types.is_some() && !sort_added;
    Ok(merged_with_sort_keys.then(|| blob.table.clone()))
}

async fn delete_blob_best_effort(shared: &SharedTask, blob: &TableBlob) {
    if let Err(e) = shared.storage.delete(&blob.path).await {
        warn!(
            path = %blob.path,
            error = %e,
            "Failed to delete batch object; it will need to be deleted manually"
        );
    }
}

fn map_warehouse_retry<T>(
    result: Result<T, RetryError<WarehouseError>>,
    operation: impl Fn() -> String,
) -> Result<T, ReplicationError> {
    match result {
        Ok(value) => Ok(value),
        Err(RetryError::Aborted { source }) => Err(ReplicationError::InvalidOperation {
            operation: operation(),
            source,
        }),
        Err(RetryError::Exhausted { source, .. }) => Err(ReplicationError::RetriesExhausted {
            message: format!("Exhausted retries while attempting to {}", operation()),
            source,
        }),
        Err(RetryError::Cancelled) => Err(ReplicationError::Cancelled),
    }
}

/// Commit the offset of the last applied event. Changes are blocked until
/// the commit succeeds; the policy retries for a long time and failure is
/// fatal.
async fn commit_offset(shared: &Shared, inner: &mut Inner) -> Result<(), ReplicationError> {
    let Some(offset) = inner.latest_offset.clone() else {
        return Ok(());
    };
    let sequence = inner.latest_sequence;
    let policy = shared.settings.commit_policy();
    let log_every = Duration::from_secs(60);
    let mut last_logged: Option<Instant> = None;

    let result = run_with_retries(
        &policy,
        &shared.shutdown,
        |_| ErrorClass::Transient,
        |_, e| {
            let due = last_logged.is_none_or(|t| t.elapsed() >= log_every);
            if due {
                warn!(
                    error = %e,
                    "Error committing offset. Changes will be blocked until this succeeds."
                );
                last_logged = Some(Instant::now());
            }
        },
        |_| shared.context.commit_offset(&offset, sequence),
    )
    .await;

    match result {
        Ok(()) => {
            emit!(OffsetCommitted {
                sequence_number: sequence,
            });
            debug!(sequence_number = sequence, "Committed offset");
            Ok(())
        }
        Err(RetryError::Cancelled) => Err(ReplicationError::Cancelled),
        Err(e) => Err(ReplicationError::CommitOffset {
            message: e.to_string(),
        }),
    }
}

/// Normalize column names in a DML event's images.
fn normalize_dml(mut event: DmlEvent) -> DmlEvent {
    event.after = normalize_row(std::mem::take(&mut event.after));
    event.before = event.before.take().map(normalize_row);
    event
}

fn normalize_row(row: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    row.into_iter()
        .map(|(name, value)| (normalize_field_name(&name), value))
        .collect()
}

/// Derive a column schema from row values when no DDL has been seen for
/// the table (e.g. resuming mid-stream after a restart).
fn infer_schema(after: &BTreeMap<String, Value>) -> TableSchema {
    let fields = after
        .iter()
        .map(|(name, value)| {
            let column_type = match value {
                Value::Bool(_) => ColumnType::Bool,
                Value::Number(n) if n.is_i64() => ColumnType::Int64,
                Value::Number(_) => ColumnType::Float64,
                _ => ColumnType::String,
            };
            ColumnSchema::nullable(name.clone(), column_type)
        })
        .collect();
    TableSchema::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_schema_from_row_values() {
        let after = BTreeMap::from([
            ("id".to_string(), json!(7)),
            ("score".to_string(), json!(1.5)),
            ("active".to_string(), json!(true)),
            ("name".to_string(), json!("a")),
            ("extra".to_string(), Value::Null),
        ]);
        let schema = infer_schema(&after);

        assert_eq!(schema.field("id").unwrap().column_type, ColumnType::Int64);
        assert_eq!(
            schema.field("score").unwrap().column_type,
            ColumnType::Float64
        );
        assert_eq!(
            schema.field("active").unwrap().column_type,
            ColumnType::Bool
        );
        assert_eq!(
            schema.field("name").unwrap().column_type,
            ColumnType::String
        );
        assert_eq!(
            schema.field("extra").unwrap().column_type,
            ColumnType::String
        );
    }

    #[test]
    fn test_normalize_row_keys() {
        let row = BTreeMap::from([("user-id".to_string(), json!(1))]);
        let normalized = normalize_row(row);
        assert!(normalized.contains_key("user_id"));
    }

    #[test]
    fn test_job_policy_respects_disabled_retries() {
        let mut config = Config::parse("application_name: app\n").unwrap();
        config.max_retry_seconds = 0;
        let settings = ConsumerSettings::from_config(&config);
        assert_eq!(settings.job_policy().max_attempts, 1);
        assert_eq!(settings.base_policy().max_attempts, 1);
    }

    #[test]
    fn test_job_policy_base_delay_bounded() {
        let config = Config::parse("application_name: app\n").unwrap();
        let settings = ConsumerSettings::from_config(&config);
        let policy = settings.job_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(90));
        assert_eq!(policy.max_duration, Duration::from_secs(300));
    }
}
