//! Host context boundary.
//!
//! The pipeline runs embedded in a host that owns offset tracking, state
//! storage, and operator-facing table status. [`TargetContext`] is the
//! narrow contract against that host. [`FileContext`] is a self-contained
//! implementation backed by a local state file, used by the `floe` binary
//! when replaying an event journal; tests use [`MemoryContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

use crate::event::{Offset, SourceProperties};

/// Errors from host context operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ContextError {
    #[snafu(display("Failed to read state: {source}"))]
    ReadState { source: std::io::Error },

    #[snafu(display("Failed to write state: {source}"))]
    WriteState { source: std::io::Error },

    #[snafu(display("Failed to encode state: {source}"))]
    EncodeState { source: serde_json::Error },

    #[snafu(display("Failed to decode state file: {source}"))]
    DecodeState { source: serde_json::Error },
}

/// Contract against the embedding host.
#[async_trait]
pub trait TargetContext: Send + Sync {
    /// Atomically record the offset and sequence number of the last fully
    /// applied flush.
    async fn commit_offset(&self, offset: &Offset, sequence_number: i64)
        -> Result<(), ContextError>;

    /// Seed the host's sequence counter before replication starts.
    async fn initialize_sequence_number(&self, sequence_number: i64) -> Result<(), ContextError>;

    /// Count an applied operation, keyed by its kind.
    fn increment_count(&self, operation: &str);

    fn set_table_snapshotting(&self, database: &str, table: &str);
    fn set_table_replicating(&self, database: &str, table: &str);
    fn set_table_error(&self, database: &str, table: &str, message: &str);

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContextError>;
    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), ContextError>;

    /// All (database, table) pairs selected for replication.
    fn all_tables(&self) -> Vec<(String, String)>;

    fn source_properties(&self) -> SourceProperties;

    /// Total retry budget for load and merge operations, in seconds.
    /// Values below 1 disable retries.
    fn max_retry_seconds(&self) -> u64;

    fn application_name(&self) -> &str;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    offset: Option<Offset>,
    #[serde(default)]
    sequence_number: i64,
    /// Key-value state, values base64-free: stored as JSON strings of raw
    /// bytes interpreted as UTF-8 where possible, else as byte arrays.
    #[serde(default)]
    state: BTreeMap<String, Vec<u8>>,
}

/// Host context backed by a single local JSON state file.
pub struct FileContext {
    path: PathBuf,
    inner: Mutex<PersistedState>,
    application_name: String,
    source_properties: SourceProperties,
    max_retry_seconds: u64,
    tables: Vec<(String, String)>,
}

impl FileContext {
    /// Open or create the state file at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        application_name: impl Into<String>,
        source_properties: SourceProperties,
        max_retry_seconds: u64,
        tables: Vec<(String, String)>,
    ) -> Result<Self, ContextError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context(DecodeStateSnafu)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(source) => return Err(ContextError::ReadState { source }),
        };
        if let Some(offset) = &state.offset {
            info!(sequence_number = state.sequence_number, ?offset, "Resuming from committed offset");
        }
        Ok(Self {
            path,
            inner: Mutex::new(state),
            application_name: application_name.into(),
            source_properties,
            max_retry_seconds,
            tables,
        })
    }

    /// The committed offset, if any.
    pub fn committed_offset(&self) -> Option<(Offset, i64)> {
        let inner = self.inner.lock().expect("state lock");
        inner.offset.clone().map(|o| (o, inner.sequence_number))
    }

    fn persist(&self, state: &PersistedState) -> Result<(), ContextError> {
        let bytes = serde_json::to_vec_pretty(state).context(EncodeStateSnafu)?;
        // Write through a temp file so a crash never leaves a torn state file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).context(WriteStateSnafu)?;
        std::fs::rename(&tmp, &self.path).context(WriteStateSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl TargetContext for FileContext {
    async fn commit_offset(
        &self,
        offset: &Offset,
        sequence_number: i64,
    ) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.offset = Some(offset.clone());
        inner.sequence_number = sequence_number;
        self.persist(&inner)
    }

    async fn initialize_sequence_number(&self, sequence_number: i64) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.sequence_number = inner.sequence_number.max(sequence_number);
        self.persist(&inner)
    }

    fn increment_count(&self, operation: &str) {
        metrics::counter!("floe_events_applied_total", "operation" => operation.to_string())
            .increment(1);
    }

    fn set_table_snapshotting(&self, database: &str, table: &str) {
        metrics::gauge!(
            "floe_table_snapshotting",
            "database" => database.to_string(),
            "table" => table.to_string()
        )
        .set(1.0);
    }

    fn set_table_replicating(&self, database: &str, table: &str) {
        metrics::gauge!(
            "floe_table_snapshotting",
            "database" => database.to_string(),
            "table" => table.to_string()
        )
        .set(0.0);
    }

    fn set_table_error(&self, database: &str, table: &str, message: &str) {
        tracing::warn!(database, table, message, "Table entered error state");
        metrics::counter!(
            "floe_table_errors_total",
            "database" => database.to_string(),
            "table" => table.to_string()
        )
        .increment(1);
    }

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContextError> {
        let inner = self.inner.lock().expect("state lock");
        Ok(inner.state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.state.insert(key.to_string(), value);
        self.persist(&inner)
    }

    fn all_tables(&self) -> Vec<(String, String)> {
        self.tables.clone()
    }

    fn source_properties(&self) -> SourceProperties {
        self.source_properties
    }

    fn max_retry_seconds(&self) -> u64 {
        self.max_retry_seconds
    }

    fn application_name(&self) -> &str {
        &self.application_name
    }
}

/// In-memory context for tests.
#[derive(Default)]
pub struct MemoryContext {
    inner: Mutex<PersistedState>,
    pub source_properties: SourceProperties,
    pub max_retry_seconds: u64,
    pub application_name: String,
    pub tables: Vec<(String, String)>,
}

impl MemoryContext {
    pub fn new(application_name: impl Into<String>, source_properties: SourceProperties) -> Self {
        Self {
            inner: Mutex::default(),
            source_properties,
            max_retry_seconds: 300,
            application_name: application_name.into(),
            tables: Vec::new(),
        }
    }

    pub fn committed(&self) -> Option<(Offset, i64)> {
        let inner = self.inner.lock().expect("state lock");
        inner.offset.clone().map(|o| (o, inner.sequence_number))
    }
}

#[async_trait]
impl TargetContext for MemoryContext {
    async fn commit_offset(
        &self,
        offset: &Offset,
        sequence_number: i64,
    ) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.offset = Some(offset.clone());
        inner.sequence_number = sequence_number;
        Ok(())
    }

    async fn initialize_sequence_number(&self, sequence_number: i64) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.sequence_number = inner.sequence_number.max(sequence_number);
        Ok(())
    }

    fn increment_count(&self, _operation: &str) {}

    fn set_table_snapshotting(&self, _database: &str, _table: &str) {}
    fn set_table_replicating(&self, _database: &str, _table: &str) {}
    fn set_table_error(&self, _database: &str, _table: &str, _message: &str) {}

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContextError> {
        let inner = self.inner.lock().expect("state lock");
        Ok(inner.state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), ContextError> {
        let mut inner = self.inner.lock().expect("state lock");
        inner.state.insert(key.to_string(), value);
        Ok(())
    }

    fn all_tables(&self) -> Vec<(String, String)> {
        self.tables.clone()
    }

    fn source_properties(&self) -> SourceProperties {
        self.source_properties
    }

    fn max_retry_seconds(&self) -> u64 {
        self.max_retry_seconds
    }

    fn application_name(&self) -> &str {
        &self.application_name
    }
}
