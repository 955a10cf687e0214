//! Test harness: a mock warehouse and host context that record every
//! operation into one shared, ordered log so tests can assert sequencing
//! across the warehouse and offset-commit boundaries.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use floe::context::{ContextError, TargetContext};
use floe::event::{DmlKind, DmlEvent, Offset, SourceProperties};
use floe::schema::{ColumnSchema, TableSchema};
use floe::warehouse::{
    JobOutcome, JobSnapshot, LoadFormat, TableDef, TableId, Warehouse, WarehouseError,
};

/// Ordered log of operations across the warehouse and context.
pub type OpLog = Arc<Mutex<Vec<String>>>;

pub fn op_log() -> OpLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn log_index(log: &OpLog, needle: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|op| op.contains(needle))
}

#[derive(Default)]
struct MockState {
    datasets: HashMap<String, Option<String>>,
    tables: HashMap<TableId, TableDef>,
    jobs: HashMap<String, JobSnapshot>,
    queries: Vec<(String, String)>,
    max_sequence: HashMap<TableId, i64>,
}

/// Failure injection switches.
#[derive(Default)]
pub struct Failures {
    /// `create_dataset` fails with 409.
    pub dataset_conflict: bool,
    /// `submit_query_job` fails as an invalid operation.
    pub merge_invalid: bool,
}

pub struct MockWarehouse {
    state: Mutex<MockState>,
    pub failures: Mutex<Failures>,
    log: OpLog,
}

impl MockWarehouse {
    pub fn new(log: OpLog) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            failures: Mutex::new(Failures::default()),
            log,
        }
    }

    fn record(&self, op: String) {
        self.log.lock().unwrap().push(op);
    }

    pub fn seed_max_sequence(&self, table: &TableId, sequence: i64) {
        self.state
            .lock()
            .unwrap()
            .max_sequence
            .insert(table.clone(), sequence);
    }

    pub fn insert_dataset(&self, dataset: &str) {
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(dataset.to_string(), None);
    }

    pub fn table_def(&self, table: &TableId) -> Option<TableDef> {
        self.state.lock().unwrap().tables.get(table).cloned()
    }

    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().unwrap().datasets.keys().cloned().collect();
        names.sort();
        names
    }

    /// All SQL submitted through query jobs, in submission order.
    pub fn queries(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().unwrap().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().unwrap().datasets.contains_key(dataset))
    }

    async fn create_dataset(
        &self,
        dataset: &str,
        location: Option<&str>,
    ) -> Result<(), WarehouseError> {
        if self.failures.lock().unwrap().dataset_conflict {
            return Err(WarehouseError::Status {
                code: 409,
                reason: Some("duplicate".to_string()),
                message: format!("dataset {dataset} already exists"),
            });
        }
        self.record(format!("create_dataset {dataset}"));
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(dataset.to_string(), location.map(String::from));
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.record(format!("delete_dataset {dataset}"));
        self.state.lock().unwrap().datasets.remove(dataset);
        Ok(())
    }

    async fn get_table(&self, table: &TableId) -> Result<Option<TableDef>, WarehouseError> {
        Ok(self.state.lock().unwrap().tables.get(table).cloned())
    }

    async fn create_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError> {
        self.record(format!("create_table {table}"));
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table.clone(), def.clone());
        Ok(())
    }

    async fn update_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError> {
        self.record(format!("update_table {table}"));
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table.clone(), def.clone());
        Ok(())
    }

    async fn delete_table(&self, table: &TableId) -> Result<(), WarehouseError> {
        self.record(format!("delete_table {table}"));
        self.state.lock().unwrap().tables.remove(table);
        Ok(())
    }

    async fn ensure_column(
        &self,
        table: &TableId,
        column: &ColumnSchema,
    ) -> Result<(), WarehouseError> {
        self.record(format!("ensure_column {table} {}", column.name));
        let mut state = self.state.lock().unwrap();
        if let Some(def) = state.tables.get_mut(table) {
            if def.schema.field(&column.name).is_none() {
                def.schema.fields.push(column.clone());
            }
        }
        Ok(())
    }

    async fn submit_load_job(
        &self,
        job_id: &str,
        table: &TableId,
        source_uri: &str,
        _schema: &TableSchema,
        _format: LoadFormat,
    ) -> Result<(), WarehouseError> {
        self.record(format!("load {job_id} -> {table} from {source_uri}"));
        self.state.lock().unwrap().jobs.insert(
            job_id.to_string(),
            JobSnapshot {
                job_id: job_id.to_string(),
                done: true,
                error: None,
            },
        );
        Ok(())
    }

    async fn submit_query_job(&self, job_id: &str, sql: &str) -> Result<(), WarehouseError> {
        if self.failures.lock().unwrap().merge_invalid {
            return Err(WarehouseError::Status {
                code: 400,
                reason: Some("invalid".to_string()),
                message: "query references a missing column".to_string(),
            });
        }
        self.record(format!("query {job_id}"));
        let mut state = self.state.lock().unwrap();
        state.queries.push((job_id.to_string(), sql.to_string()));
        state.jobs.insert(
            job_id.to_string(),
            JobSnapshot {
                job_id: job_id.to_string(),
                done: true,
                error: None,
            },
        );
        Ok(())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<JobSnapshot>, WarehouseError> {
        Ok(self.state.lock().unwrap().jobs.get(job_id).cloned())
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<JobOutcome, WarehouseError> {
        let state = self.state.lock().unwrap();
        match state.jobs.get(job_id) {
            Some(snapshot) => Ok(JobOutcome {
                job_id: job_id.to_string(),
                error: snapshot.error.clone(),
            }),
            None => Err(WarehouseError::JobVanished {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn max_sequence_number(&self, table: &TableId) -> Result<i64, WarehouseError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .max_sequence
            .get(table)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
struct ContextState {
    offset: Option<(Offset, i64)>,
    state: BTreeMap<String, Vec<u8>>,
}

/// Host context that records offset commits into the shared op log.
pub struct TestContext {
    inner: Mutex<ContextState>,
    log: OpLog,
    pub source_properties: SourceProperties,
    pub max_retry_seconds: u64,
}

impl TestContext {
    pub fn new(log: OpLog, source_properties: SourceProperties) -> Self {
        Self {
            inner: Mutex::new(ContextState::default()),
            log,
            source_properties,
            max_retry_seconds: 300,
        }
    }

    pub fn committed(&self) -> Option<(Offset, i64)> {
        self.inner.lock().unwrap().offset.clone()
    }

    pub fn state_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().state.get(key).cloned()
    }
}

#[async_trait]
impl TargetContext for TestContext {
    async fn commit_offset(
        &self,
        offset: &Offset,
        sequence_number: i64,
    ) -> Result<(), ContextError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("commit_offset {sequence_number}"));
        self.inner.lock().unwrap().offset = Some((offset.clone(), sequence_number));
        Ok(())
    }

    async fn initialize_sequence_number(&self, _sequence_number: i64) -> Result<(), ContextError> {
        Ok(())
    }

    fn increment_count(&self, _operation: &str) {}
    fn set_table_snapshotting(&self, _database: &str, _table: &str) {}
    fn set_table_replicating(&self, _database: &str, _table: &str) {}
    fn set_table_error(&self, _database: &str, _table: &str, _message: &str) {}

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ContextError> {
        Ok(self.inner.lock().unwrap().state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), ContextError> {
        self.inner.lock().unwrap().state.insert(key.to_string(), value);
        Ok(())
    }

    fn all_tables(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn source_properties(&self) -> SourceProperties {
        self.source_properties
    }

    fn max_retry_seconds(&self) -> u64 {
        self.max_retry_seconds
    }

    fn application_name(&self) -> &str {
        "replicator"
    }
}

/// Build a DML event with an `(id, name)` row.
pub fn dml(
    kind: DmlKind,
    table: &str,
    seq: i64,
    before_id: Option<i64>,
    id: i64,
    name: &str,
) -> DmlEvent {
    DmlEvent {
        kind,
        database: "appdb".to_string(),
        schema_name: None,
        table: table.to_string(),
        before: before_id
            .map(|v| BTreeMap::from([("id".to_string(), serde_json::json!(v))])),
        after: BTreeMap::from([
            ("id".to_string(), serde_json::json!(id)),
            ("name".to_string(), serde_json::json!(name)),
        ]),
        row_id: None,
        source_timestamp: None,
        sort_keys: None,
        offset: Offset(BTreeMap::from([(
            "pos".to_string(),
            seq.to_string(),
        )])),
        sequence_number: seq,
        snapshot: false,
    }
}
