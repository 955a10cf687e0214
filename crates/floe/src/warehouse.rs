//! Warehouse access.
//!
//! The [`Warehouse`] trait is the seam between the pipeline and BigQuery:
//! dataset and table metadata operations, load and query jobs with
//! caller-supplied deterministic job ids, and the sequence-number queries
//! that seed replay tracking. [`BigQueryWarehouse`] implements it over the
//! `gcp-bigquery-client` REST API; tests substitute a mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::clustering::Clustering;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::encryption_configuration::EncryptionConfiguration;
use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::job::Job;
use gcp_bigquery_client::model::job_configuration::JobConfiguration;
use gcp_bigquery_client::model::job_configuration_load::JobConfigurationLoad;
use gcp_bigquery_client::model::job_configuration_query::JobConfigurationQuery;
use gcp_bigquery_client::model::job_reference::JobReference;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::model::table::Table;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_reference::TableReference;
use gcp_bigquery_client::Client;

use crate::schema::{to_bigquery_schema, ColumnSchema, ColumnType, TableSchema};

/// HTTP status returned when a dataset or bucket already exists.
pub const CONFLICT: i32 = 409;
const NOT_FOUND: i32 = 404;

const RATE_LIMIT_EXCEEDED_REASON: &str = "rateLimitExceeded";
const RATE_LIMIT_EXCEEDED_CODES: [i32; 2] = [400, 403];
const BILLING_TIER_LIMIT_EXCEEDED_CODE: i32 = 400;
const BILLING_TIER_LIMIT_EXCEEDED_REASON: &str = "billingTierLimitExceeded";
/// Reasons the API itself marks as transient.
const RETRYABLE_REASONS: [&str; 4] = [
    "backendError",
    "internalError",
    "jobBackendError",
    "jobInternalError",
];
/// Reasons that mark a request as semantically invalid; retrying the same
/// request cannot succeed.
const INVALID_OPERATION_REASONS: [&str; 3] = ["invalid", "invalidQuery", "notImplemented"];

/// How long to wait between job status polls.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Identifier of a warehouse table within the configured project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// A table definition: column schema plus clustering columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub schema: TableSchema,
    pub clustering: Vec<String>,
}

/// The kind of warehouse job, used in deterministic job ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Load a batch object into the staging table.
    LoadStaging,
    /// Load a snapshot batch object directly into the target table.
    LoadTarget,
    /// Merge a staged batch into the target table.
    Merge,
}

impl JobKind {
    pub fn id(&self) -> &'static str {
        match self {
            JobKind::LoadStaging => "stage",
            JobKind::LoadTarget => "target",
            JobKind::Merge => "merge",
        }
    }
}

/// Deterministic job id for a batch attempt. Batch ids are first-event
/// timestamps, so the id is unique per (table, batch); the attempt suffix
/// is what makes retried submissions observable.
pub fn job_id(app: &str, kind: JobKind, table: &TableId, batch_id: i64, attempt: u32) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}",
        app,
        kind.id(),
        table.dataset,
        table.table,
        batch_id,
        attempt
    )
}

/// File format of a batch object handed to a load job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadFormat {
    Avro,
    Json,
}

/// Terminal outcome of a warehouse job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Status snapshot of a previously submitted job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job_id: String,
    pub done: bool,
    pub error: Option<String>,
}

/// Errors from warehouse operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// BigQuery API call failed.
    #[snafu(display("BigQuery API error: {source}"))]
    Api { source: BQError },

    /// A submitted job reached a terminal state with an error.
    #[snafu(display("Job '{job_id}' failed: {message}"))]
    JobFailed { job_id: String, message: String },

    /// A job we just submitted can no longer be found.
    #[snafu(display("Job '{job_id}' no longer exists"))]
    JobVanished { job_id: String },

    /// A query returned something other than the expected shape.
    #[snafu(display("Unexpected query result: {message}"))]
    QueryResult { message: String },

    /// An API error reduced to its HTTP status code and reason. Produced
    /// by warehouse implementations that do not carry a client error.
    #[snafu(display("{message} (code {code})"))]
    Status {
        code: i32,
        reason: Option<String>,
        message: String,
    },
}

impl WarehouseError {
    fn code_and_reason(&self) -> (Option<i32>, Option<String>) {
        match self {
            WarehouseError::Api {
                source: BQError::ResponseError { error },
            } => {
                let code = error.error.code as i32;
                let reason = error
                    .error
                    .errors
                    .first()
                    .and_then(|e| e.get("reason").cloned());
                (Some(code), reason)
            }
            WarehouseError::Status { code, reason, .. } => (Some(*code), reason.clone()),
            _ => (None, None),
        }
    }

    /// The object already exists; idempotent creations swallow this.
    pub fn is_conflict(&self) -> bool {
        matches!(self.code_and_reason().0, Some(CONFLICT))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.code_and_reason().0, Some(NOT_FOUND))
    }

    /// Semantically invalid request; retries abort and the pipeline fails.
    pub fn is_invalid_operation(&self) -> bool {
        let (_, reason) = self.code_and_reason();
        reason.is_some_and(|r| INVALID_OPERATION_REASONS.contains(&r.as_str()))
    }

    /// Transient failure worth retrying: server-side errors, the standard
    /// retriable reasons, rate limiting, and billing tier exhaustion.
    pub fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::JobFailed { .. } | WarehouseError::JobVanished { .. } => true,
            WarehouseError::QueryResult { .. } => false,
            WarehouseError::Api {
                source: BQError::ResponseError { .. },
            }
            | WarehouseError::Status { .. } => {
                let (code, reason) = self.code_and_reason();
                let code = code.unwrap_or_default();
                if code >= 500 {
                    return true;
                }
                let Some(reason) = reason else { return false };
                RETRYABLE_REASONS.contains(&reason.as_str())
                    || (RATE_LIMIT_EXCEEDED_CODES.contains(&code)
                        && reason == RATE_LIMIT_EXCEEDED_REASON)
                    || (code == BILLING_TIER_LIMIT_EXCEEDED_CODE
                        && reason == BILLING_TIER_LIMIT_EXCEEDED_REASON)
            }
            // Everything else from the client is transport-level.
            WarehouseError::Api { .. } => true,
        }
    }
}

/// Warehouse operations used by the pipeline.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError>;
    async fn create_dataset(
        &self,
        dataset: &str,
        location: Option<&str>,
    ) -> Result<(), WarehouseError>;
    async fn delete_dataset(&self, dataset: &str) -> Result<(), WarehouseError>;

    async fn get_table(&self, table: &TableId) -> Result<Option<TableDef>, WarehouseError>;
    async fn create_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError>;
    async fn update_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError>;
    async fn delete_table(&self, table: &TableId) -> Result<(), WarehouseError>;

    /// Add a column to an existing table if it is not already present.
    async fn ensure_column(
        &self,
        table: &TableId,
        column: &ColumnSchema,
    ) -> Result<(), WarehouseError>;

    /// Submit a load job from a blob URI. The schema is always named
    /// explicitly and field additions are allowed.
    async fn submit_load_job(
        &self,
        job_id: &str,
        table: &TableId,
        source_uri: &str,
        schema: &TableSchema,
        format: LoadFormat,
    ) -> Result<(), WarehouseError>;

    /// Submit a SQL query job under the given job id.
    async fn submit_query_job(&self, job_id: &str, sql: &str) -> Result<(), WarehouseError>;

    /// Look up a previously submitted job by id.
    async fn find_job(&self, job_id: &str) -> Result<Option<JobSnapshot>, WarehouseError>;

    /// Block until the job reaches a terminal state.
    async fn wait_for_job(&self, job_id: &str) -> Result<JobOutcome, WarehouseError>;

    /// Highest `_sequence_num` in the target table; 0 when the table does
    /// not exist or is empty.
    async fn max_sequence_number(&self, table: &TableId) -> Result<i64, WarehouseError>;
}

/// BigQuery-backed warehouse.
pub struct BigQueryWarehouse {
    client: Client,
    project: String,
    /// Location for datasets and job references, matching the staging
    /// bucket's region.
    location: Option<String>,
    /// Customer-managed encryption key applied to everything we create.
    kms_key: Option<String>,
}

impl BigQueryWarehouse {
    pub fn new(
        client: Client,
        project: impl Into<String>,
        location: Option<String>,
        kms_key: Option<String>,
    ) -> Self {
        Self {
            client,
            project: project.into(),
            location,
            kms_key,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn encryption(&self) -> Option<EncryptionConfiguration> {
        self.kms_key.as_ref().map(|key| EncryptionConfiguration {
            kms_key_name: Some(key.clone()),
        })
    }

    fn job_reference(&self, job_id: &str) -> JobReference {
        JobReference {
            job_id: Some(job_id.to_string()),
            project_id: Some(self.project.clone()),
            location: self.location.clone(),
        }
    }

    fn table_reference(&self, table: &TableId) -> TableReference {
        TableReference::new(&self.project, &table.dataset, &table.table)
    }

    fn build_table(&self, table: &TableId, def: &TableDef) -> Table {
        let mut bq_table = Table::new(
            &self.project,
            &table.dataset,
            &table.table,
            to_bigquery_schema(&def.schema),
        );
        if !def.clustering.is_empty() {
            bq_table.clustering = Some(Clustering {
                fields: Some(def.clustering.clone()),
            });
        }
        bq_table.encryption_configuration = self.encryption();
        bq_table
    }

    /// Run a query synchronously and return the single i64 it produces.
    async fn query_i64(&self, sql: &str) -> Result<Option<i64>, WarehouseError> {
        let response = self
            .client
            .job()
            .query(&self.project, QueryRequest::new(sql))
            .await
            .context(ApiSnafu)?;
        let mut rows = ResultSet::new_from_query_response(response);
        if !rows.next_row() {
            return Ok(None);
        }
        rows.get_i64(0).context(ApiSnafu)
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        match self.client.dataset().get(&self.project, dataset).await {
            Ok(_) => Ok(true),
            Err(source) => {
                let err = WarehouseError::Api { source };
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_dataset(
        &self,
        dataset: &str,
        location: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let mut ds = Dataset::new(&self.project, dataset);
        if let Some(location) = location {
            ds = ds.location(location);
        }
        if let Some(encryption) = self.encryption() {
            ds.default_encryption_configuration = Some(encryption);
        }
        self.client.dataset().create(ds).await.context(ApiSnafu)?;
        debug!(dataset, "Created dataset");
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.client
            .dataset()
            .delete(&self.project, dataset, true)
            .await
            .context(ApiSnafu)
    }

    async fn get_table(&self, table: &TableId) -> Result<Option<TableDef>, WarehouseError> {
        match self
            .client
            .table()
            .get(&self.project, &table.dataset, &table.table, None)
            .await
        {
            Ok(bq_table) => {
                let schema = from_bigquery_schema(bq_table.schema.fields.unwrap_or_default());
                let clustering = bq_table
                    .clustering
                    .and_then(|c| c.fields)
                    .unwrap_or_default();
                Ok(Some(TableDef { schema, clustering }))
            }
            Err(source) => {
                let err = WarehouseError::Api { source };
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError> {
        let bq_table = self.build_table(table, def);
        self.client
            .table()
            .create(bq_table)
            .await
            .context(ApiSnafu)?;
        debug!(table = %table, "Created table");
        Ok(())
    }

    async fn update_table(&self, table: &TableId, def: &TableDef) -> Result<(), WarehouseError> {
        let bq_table = self.build_table(table, def);
        self.client
            .table()
            .update(&self.project, &table.dataset, &table.table, bq_table)
            .await
            .context(ApiSnafu)?;
        Ok(())
    }

    async fn delete_table(&self, table: &TableId) -> Result<(), WarehouseError> {
        self.client
            .table()
            .delete(&self.project, &table.dataset, &table.table)
            .await
            .context(ApiSnafu)
    }

    async fn ensure_column(
        &self,
        table: &TableId,
        column: &ColumnSchema,
    ) -> Result<(), WarehouseError> {
        let Some(mut def) = self.get_table(table).await? else {
            return Ok(());
        };
        if def.schema.field(&column.name).is_some() {
            return Ok(());
        }
        def.schema.fields.push(column.clone());
        self.update_table(table, &def).await
    }

    async fn submit_load_job(
        &self,
        job_id: &str,
        table: &TableId,
        source_uri: &str,
        schema: &TableSchema,
        format: LoadFormat,
    ) -> Result<(), WarehouseError> {
        let load = JobConfigurationLoad {
            source_uris: Some(vec![source_uri.to_string()]),
            destination_table: Some(self.table_reference(table)),
            schema: Some(to_bigquery_schema(schema)),
            source_format: Some(
                match format {
                    LoadFormat::Avro => "AVRO",
                    LoadFormat::Json => "NEWLINE_DELIMITED_JSON",
                }
                .to_string(),
            ),
            use_avro_logical_types: Some(format == LoadFormat::Avro),
            schema_update_options: Some(vec!["ALLOW_FIELD_ADDITION".to_string()]),
            destination_encryption_configuration: self.encryption(),
            ..Default::default()
        };
        let job = Job {
            configuration: Some(JobConfiguration {
                load: Some(load),
                ..Default::default()
            }),
            job_reference: Some(self.job_reference(job_id)),
            ..Default::default()
        };
        self.client
            .job()
            .insert(&self.project, job)
            .await
            .context(ApiSnafu)?;
        Ok(())
    }

    async fn submit_query_job(&self, job_id: &str, sql: &str) -> Result<(), WarehouseError> {
        let query = JobConfigurationQuery {
            query: sql.to_string(),
            use_legacy_sql: Some(false),
            destination_encryption_configuration: self.encryption(),
            ..Default::default()
        };
        let job = Job {
            configuration: Some(JobConfiguration {
                query: Some(query),
                ..Default::default()
            }),
            job_reference: Some(self.job_reference(job_id)),
            ..Default::default()
        };
        self.client
            .job()
            .insert(&self.project, job)
            .await
            .context(ApiSnafu)?;
        Ok(())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<JobSnapshot>, WarehouseError> {
        match self
            .client
            .job()
            .get_job(&self.project, job_id, self.location.as_deref())
            .await
        {
            Ok(job) => Ok(Some(snapshot_of(job_id, &job))),
            Err(source) => {
                let err = WarehouseError::Api { source };
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<JobOutcome, WarehouseError> {
        loop {
            let Some(snapshot) = self.find_job(job_id).await? else {
                return JobVanishedSnafu { job_id }.fail();
            };
            if snapshot.done {
                return Ok(JobOutcome {
                    job_id: job_id.to_string(),
                    error: snapshot.error,
                });
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    async fn max_sequence_number(&self, table: &TableId) -> Result<i64, WarehouseError> {
        if self.get_table(table).await?.is_none() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT MAX({}) FROM `{}.{}.{}`",
            crate::schema::SEQUENCE_NUM,
            self.project,
            table.dataset,
            table.table
        );
        Ok(self.query_i64(&sql).await?.unwrap_or(0))
    }
}

impl BigQueryWarehouse {
    /// Highest `_sequence_num` across the given tables, batched into UNION
    /// ALL queries of at most `chunk_size` tables. Tables that do not
    /// exist yet are skipped.
    pub async fn max_sequence_across(
        &self,
        tables: &[TableId],
        chunk_size: usize,
    ) -> Result<i64, WarehouseError> {
        let mut existing = Vec::new();
        for table in tables {
            if self.get_table(table).await?.is_some() {
                existing.push(table);
            }
        }
        let mut max = 0;
        for chunk in existing.chunks(chunk_size.max(1)) {
            let union = chunk
                .iter()
                .map(|t| {
                    format!(
                        "SELECT MAX({}) AS n FROM `{}.{}.{}`",
                        crate::schema::SEQUENCE_NUM,
                        self.project,
                        t.dataset,
                        t.table
                    )
                })
                .collect::<Vec<_>>()
                .join(" UNION ALL ");
            let sql = format!("SELECT MAX(n) FROM ({union})");
            max = max.max(self.query_i64(&sql).await?.unwrap_or(0));
        }
        Ok(max)
    }
}

fn snapshot_of(job_id: &str, job: &Job) -> JobSnapshot {
    let status = job.status.as_ref();
    let done = status
        .and_then(|s| s.state.as_ref())
        .is_some_and(|state| state == "DONE");
    let error = status
        .and_then(|s| s.error_result.as_ref())
        .map(|e| e.message.clone().unwrap_or_else(|| "unknown error".to_string()));
    JobSnapshot {
        job_id: job_id.to_string(),
        done,
        error,
    }
}

fn from_bigquery_schema(fields: Vec<TableFieldSchema>) -> TableSchema {
    TableSchema::new(fields.into_iter().map(from_bigquery_field).collect())
}

fn from_bigquery_field(field: TableFieldSchema) -> ColumnSchema {
    let column_type = match field.r#type {
        FieldType::Boolean | FieldType::Bool => ColumnType::Bool,
        FieldType::Integer | FieldType::Int64 => ColumnType::Int64,
        FieldType::Float | FieldType::Float64 => ColumnType::Float64,
        FieldType::Numeric | FieldType::Bignumeric => ColumnType::Numeric,
        FieldType::Bytes => ColumnType::Bytes,
        FieldType::Date => ColumnType::Date,
        FieldType::Time => ColumnType::Time,
        FieldType::Datetime => ColumnType::Datetime,
        FieldType::Timestamp => ColumnType::Timestamp,
        FieldType::Record | FieldType::Struct => ColumnType::Struct(
            field
                .fields
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(from_bigquery_field)
                .collect(),
        ),
        _ => ColumnType::String,
    };
    ColumnSchema {
        name: field.name,
        column_type,
        nullable: field.mode.as_deref() != Some("REQUIRED"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_format() {
        let table = TableId::new("appdb", "users");
        assert_eq!(
            job_id("replicator", JobKind::LoadStaging, &table, 1234567890, 0),
            "replicator_stage_appdb_users_1234567890_0"
        );
        assert_eq!(
            job_id("replicator", JobKind::Merge, &table, 1234567890, 3),
            "replicator_merge_appdb_users_1234567890_3"
        );
        assert_eq!(
            job_id("replicator", JobKind::LoadTarget, &table, 42, 1),
            "replicator_target_appdb_users_42_1"
        );
    }

    #[test]
    fn test_table_id_display() {
        assert_eq!(TableId::new("ds", "t").to_string(), "ds.t");
    }

    #[test]
    fn test_job_failure_classification() {
        let err = WarehouseError::JobFailed {
            job_id: "j".to_string(),
            message: "quota".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
        assert!(!err.is_invalid_operation());
    }

    fn status(code: i32, reason: Option<&str>) -> WarehouseError {
        WarehouseError::Status {
            code,
            reason: reason.map(String::from),
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_conflict_classification() {
        assert!(status(409, None).is_conflict());
        assert!(!status(409, None).is_retryable());
        assert!(!status(400, None).is_conflict());
    }

    #[test]
    fn test_rate_limit_and_billing_tier_are_retryable() {
        assert!(status(400, Some("rateLimitExceeded")).is_retryable());
        assert!(status(403, Some("rateLimitExceeded")).is_retryable());
        assert!(status(400, Some("billingTierLimitExceeded")).is_retryable());
        // same reason on an unrelated code is not special-cased
        assert!(!status(404, Some("rateLimitExceeded")).is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(status(500, None).is_retryable());
        assert!(status(503, None).is_retryable());
        assert!(status(400, Some("backendError")).is_retryable());
    }

    #[test]
    fn test_invalid_operation_classification() {
        assert!(status(400, Some("invalid")).is_invalid_operation());
        assert!(status(400, Some("invalidQuery")).is_invalid_operation());
        assert!(!status(400, Some("invalid")).is_retryable());
        assert!(!status(400, Some("rateLimitExceeded")).is_invalid_operation());
    }
}
