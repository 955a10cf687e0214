//! Load stage: batch objects into BigQuery tables.
//!
//! Streaming blobs load into a staging table named
//! `<prefix><target table>`, clustered on `_batch_id`; snapshot blobs
//! load straight into the target. Job ids are deterministic per
//! `(table, batch, attempt)`: on a retry the previous attempts are
//! checked first and a job that exists and did not fail is reused instead
//! of loading the same data twice.

use std::time::Instant;
use tracing::{info, warn};

use floe_core::emit;

use crate::metrics::events::LoadCompleted;
use crate::schema::clustering_supported_keys;
use crate::warehouse::{
    job_id, JobKind, TableDef, TableId, Warehouse, WarehouseError,
};
use crate::writer::TableBlob;

/// Find a job from a previous attempt that can be reused.
///
/// Scans attempts `attempt-1 .. 0` and considers the first job found: if
/// it did not fail it is reused (it may still be running), otherwise a
/// new job is submitted.
pub async fn previous_job_if_not_failed(
    warehouse: &dyn Warehouse,
    app: &str,
    kind: JobKind,
    table: &TableId,
    batch_id: i64,
    attempt: u32,
) -> Result<Option<String>, WarehouseError> {
    for prev_attempt in (0..attempt).rev() {
        let id = job_id(app, kind, table, batch_id, prev_attempt);
        if let Some(snapshot) = warehouse.find_job(&id).await? {
            if snapshot.done && snapshot.error.is_some() {
                warn!(
                    job_id = %id,
                    error = %snapshot.error.as_deref().unwrap_or_default(),
                    "Previous job failed, submitting a new one"
                );
                return Ok(None);
            }
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Load one batch object into `destination`.
///
/// `kind` selects the schema and clustering: staging loads use the blob's
/// staging schema clustered on `_batch_id`, direct target loads use the
/// target schema clustered on the eligible primary key columns.
#[allow(clippy::too_many_arguments)]
pub async fn load_blob(
    warehouse: &dyn Warehouse,
    app: &str,
    blob: &TableBlob,
    destination: &TableId,
    kind: JobKind,
    source_uri: &str,
    primary_keys: &[String],
    max_clustering_columns: usize,
    attempt: u32,
) -> Result<(), WarehouseError> {
    info!(
        batch_id = blob.batch_id,
        events = blob.num_events,
        destination = %destination,
        attempt,
        "Loading batch object"
    );
    let started = Instant::now();

    let reused = if attempt > 0 {
        previous_job_if_not_failed(warehouse, app, kind, &blob.table, blob.batch_id, attempt)
            .await?
    } else {
        None
    };

    let schema = match kind {
        JobKind::LoadTarget => &blob.target_schema,
        _ => &blob.staging_schema,
    };

    let id = match reused {
        Some(id) => {
            info!(job_id = %id, "Reusing load job from a previous attempt");
            id
        }
        None => {
            if warehouse.get_table(destination).await?.is_none() {
                let clustering = match kind {
                    JobKind::LoadTarget => {
                        let mut keys = clustering_supported_keys(primary_keys, schema);
                        keys.truncate(max_clustering_columns);
                        keys
                    }
                    _ => vec![crate::schema::BATCH_ID.to_string()],
                };
                warehouse
                    .create_table(
                        destination,
                        &TableDef {
                            schema: schema.clone(),
                            clustering,
                        },
                    )
                    .await?;
            }

            let id = job_id(app, kind, &blob.table, blob.batch_id, attempt);
            warehouse
                .submit_load_job(&id, destination, source_uri, schema, blob.format)
                .await?;
            id
        }
    };

    let outcome = warehouse.wait_for_job(&id).await?;
    if let Some(message) = outcome.error {
        return Err(WarehouseError::JobFailed {
            job_id: id,
            message,
        });
    }

    emit!(LoadCompleted {
        table: blob.table.to_string(),
        duration: started.elapsed(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::JobSnapshot;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock warehouse that only tracks jobs.
    #[derive(Default)]
    struct JobLedger {
        jobs: Mutex<HashMap<String, JobSnapshot>>,
    }

    impl JobLedger {
        fn with_job(self, id: &str, done: bool, error: Option<&str>) -> Self {
            self.jobs.lock().unwrap().insert(
                id.to_string(),
                JobSnapshot {
                    job_id: id.to_string(),
                    done,
                    error: error.map(String::from),
                },
            );
            self
        }
    }

    #[async_trait]
    impl Warehouse for JobLedger {
        async fn dataset_exists(&self, _: &str) -> Result<bool, WarehouseError> {
            Ok(true)
        }
        async fn create_dataset(&self, _: &str, _: Option<&str>) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn delete_dataset(&self, _: &str) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn get_table(
            &self,
            _: &TableId,
        ) -> Result<Option<crate::warehouse::TableDef>, WarehouseError> {
            Ok(None)
        }
        async fn create_table(
            &self,
            _: &TableId,
            _: &crate::warehouse::TableDef,
        ) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn update_table(
            &self,
            _: &TableId,
            _: &crate::warehouse::TableDef,
        ) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn delete_table(&self, _: &TableId) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn ensure_column(
            &self,
            _: &TableId,
            _: &crate::schema::ColumnSchema,
        ) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn submit_load_job(
            &self,
            job_id: &str,
            _: &TableId,
            _: &str,
            _: &crate::schema::TableSchema,
            _: crate::warehouse::LoadFormat,
        ) -> Result<(), WarehouseError> {
            self.jobs.lock().unwrap().insert(
                job_id.to_string(),
                JobSnapshot {
                    job_id: job_id.to_string(),
                    done: true,
                    error: None,
                },
            );
            Ok(())
        }
        async fn submit_query_job(&self, _: &str, _: &str) -> Result<(), WarehouseError> {
            Ok(())
        }
        async fn find_job(&self, job_id: &str) -> Result<Option<JobSnapshot>, WarehouseError> {
            Ok(self.jobs.lock().unwrap().get(job_id).cloned())
        }
        async fn wait_for_job(&self, job_id: &str) -> Result<crate::warehouse::JobOutcome, WarehouseError> {
            let jobs = self.jobs.lock().unwrap();
            let snapshot = jobs.get(job_id).unwrap();
            Ok(crate::warehouse::JobOutcome {
                job_id: job_id.to_string(),
                error: snapshot.error.clone(),
            })
        }
        async fn max_sequence_number(&self, _: &TableId) -> Result<i64, WarehouseError> {
            Ok(0)
        }
    }

    fn table() -> TableId {
        TableId::new("appdb", "users")
    }

    #[tokio::test]
    async fn test_no_previous_job_on_first_attempt() {
        let ledger = JobLedger::default();
        let found =
            previous_job_if_not_failed(&ledger, "app", JobKind::LoadStaging, &table(), 100, 0)
                .await
                .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_previous_successful_job_is_reused() {
        let ledger =
            JobLedger::default().with_job("app_stage_appdb_users_100_0", true, None);
        let found =
            previous_job_if_not_failed(&ledger, "app", JobKind::LoadStaging, &table(), 100, 1)
                .await
                .unwrap();
        assert_eq!(found.as_deref(), Some("app_stage_appdb_users_100_0"));
    }

    #[tokio::test]
    async fn test_previous_running_job_is_reused() {
        let ledger =
            JobLedger::default().with_job("app_stage_appdb_users_100_1", false, None);
        let found =
            previous_job_if_not_failed(&ledger, "app", JobKind::LoadStaging, &table(), 100, 2)
                .await
                .unwrap();
        assert_eq!(found.as_deref(), Some("app_stage_appdb_users_100_1"));
    }

    #[tokio::test]
    async fn test_previous_failed_job_is_not_reused() {
        let ledger = JobLedger::default().with_job(
            "app_merge_appdb_users_100_0",
            true,
            Some("backend error"),
        );
        let found = previous_job_if_not_failed(&ledger, "app", JobKind::Merge, &table(), 100, 1)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_scan_finds_most_recent_attempt_first() {
        // Attempt 1 exists and succeeded; attempt 0 also exists. The scan
        // starts at attempt-1 and must pick attempt 1.
        let ledger = JobLedger::default()
            .with_job("app_stage_appdb_users_100_0", true, None)
            .with_job("app_stage_appdb_users_100_1", true, None);
        let found =
            previous_job_if_not_failed(&ledger, "app", JobKind::LoadStaging, &table(), 100, 2)
                .await
                .unwrap();
        assert_eq!(found.as_deref(), Some("app_stage_appdb_users_100_1"));
    }
}
