//! Target wiring: credentials, staging bucket, and startup sequencing.
//!
//! Before replication starts, the highest `_sequence_num` already present
//! across the replicated tables is read back so the host resumes event
//! numbering where a previous deployment left off. Consumer construction
//! verifies the staging bucket is reachable; provisioning the bucket
//! itself (colocated with the target datasets) is a deployment step.

use std::sync::Arc;
use std::time::Duration;

use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use gcp_bigquery_client::Client;
use tracing::{error, info};

use floe_core::retry::{run_with_retries, ErrorClass, RetryPolicy};
use floe_core::StorageProvider;

use crate::config::Config;
use crate::consumer::{ConsumerSettings, EventConsumer};
use crate::context::TargetContext;
use crate::error::ReplicationError;
use crate::names::{normalize_dataset_name, normalize_table_name};
use crate::warehouse::{BigQueryWarehouse, TableId, WarehouseError};

/// Largest number of tables one sequence-number query may reference.
const MAX_TABLES_PER_QUERY: usize = 1000;

/// Policy for startup metadata calls.
fn startup_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 25,
        max_duration: Duration::from_secs(120),
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        jitter: 0.1,
    }
}

/// The BigQuery replication target.
pub struct BigQueryTarget {
    config: Config,
}

impl BigQueryTarget {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve the target project: configuration first, then the ambient
    /// environment.
    fn project(&self) -> Result<String, ReplicationError> {
        if let Some(project) = self.config.project() {
            return Ok(project.to_string());
        }
        std::env::var("GOOGLE_CLOUD_PROJECT").map_err(|_| ReplicationError::Setup {
            message: "No project configured and GOOGLE_CLOUD_PROJECT is not set. \
                      Set 'project' or run with ambient credentials that carry one."
                .to_string(),
        })
    }

    async fn build_client(&self) -> Result<Client, ReplicationError> {
        match self.config.service_account_key() {
            Some(key) => {
                let sa_key = parse_service_account_key(key).map_err(|e| {
                    ReplicationError::Setup {
                        message: format!("Invalid service account key: {e}"),
                    }
                })?;
                Client::from_service_account_key(sa_key, false)
                    .await
                    .map_err(|source| WarehouseError::Api { source }.into())
            }
            None => Client::from_application_default_credentials()
                .await
                .map_err(|source| WarehouseError::Api { source }.into()),
        }
    }

    fn build_warehouse(&self, client: Client, project: String) -> BigQueryWarehouse {
        BigQueryWarehouse::new(
            client,
            project,
            self.config.staging_bucket_location.clone(),
            self.config.encryption_key().map(String::from),
        )
    }

    /// The replicated tables with warehouse-normalized names.
    fn normalized_tables(&self, tables: Vec<(String, String)>) -> Vec<TableId> {
        tables
            .into_iter()
            .map(|(database, table)| {
                TableId::new(
                    normalize_dataset_name(self.config.dataset_name.as_deref(), &database),
                    normalize_table_name(&table),
                )
            })
            .collect()
    }

    /// Seed the host's sequence counter with the highest sequence number
    /// already materialized in the target tables.
    pub async fn initialize(&self, context: &dyn TargetContext) -> Result<(), ReplicationError> {
        let project = self.project()?;
        let client = self.build_client().await?;
        let warehouse = self.build_warehouse(client, project);
        let tables = self.normalized_tables(context.all_tables());

        let shutdown = tokio_util::sync::CancellationToken::new();
        let result = run_with_retries(
            &startup_retry_policy(),
            &shutdown,
            |e: &WarehouseError| {
                if e.is_retryable() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            },
            |attempt, e| {
                error!(attempt, error = %e, "Failed to read existing sequence numbers");
            },
            |_| warehouse.max_sequence_across(&tables, MAX_TABLES_PER_QUERY),
        )
        .await;

        let max_sequence = result.map_err(|e| ReplicationError::Setup {
            message: format!(
                "Failed to compute the maximum sequence number among all the target tables \
                 selected for replication. Please make sure that if target tables exist, \
                 they have a '_sequence_num' column: {e}"
            ),
        })?;

        info!(max_sequence, "Found maximum existing sequence number");
        context.initialize_sequence_number(max_sequence).await?;
        Ok(())
    }

    /// Build the event consumer: warehouse client, staging bucket storage,
    /// and the orchestrator wired together.
    pub async fn create_consumer(
        &self,
        context: Arc<dyn TargetContext>,
    ) -> Result<EventConsumer, ReplicationError> {
        let project = self.project()?;
        let client = self.build_client().await?;
        let warehouse = Arc::new(self.build_warehouse(client, project.clone()));

        let bucket = self.config.staging_bucket_name();
        let storage = Arc::new(
            StorageProvider::for_url(&format!("gs://{bucket}"))
                .await
                .map_err(|e| ReplicationError::Setup {
                    message: format!("Failed to configure staging bucket '{bucket}': {e}"),
                })?,
        );
        if let Err(e) = storage.probe().await {
            return Err(ReplicationError::Setup {
                message: format!(
                    "Staging bucket '{bucket}' in project '{project}' is not accessible. \
                     Please make sure the service account has access, and create the bucket \
                     in the same location as the target datasets before starting: {e}"
                ),
            });
        }
        info!(bucket = %bucket, "Staging bucket is reachable");

        let settings = ConsumerSettings::from_config(&self.config);
        Ok(EventConsumer::new(warehouse, context, storage, settings))
    }
}
