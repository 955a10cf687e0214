//! Configuration for the replication target.
//!
//! Parsed from YAML with defaults matching the documented behavior.
//! A handful of tuning knobs arrive through `runtime_arguments` rather
//! than first-class fields so that operators can adjust a running
//! deployment without a config schema change; the accessors below resolve
//! them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use floe_core::error::{ConfigError, EmptyFieldSnafu, InvalidValueSnafu, ReadFileSnafu, YamlParseSnafu};
use snafu::prelude::*;

use crate::event::SourceProperties;

/// Runtime argument overriding the encryption key.
const CMEK_KEY_ARG: &str = "gcp.cmek.key.name";
/// Runtime argument bounding clustering columns.
const MAX_CLUSTERING_COLUMNS_ARG: &str = "gcp.bigquery.max.clustering.columns";
/// Runtime argument keeping staging tables after a merge.
const RETAIN_STAGING_TABLE_ARG: &str = "retain.staging.table";

const STAGING_BUCKET_PREFIX: &str = "df-rbq";
const GCS_SCHEME: &str = "gs://";

fn default_staging_table_prefix() -> String {
    "_staging_".to_string()
}

fn default_load_interval_secs() -> u64 {
    90
}

fn default_max_retry_seconds() -> u64 {
    300
}

fn default_state_path() -> String {
    "floe-state.json".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    floe_core::metrics::DEFAULT_METRICS_ADDR.to_string()
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

/// Main configuration.
///
/// # Example
///
/// ```yaml
/// project: my-project
/// namespace: prod
/// application_name: orders-replicator
/// staging_bucket_location: US
/// load_interval_secs: 90
/// source:
///   ordering: ordered
///   row_id_supported: false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target project. `auto-detect` (or omitted) uses the ambient
    /// project of the environment's credentials.
    #[serde(default)]
    pub project: Option<String>,

    /// Service account key JSON. `auto-detect` (or omitted) uses
    /// application default credentials.
    #[serde(default)]
    pub service_account_key: Option<String>,

    /// Staging bucket override. Defaults to
    /// `df-rbq-<namespace>-<application_name>-<generation>`.
    #[serde(default)]
    pub staging_bucket: Option<String>,

    /// Region used when creating datasets; must match the bucket.
    #[serde(default)]
    pub staging_bucket_location: Option<String>,

    #[serde(default = "default_staging_table_prefix")]
    pub staging_table_prefix: String,

    /// Seconds between scheduled flushes.
    #[serde(default = "default_load_interval_secs")]
    pub load_interval_secs: u64,

    /// Refuse to drop datasets and tables; an operator must do it.
    #[serde(default)]
    pub require_manual_drops: bool,

    /// Mark deleted rows with `_is_deleted` instead of removing them.
    /// No-op for unordered sources, which always delete softly.
    #[serde(default)]
    pub soft_deletes: bool,

    /// Dataset name override; defaults to the normalized source database
    /// name.
    #[serde(default)]
    pub dataset_name: Option<String>,

    /// Customer-managed encryption key for created resources.
    #[serde(default)]
    pub encryption_key_name: Option<String>,

    /// Pipeline namespace, used in the default staging bucket name.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Application name: job id prefix, object path segment, and part of
    /// the default staging bucket name.
    pub application_name: String,

    /// Deployment generation, used in the default staging bucket name.
    #[serde(default)]
    pub generation: u64,

    /// Free-form runtime arguments; see the accessors.
    #[serde(default)]
    pub runtime_arguments: HashMap<String, String>,

    /// Declared capabilities of the upstream source.
    #[serde(default)]
    pub source: SourceProperties,

    /// Total retry budget for load and merge operations, in seconds.
    /// Values below 1 disable retries.
    #[serde(default = "default_max_retry_seconds")]
    pub max_retry_seconds: u64,

    /// `database.table` pairs selected for replication; used to seed the
    /// sequence number on startup.
    #[serde(default)]
    pub replicated_tables: Vec<String>,

    /// Where the binary keeps its committed offset and table state.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.trim().is_empty() {
            return EmptyFieldSnafu {
                field: "application_name",
            }
            .fail();
        }
        if self.staging_table_prefix.is_empty() {
            return EmptyFieldSnafu {
                field: "staging_table_prefix",
            }
            .fail();
        }
        if self.load_interval_secs == 0 {
            return InvalidValueSnafu {
                field: "load_interval_secs",
                message: "must be at least 1 second",
            }
            .fail();
        }
        for table in &self.replicated_tables {
            // database.table, split on the first dot
            let valid = table
                .split_once('.')
                .is_some_and(|(db, t)| !db.is_empty() && !t.is_empty());
            if !valid {
                return InvalidValueSnafu {
                    field: "replicated_tables",
                    message: format!("'{table}' is not in database.table form"),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// The project to use, unless credentials should decide.
    pub fn project(&self) -> Option<&str> {
        match self.project.as_deref() {
            None => None,
            Some(p) if p.eq_ignore_ascii_case("auto-detect") => None,
            Some(p) => Some(p),
        }
    }

    /// The service account key, unless ambient credentials should be used.
    pub fn service_account_key(&self) -> Option<&str> {
        match self.service_account_key.as_deref() {
            None => None,
            Some(k) if k.eq_ignore_ascii_case("auto-detect") => None,
            Some(k) => Some(k),
        }
    }

    /// The effective encryption key: the runtime argument wins over the
    /// configured key.
    pub fn encryption_key(&self) -> Option<&str> {
        self.runtime_arguments
            .get(CMEK_KEY_ARG)
            .map(String::as_str)
            .or(self.encryption_key_name.as_deref())
    }

    /// Upper bound on clustering columns for created tables.
    pub fn max_clustering_columns(&self) -> usize {
        self.runtime_arguments
            .get(MAX_CLUSTERING_COLUMNS_ARG)
            .and_then(|v| v.parse().ok())
            .unwrap_or(4)
    }

    /// Whether staging tables are kept after a successful merge.
    pub fn retain_staging_table(&self) -> bool {
        self.runtime_arguments
            .get(RETAIN_STAGING_TABLE_ARG)
            .is_some_and(|v| v.parse().unwrap_or(false))
    }

    /// Resolve the staging bucket name: the override when set, otherwise
    /// `df-rbq-<namespace>-<application_name>-<generation>`. A `gs://`
    /// scheme is stripped and the name is lowercased.
    pub fn staging_bucket_name(&self) -> String {
        let name = match self.staging_bucket.as_deref().map(str::trim) {
            Some(bucket) if !bucket.is_empty() => bucket.to_string(),
            _ => format!(
                "{STAGING_BUCKET_PREFIX}-{}-{}-{}",
                self.namespace.as_deref().unwrap_or("default"),
                self.application_name,
                self.generation
            ),
        };
        name.strip_prefix(GCS_SCHEME)
            .unwrap_or(&name)
            .to_lowercase()
    }

    /// The replicated tables as (database, table) pairs.
    pub fn tables(&self) -> Vec<(String, String)> {
        self.replicated_tables
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('.')
                    .map(|(db, table)| (db.to_string(), table.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceOrdering;

    #[test]
    fn test_minimal_config() {
        let config = Config::parse("application_name: replicator\n").unwrap();
        assert_eq!(config.application_name, "replicator");
        assert_eq!(config.staging_table_prefix, "_staging_");
        assert_eq!(config.load_interval_secs, 90);
        assert!(!config.require_manual_drops);
        assert!(!config.soft_deletes);
        assert_eq!(config.max_clustering_columns(), 4);
        assert!(!config.retain_staging_table());
        assert_eq!(config.source.ordering, SourceOrdering::Ordered);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_empty_application_name_rejected() {
        assert!(Config::parse("application_name: \"\"\n").is_err());
    }

    #[test]
    fn test_zero_load_interval_rejected() {
        let yaml = "application_name: app\nload_interval_secs: 0\n";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_default_staging_bucket_name() {
        let yaml = "application_name: Orders\nnamespace: prod\ngeneration: 17\n";
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.staging_bucket_name(), "df-rbq-prod-orders-17");
    }

    #[test]
    fn test_staging_bucket_override_strips_scheme() {
        let yaml = "application_name: app\nstaging_bucket: gs://My-Bucket\n";
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.staging_bucket_name(), "my-bucket");
    }

    #[test]
    fn test_cmek_runtime_argument_wins() {
        let yaml = r#"
application_name: app
encryption_key_name: projects/p/keys/configured
runtime_arguments:
  gcp.cmek.key.name: projects/p/keys/runtime
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.encryption_key(), Some("projects/p/keys/runtime"));
    }

    #[test]
    fn test_runtime_tuning_arguments() {
        let yaml = r#"
application_name: app
runtime_arguments:
  gcp.bigquery.max.clustering.columns: "2"
  retain.staging.table: "true"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.max_clustering_columns(), 2);
        assert!(config.retain_staging_table());
    }

    #[test]
    fn test_auto_detect_project_resolves_to_none() {
        let yaml = "application_name: app\nproject: auto-detect\n";
        let config = Config::parse(yaml).unwrap();
        assert!(config.project().is_none());

        let yaml = "application_name: app\nproject: my-project\n";
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.project(), Some("my-project"));
    }

    #[test]
    fn test_replicated_tables_parsing() {
        let yaml = r#"
application_name: app
replicated_tables:
  - appdb.users
  - appdb.orders
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(
            config.tables(),
            vec![
                ("appdb".to_string(), "users".to_string()),
                ("appdb".to_string(), "orders".to_string())
            ]
        );
    }

    #[test]
    fn test_malformed_replicated_table_rejected() {
        let yaml = "application_name: app\nreplicated_tables:\n  - not-a-table\n";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_unordered_source_config() {
        let yaml = r#"
application_name: app
source:
  ordering: unordered
  row_id_supported: true
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.source.ordering, SourceOrdering::Unordered);
        assert!(config.source.row_id_supported);
    }
}
