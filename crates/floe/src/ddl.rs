//! DDL application.
//!
//! Translates schema-changing events into warehouse metadata operations.
//! Every case is idempotent against redelivery: creations tolerate
//! conflicts, drops tolerate absence, and the consumer flushes buffered
//! rows before any event that changes or removes a table so that no
//! batch spans a DDL.

use std::sync::Arc;
use tracing::{info, warn};

use crate::context::TargetContext;
use crate::error::ReplicationError;
use crate::event::{DdlEvent, DdlKind};
use crate::names::{normalize_field_name, normalize_table_name};
use crate::schema::{clustering_supported_keys, target_schema, ColumnSchema, TableSchema};
use crate::state::{decode_bool, direct_load_key, TableCache};
use crate::warehouse::{TableDef, TableId, Warehouse};

/// Normalized names for the event being applied.
#[derive(Debug, Clone)]
pub struct NormalizedNames {
    pub dataset: String,
    pub table: Option<String>,
    pub staging_table: Option<String>,
}

impl NormalizedNames {
    pub fn resolve(event_database: &str, event_table: Option<&str>, dataset_override: Option<&str>, staging_prefix: &str) -> Self {
        let dataset = crate::names::normalize_dataset_name(dataset_override, event_database);
        let table = event_table.map(normalize_table_name);
        let staging_table = table
            .as_deref()
            .map(|t| normalize_table_name(&format!("{staging_prefix}{t}")));
        Self {
            dataset,
            table,
            staging_table,
        }
    }

    fn target(&self) -> TableId {
        TableId::new(
            self.dataset.clone(),
            self.table.clone().unwrap_or_default(),
        )
    }

    fn staging(&self) -> TableId {
        TableId::new(
            self.dataset.clone(),
            self.staging_table.clone().unwrap_or_default(),
        )
    }
}

/// Applies DDL events to the warehouse.
pub struct DdlApplier {
    warehouse: Arc<dyn Warehouse>,
    context: Arc<dyn TargetContext>,
    require_manual_drops: bool,
    max_clustering_columns: usize,
    /// Region for created datasets, matching the staging bucket.
    bucket_location: Option<String>,
}

impl DdlApplier {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        context: Arc<dyn TargetContext>,
        require_manual_drops: bool,
        max_clustering_columns: usize,
        bucket_location: Option<String>,
    ) -> Self {
        Self {
            warehouse,
            context,
            require_manual_drops,
            max_clustering_columns,
            bucket_location,
        }
    }

    /// The source schema with normalized column names.
    fn normalized_schema(event: &DdlEvent) -> TableSchema {
        let fields = event
            .schema
            .as_ref()
            .map(|schema| {
                schema
                    .fields
                    .iter()
                    .map(|f| ColumnSchema {
                        name: normalize_field_name(&f.name),
                        column_type: f.column_type.clone(),
                        nullable: f.nullable,
                    })
                    .collect()
            })
            .unwrap_or_default();
        TableSchema::new(fields)
    }

    fn normalized_primary_keys(event: &DdlEvent) -> Vec<String> {
        event
            .primary_key
            .iter()
            .map(|k| normalize_field_name(k))
            .collect()
    }

    /// Build the augmented target table definition for a table-level event.
    async fn target_definition(
        &self,
        event: &DdlEvent,
        table: &TableId,
        cache: &mut TableCache,
    ) -> Result<TableDef, ReplicationError> {
        let source_schema = Self::normalized_schema(event);
        let sort_entry = cache.sort_keys(self.context.as_ref(), table).await?;
        let ordering = self.context.source_properties().ordering;
        let schema = target_schema(
            &source_schema,
            ordering,
            sort_entry.as_ref().map(|e| e.types.as_slice()),
        );
        let mut clustering = clustering_supported_keys(&event.primary_key, &source_schema);
        clustering.truncate(self.max_clustering_columns);
        Ok(TableDef { schema, clustering })
    }

    /// Apply one DDL event. The consumer has already flushed buffered
    /// rows for events that require it.
    pub async fn apply(
        &self,
        event: &DdlEvent,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        match event.kind {
            DdlKind::CreateDatabase => self.create_database(names).await,
            DdlKind::DropDatabase => self.drop_database(names, cache).await,
            DdlKind::CreateTable => self.create_table(event, names, cache).await,
            DdlKind::DropTable => self.drop_table(names, cache).await,
            DdlKind::AlterTable => self.alter_table(event, names, cache).await,
            DdlKind::TruncateTable => self.truncate_table(event, names, cache).await,
            DdlKind::RenameTable => {
                warn!(
                    database = %event.database,
                    from = event.prev_table.as_deref().unwrap_or_default(),
                    to = event.table.as_deref().unwrap_or_default(),
                    "Rename events are not supported; ignoring"
                );
                Ok(())
            }
        }
    }

    async fn create_database(&self, names: &NormalizedNames) -> Result<(), ReplicationError> {
        if self.warehouse.dataset_exists(&names.dataset).await? {
            return Ok(());
        }
        match self
            .warehouse
            .create_dataset(&names.dataset, self.bucket_location.as_deref())
            .await
        {
            Ok(()) => Ok(()),
            // Another worker may create the dataset between our existence
            // check and the create call.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn drop_database(
        &self,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        cache.clear_primary_keys();
        if !self.warehouse.dataset_exists(&names.dataset).await? {
            return Ok(());
        }
        if self.require_manual_drops {
            return Err(ReplicationError::ManualDropRequired {
                object: "dataset".to_string(),
                name: names.dataset.clone(),
            });
        }
        self.warehouse.delete_dataset(&names.dataset).await?;
        Ok(())
    }

    async fn create_table(
        &self,
        event: &DdlEvent,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        let table = names.target();
        // Reject an empty key before touching anything.
        if event.primary_key.is_empty() {
            return Err(ReplicationError::NoPrimaryKey {
                database: table.dataset.clone(),
                table: table.table.clone(),
            });
        }
        let existing = self.warehouse.get_table(&table).await?;

        // A set direct-load marker with an existing table means a snapshot
        // was abandoned mid-load; the partial table must go.
        let marker = self
            .context
            .get_state(&direct_load_key(&table.dataset, &table.table))
            .await?;
        if existing.is_some() && decode_bool(marker.as_deref()) {
            info!(table = %table, "Deleting table left behind by an abandoned snapshot");
            self.warehouse.delete_table(&table).await?;
        }

        cache
            .update_primary_keys(
                self.context.as_ref(),
                &table,
                Self::normalized_primary_keys(event),
            )
            .await?;
        cache.cache_schema(&table, Self::normalized_schema(event));

        let table_absent = existing.is_none() || decode_bool(marker.as_deref());
        if table_absent {
            let def = self.target_definition(event, &table, cache).await?;
            match self.warehouse.create_table(&table, &def).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn drop_table(
        &self,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        let table = names.target();
        cache.remove(&table);

        if self.warehouse.get_table(&table).await?.is_some() {
            if self.require_manual_drops {
                return Err(ReplicationError::ManualDropRequired {
                    object: "table".to_string(),
                    name: table.to_string(),
                });
            }
            self.warehouse.delete_table(&table).await?;
        }

        let staging = names.staging();
        if self.warehouse.get_table(&staging).await?.is_some() {
            self.warehouse.delete_table(&staging).await?;
        }
        Ok(())
    }

    async fn alter_table(
        &self,
        event: &DdlEvent,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        let table = names.target();
        // Reject an empty key before touching anything.
        if event.primary_key.is_empty() {
            return Err(ReplicationError::NoPrimaryKey {
                database: table.dataset.clone(),
                table: table.table.clone(),
            });
        }

        let def = self.target_definition(event, &table, cache).await?;
        if self.warehouse.get_table(&table).await?.is_some() {
            self.warehouse.update_table(&table, &def).await?;
        } else {
            self.warehouse.create_table(&table, &def).await?;
        }

        cache
            .update_primary_keys(
                self.context.as_ref(),
                &table,
                Self::normalized_primary_keys(event),
            )
            .await?;
        cache.cache_schema(&table, Self::normalized_schema(event));
        Ok(())
    }

    async fn truncate_table(
        &self,
        event: &DdlEvent,
        names: &NormalizedNames,
        cache: &mut TableCache,
    ) -> Result<(), ReplicationError> {
        let table = names.target();
        let def = match self.warehouse.get_table(&table).await? {
            Some(existing) => {
                self.warehouse.delete_table(&table).await?;
                existing
            }
            // The table was never created here; derive the definition
            // from the event schema.
            None => self.target_definition(event, &table, cache).await?,
        };
        self.warehouse.create_table(&table, &def).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_names() {
        let names = NormalizedNames::resolve("app-db", Some("user.events"), None, "_staging_");
        assert_eq!(names.dataset, "app_db");
        assert_eq!(names.table.as_deref(), Some("user_events"));
        assert_eq!(names.staging_table.as_deref(), Some("_staging_user_events"));
    }

    #[test]
    fn test_normalized_names_with_dataset_override() {
        let names = NormalizedNames::resolve("sourcedb", Some("t"), Some("warehouse"), "_staging_");
        assert_eq!(names.dataset, "warehouse");
    }

    #[test]
    fn test_database_level_event_has_no_table_names() {
        let names = NormalizedNames::resolve("db", None, None, "_staging_");
        assert!(names.table.is_none());
        assert!(names.staging_table.is_none());
    }
}
