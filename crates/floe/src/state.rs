//! Per-table state persisted in the host's key-value store.
//!
//! The state store is a plain key→bytes mapping with no ordering or
//! cross-key transactional guarantees. Everything the pipeline needs to
//! survive a restart — primary keys, sort key types, the direct-load
//! marker — lives under well-known keys; the committed offset has its own
//! slot owned by the host.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;

use crate::context::TargetContext;
use crate::error::{ReplicationError, StateDecodeSnafu};
use crate::schema::{ColumnType, TableSchema};
use crate::warehouse::TableId;

const TABLE_STATE_PREFIX: &str = "bigquery-";
const DIRECT_LOAD_PREFIX: &str = "bigquery-direct-load-in-progress-";

/// State store key for a table's replication state.
pub fn table_state_key(dataset: &str, table: &str) -> String {
    format!("{TABLE_STATE_PREFIX}{dataset}-{table}")
}

/// State store key for a table's direct-load-in-progress marker.
pub fn direct_load_key(dataset: &str, table: &str) -> String {
    format!("{DIRECT_LOAD_PREFIX}{dataset}-{table}")
}

/// Encode a boolean as a single state byte.
pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

/// Decode a single state byte as a boolean. Empty or missing state reads
/// as false.
pub fn decode_bool(bytes: Option<&[u8]>) -> bool {
    bytes.is_some_and(|b| b.first().copied() == Some(1))
}

/// Replication state for one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTableState {
    pub primary_keys: Vec<String>,
    /// Sort key types; present iff the source is unordered and a sort key
    /// has been seen.
    #[serde(default)]
    pub sort_keys: Option<Vec<ColumnType>>,
    /// Whether the `_sort` column has been added to the target table.
    #[serde(default)]
    pub sort_key_added_to_target: bool,
}

impl TargetTableState {
    pub fn new(primary_keys: Vec<String>, sort_keys: Option<Vec<ColumnType>>) -> Self {
        Self {
            primary_keys,
            sort_keys,
            sort_key_added_to_target: false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("table state serializes")
    }

    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, ReplicationError> {
        serde_json::from_slice(bytes).context(StateDecodeSnafu { key })
    }
}

/// Sort key bookkeeping for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKeyEntry {
    pub types: Vec<ColumnType>,
    pub added_to_target: bool,
}

/// In-memory mirror of per-table replication state, with read-through to
/// the state store. Accessed only under the consumer's lock, so it needs
/// no internal synchronization.
#[derive(Default)]
pub struct TableCache {
    primary_keys: HashMap<TableId, Vec<String>>,
    sort_keys: HashMap<TableId, SortKeyEntry>,
    /// Source column schemas seen via DDL. Not persisted: after a restart
    /// the schema is re-learned from DDL or inferred from row values.
    schemas: HashMap<TableId, TableSchema>,
}

impl TableCache {
    /// Record the primary key for a table and persist it alongside any
    /// known sort keys. An empty key set is a fatal error and leaves all
    /// state untouched.
    pub async fn update_primary_keys(
        &mut self,
        context: &dyn TargetContext,
        table: &TableId,
        primary_keys: Vec<String>,
    ) -> Result<(), ReplicationError> {
        if primary_keys.is_empty() {
            return Err(ReplicationError::NoPrimaryKey {
                database: table.dataset.clone(),
                table: table.table.clone(),
            });
        }
        if self.primary_keys.get(table) == Some(&primary_keys) {
            return Ok(());
        }
        self.primary_keys.insert(table.clone(), primary_keys.clone());
        let sort_keys = self.sort_keys.get(table);
        let state = TargetTableState {
            primary_keys,
            sort_keys: sort_keys.map(|s| s.types.clone()),
            sort_key_added_to_target: sort_keys.is_some_and(|s| s.added_to_target),
        };
        context
            .put_state(&table_state_key(&table.dataset, &table.table), state.encode())
            .await?;
        Ok(())
    }

    /// The primary key for a table: cached, else read through from the
    /// state store. Missing state is fatal — it means the store was lost.
    pub async fn primary_keys(
        &mut self,
        context: &dyn TargetContext,
        table: &TableId,
    ) -> Result<Vec<String>, ReplicationError> {
        if let Some(keys) = self.primary_keys.get(table) {
            return Ok(keys.clone());
        }
        let key = table_state_key(&table.dataset, &table.table);
        let Some(bytes) = context.get_state(&key).await? else {
            return Err(ReplicationError::MissingPrimaryKeyState {
                dataset: table.dataset.clone(),
                table: table.table.clone(),
            });
        };
        if bytes.is_empty() {
            return Err(ReplicationError::MissingPrimaryKeyState {
                dataset: table.dataset.clone(),
                table: table.table.clone(),
            });
        }
        let state = TargetTableState::decode(&key, &bytes)?;
        self.primary_keys
            .insert(table.clone(), state.primary_keys.clone());
        if let Some(types) = state.sort_keys {
            self.sort_keys.entry(table.clone()).or_insert(SortKeyEntry {
                types,
                added_to_target: state.sort_key_added_to_target,
            });
        }
        Ok(state.primary_keys)
    }

    /// Record sort key types for a table on first sight and persist them.
    pub async fn store_sort_keys(
        &mut self,
        context: &dyn TargetContext,
        table: &TableId,
        types: Vec<ColumnType>,
    ) -> Result<(), ReplicationError> {
        if types.is_empty() {
            return Ok(());
        }
        let primary_keys = self.primary_keys(context, table).await?;
        self.sort_keys.insert(
            table.clone(),
            SortKeyEntry {
                types: types.clone(),
                added_to_target: false,
            },
        );
        let state = TargetTableState::new(primary_keys, Some(types));
        context
            .put_state(&table_state_key(&table.dataset, &table.table), state.encode())
            .await?;
        Ok(())
    }

    /// Sort key bookkeeping for a table: cached, else read through.
    pub async fn sort_keys(
        &mut self,
        context: &dyn TargetContext,
        table: &TableId,
    ) -> Result<Option<SortKeyEntry>, ReplicationError> {
        if let Some(entry) = self.sort_keys.get(table) {
            return Ok(Some(entry.clone()));
        }
        let key = table_state_key(&table.dataset, &table.table);
        let Some(bytes) = context.get_state(&key).await? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let state = TargetTableState::decode(&key, &bytes)?;
        match state.sort_keys {
            Some(types) => {
                let entry = SortKeyEntry {
                    types,
                    added_to_target: state.sort_key_added_to_target,
                };
                self.sort_keys.insert(table.clone(), entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Mark the `_sort` column as present in the target and persist.
    pub async fn mark_sort_key_added(
        &mut self,
        context: &dyn TargetContext,
        table: &TableId,
    ) -> Result<(), ReplicationError> {
        let Some(entry) = self.sort_keys.get_mut(table) else {
            return Ok(());
        };
        if entry.added_to_target {
            return Ok(());
        }
        entry.added_to_target = true;
        let types = entry.types.clone();
        let primary_keys = self.primary_keys(context, table).await?;
        let mut state = TargetTableState::new(primary_keys, Some(types));
        state.sort_key_added_to_target = true;
        context
            .put_state(&table_state_key(&table.dataset, &table.table), state.encode())
            .await?;
        Ok(())
    }

    pub fn cache_schema(&mut self, table: &TableId, schema: TableSchema) {
        self.schemas.insert(table.clone(), schema);
    }

    pub fn schema(&self, table: &TableId) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Forget everything about one table.
    pub fn remove(&mut self, table: &TableId) {
        self.primary_keys.remove(table);
        self.sort_keys.remove(table);
        self.schemas.remove(table);
    }

    /// Drop all cached primary keys (database-level drop).
    pub fn clear_primary_keys(&mut self) {
        self.primary_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_keys() {
        assert_eq!(table_state_key("appdb", "users"), "bigquery-appdb-users");
        assert_eq!(
            direct_load_key("appdb", "users"),
            "bigquery-direct-load-in-progress-appdb-users"
        );
    }

    #[test]
    fn test_bool_encoding() {
        assert!(decode_bool(Some(&encode_bool(true))));
        assert!(!decode_bool(Some(&encode_bool(false))));
        assert!(!decode_bool(None));
        assert!(!decode_bool(Some(&[])));
    }

    #[test]
    fn test_table_state_roundtrip() {
        let state = TargetTableState::new(
            vec!["id".to_string(), "region".to_string()],
            Some(vec![ColumnType::Timestamp, ColumnType::Int64]),
        );
        let bytes = state.encode();
        let decoded = TargetTableState::decode("bigquery-db-t", &bytes).unwrap();
        assert_eq!(decoded, state);
        assert!(!decoded.sort_key_added_to_target);
    }

    #[test]
    fn test_table_state_without_sort_keys_decodes() {
        // State written before any sort key was seen omits the field.
        let decoded =
            TargetTableState::decode("k", br#"{"primary_keys":["id"]}"#).unwrap();
        assert_eq!(decoded.primary_keys, vec!["id"]);
        assert!(decoded.sort_keys.is_none());
    }

    #[test]
    fn test_table_state_garbage_is_an_error() {
        assert!(TargetTableState::decode("k", b"not json").is_err());
    }

    mod cache {
        use super::*;
        use crate::context::MemoryContext;
        use crate::event::SourceProperties;

        fn context() -> MemoryContext {
            MemoryContext::new("app", SourceProperties::default())
        }

        fn users() -> TableId {
            TableId::new("appdb", "users")
        }

        #[tokio::test]
        async fn test_empty_primary_key_is_fatal_and_mutates_nothing() {
            let context = context();
            let mut cache = TableCache::default();

            let err = cache
                .update_primary_keys(&context, &users(), vec![])
                .await
                .unwrap_err();
            assert!(err.is_fatal());
            assert!(context
                .get_state("bigquery-appdb-users")
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn test_primary_keys_persist_and_read_through() {
            let context = context();
            let mut cache = TableCache::default();
            cache
                .update_primary_keys(&context, &users(), vec!["id".to_string()])
                .await
                .unwrap();

            // A fresh cache (restart) reads the key back from the store.
            let mut fresh = TableCache::default();
            let keys = fresh.primary_keys(&context, &users()).await.unwrap();
            assert_eq!(keys, vec!["id"]);
        }

        #[tokio::test]
        async fn test_missing_primary_key_state_is_fatal() {
            let context = context();
            let mut cache = TableCache::default();
            let err = cache.primary_keys(&context, &users()).await.unwrap_err();
            assert!(err.is_fatal());
            assert!(err.to_string().contains("could not be found"));
        }

        #[tokio::test]
        async fn test_sort_keys_persist_with_added_flag() {
            let context = context();
            let mut cache = TableCache::default();
            cache
                .update_primary_keys(&context, &users(), vec!["id".to_string()])
                .await
                .unwrap();
            cache
                .store_sort_keys(&context, &users(), vec![ColumnType::Timestamp])
                .await
                .unwrap();
            cache.mark_sort_key_added(&context, &users()).await.unwrap();

            let mut fresh = TableCache::default();
            let entry = fresh.sort_keys(&context, &users()).await.unwrap().unwrap();
            assert_eq!(entry.types, vec![ColumnType::Timestamp]);
            assert!(entry.added_to_target);
        }

        #[tokio::test]
        async fn test_remove_forgets_table() {
            let context = context();
            let mut cache = TableCache::default();
            cache
                .update_primary_keys(&context, &users(), vec!["id".to_string()])
                .await
                .unwrap();
            cache.remove(&users());
            // The persisted state remains, so a read-through still works;
            // only the in-memory entry is gone.
            assert!(cache.schema(&users()).is_none());
            let keys = cache.primary_keys(&context, &users()).await.unwrap();
            assert_eq!(keys, vec!["id"]);
        }
    }
}
