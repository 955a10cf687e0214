//! Merge query generation and execution.
//!
//! A staged batch is reconciled into the target table by a single MERGE
//! statement built from two pieces:
//!
//! - a *diff* subquery that self-joins the staging table and keeps only
//!   the last surviving event per logical row within the batch, and
//! - the MERGE skeleton whose matched/not-matched branches depend on how
//!   rows are identified (source row id vs primary key before-images) and
//!   on whether the source delivers events in order.
//!
//! Both queries filter staging rows to `_sequence_num >` the highest
//! sequence number already merged into the target. Replayed batches can
//! contain events that were merged before a crash; the filter makes
//! re-running the merge a no-op for them.

use std::time::Instant;
use tracing::info;

use floe_core::emit;

use crate::event::SourceOrdering;
use crate::load::previous_job_if_not_failed;
use crate::metrics::events::MergeCompleted;
use crate::schema::{
    sort_keys_column, ColumnSchema, ColumnType, TableSchema, BEFORE_PREFIX, IS_DELETED, ROW_ID,
    SEQUENCE_NUM, SORT_KEYS, SORT_KEY_FIELD, SOURCE_TIMESTAMP,
};
use crate::warehouse::{job_id, JobKind, TableId, Warehouse, WarehouseError};
use crate::writer::TableBlob;

/// How deletes are applied to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the row.
    Hard,
    /// Keep the row, set `_is_deleted`. Always used for unordered
    /// sources regardless of configuration.
    Soft,
}

fn backticked(table: &TableId) -> String {
    format!("`{}.{}`", table.dataset, table.table)
}

/// Condition asserting that the `left` row happened before the `right`
/// row, for unordered sources. Starts with ` AND `.
///
/// When sort keys are known, rows with sort keys on both sides compare
/// lexicographically over the `_sort` struct; rows missing a sort key
/// (written before the sort key upgrade) fall back to
/// `(_source_timestamp, _sequence_num)`. Without sort keys only the
/// fallback comparison applies.
fn ordering_condition(sort_keys: Option<&[ColumnType]>, left: &str, right: &str) -> String {
    let timestamp_fallback = format!(
        "({left}.{ts} < {right}.{ts} OR ({left}.{ts} = {right}.{ts} AND {left}.{seq} < {right}.{seq}))",
        ts = SOURCE_TIMESTAMP,
        seq = SEQUENCE_NUM,
    );

    let Some(sort_keys) = sort_keys.filter(|keys| !keys.is_empty()) else {
        return format!(" AND {timestamp_fallback}");
    };

    let key = |i: usize| format!("{SORT_KEYS}.{SORT_KEY_FIELD}_{i}");

    // (A._sort._key_0 < B._sort._key_0)
    //   OR (A._sort._key_0 = B._sort._key_0 AND A._sort._key_1 < B._sort._key_1)
    //   OR ...
    let mut comparisons = Vec::with_capacity(sort_keys.len());
    let mut equal_prefix = String::new();
    for i in 0..sort_keys.len() {
        comparisons.push(format!(
            "({equal_prefix}{left}.{k} < {right}.{k})",
            k = key(i)
        ));
        equal_prefix.push_str(&format!("{left}.{k} = {right}.{k} AND ", k = key(i)));
    }
    let sort_comparison = comparisons.join(" OR ");

    format!(
        " AND (({left}.{k0} IS NOT NULL AND {right}.{k0} IS NOT NULL AND ({sort_comparison})) \
         OR (({left}.{k0} IS NULL OR {right}.{k0} IS NULL) AND {timestamp_fallback}))",
        k0 = key(0),
    )
}

/// Build the diff subquery reducing one staged batch to the single latest
/// surviving event per logical row.
pub fn diff_query(
    staging_table: &TableId,
    primary_keys: &[String],
    batch_id: i64,
    latest_merged: i64,
    row_id_supported: bool,
    ordering: SourceOrdering,
    sort_keys: Option<&[ColumnType]>,
) -> String {
    let (mut join_condition, where_clause) = if row_id_supported {
        (
            format!("A.{ROW_ID} = B.{ROW_ID}"),
            format!("B.{ROW_ID} IS NULL"),
        )
    } else {
        let join = primary_keys
            .iter()
            .map(|key| format!("A.`{key}` = B.`{BEFORE_PREFIX}{key}`"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let filter = primary_keys
            .iter()
            .map(|key| format!("B.`{BEFORE_PREFIX}{key}` IS NULL"))
            .collect::<Vec<_>>()
            .join(" AND ");
        (join, filter)
    };

    match ordering {
        SourceOrdering::Ordered => {
            join_condition.push_str(&format!(" AND A.{SEQUENCE_NUM} < B.{SEQUENCE_NUM}"));
        }
        SourceOrdering::Unordered => {
            join_condition.push_str(&ordering_condition(sort_keys, "A", "B"));
        }
    }

    let staged = format!(
        "SELECT * FROM {} WHERE {BATCH} = {batch_id} AND {SEQUENCE_NUM} > {latest_merged}",
        backticked(staging_table),
        BATCH = crate::schema::BATCH_ID,
    );

    format!(
        "SELECT A.* FROM\n({staged}) AS A\nLEFT OUTER JOIN\n({staged}) AS B\nON {join_condition}\nWHERE {where_clause}"
    )
}

/// Columns of the target schema that participate in UPDATE set-lists and
/// INSERT column-lists. `_is_deleted` is always set explicitly; `_row_id`,
/// `_source_timestamp` and `_sort` exist in the target for every table but
/// are only present in staged rows for the modes that use them.
fn merge_columns<'a>(
    target_schema: &'a TableSchema,
    row_id_supported: bool,
    ordering: SourceOrdering,
) -> impl Iterator<Item = &'a ColumnSchema> {
    target_schema.fields.iter().filter(move |field| {
        if field.name == IS_DELETED {
            return false;
        }
        if field.name == SOURCE_TIMESTAMP || field.name == SORT_KEYS {
            return ordering == SourceOrdering::Unordered;
        }
        if field.name == ROW_ID {
            return row_id_supported;
        }
        true
    })
}

/// Build the MERGE statement applying a diff of staged events to the
/// target table.
#[allow(clippy::too_many_arguments)]
pub fn merge_query(
    target_table: &TableId,
    primary_keys: &[String],
    target_schema: &TableSchema,
    diff: &str,
    row_id_supported: bool,
    ordering: SourceOrdering,
    delete_mode: DeleteMode,
    sort_keys: Option<&[ColumnType]>,
) -> String {
    let merge_condition = if row_id_supported {
        format!("T.{ROW_ID} = D.{ROW_ID}")
    } else {
        primary_keys
            .iter()
            .map(|key| format!("T.`{key}` = D.`{BEFORE_PREFIX}{key}`"))
            .collect::<Vec<_>>()
            .join(" AND ")
    };

    let set_list = merge_columns(target_schema, row_id_supported, ordering)
        .map(|field| format!("`{0}` = D.`{0}`", field.name))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = merge_columns(target_schema, row_id_supported, ordering)
        .map(|field| format!("`{}`", field.name))
        .collect::<Vec<_>>()
        .join(", ");

    let (delete_operation, matched_condition) = match ordering {
        SourceOrdering::Ordered => match delete_mode {
            DeleteMode::Hard => ("DELETE".to_string(), String::new()),
            DeleteMode::Soft => (
                format!("UPDATE SET {IS_DELETED} = true"),
                format!(" AND {IS_DELETED} IS NOT TRUE"),
            ),
        },
        // Unordered sources always tombstone: hard-deleting the row would
        // let a late-arriving older update resurrect it.
        SourceOrdering::Unordered => (
            format!("UPDATE SET {set_list}, {IS_DELETED} = true"),
            ordering_condition(sort_keys, "T", "D"),
        ),
    };

    let mut query = format!(
        "MERGE {target} AS T\n\
         USING ({diff}) AS D\n\
         ON {merge_condition}\n\
         WHEN MATCHED AND D._op = \"DELETE\"{matched_condition} THEN\n\
         {delete_operation}\n\
         WHEN MATCHED AND D._op IN (\"INSERT\", \"UPDATE\"){matched_condition} THEN\n\
         UPDATE SET {set_list}, {IS_DELETED} = null\n\
         WHEN NOT MATCHED AND D._op IN (\"INSERT\", \"UPDATE\") THEN\n\
         INSERT ({column_list}) VALUES ({column_list})",
        target = backticked(target_table),
    );

    // A delete that matched nothing within the batch still leaves a
    // tombstone, so an older update arriving in a later batch cannot
    // bring the row back as live.
    if ordering == SourceOrdering::Unordered {
        query.push_str(&format!(
            "\nWHEN NOT MATCHED AND D._op = \"DELETE\" THEN\n\
             INSERT ({column_list}, {IS_DELETED}) VALUES ({column_list}, true)"
        ));
    }

    query
}

/// Resolve the effective delete mode: `soft_deletes` only applies to
/// ordered sources; unordered sources always delete softly.
pub fn delete_mode(soft_deletes: bool, ordering: SourceOrdering) -> DeleteMode {
    match ordering {
        SourceOrdering::Unordered => DeleteMode::Soft,
        SourceOrdering::Ordered if soft_deletes => DeleteMode::Soft,
        SourceOrdering::Ordered => DeleteMode::Hard,
    }
}

/// Merge one staged batch into the target table.
///
/// Job ids are deterministic per `(table, batch, attempt)`; a retry first
/// looks for a job from an earlier attempt and reuses it when it did not
/// fail. Before the first merge of an upgraded unordered table, the
/// `_sort` column is added to the target so the generated query can
/// reference it.
#[allow(clippy::too_many_arguments)]
pub async fn run_merge(
    warehouse: &dyn Warehouse,
    app: &str,
    blob: &TableBlob,
    staging_table: &TableId,
    primary_keys: &[String],
    latest_merged: i64,
    row_id_supported: bool,
    ordering: SourceOrdering,
    delete: DeleteMode,
    sort_keys: Option<&[ColumnType]>,
    sort_key_in_target: bool,
    attempt: u32,
) -> Result<(), WarehouseError> {
    info!(
        batch_id = blob.batch_id,
        table = %blob.table,
        attempt,
        "Merging staged batch into target"
    );
    let started = Instant::now();

    if let Some(types) = sort_keys {
        if !types.is_empty() && !sort_key_in_target {
            warehouse
                .ensure_column(&blob.table, &sort_keys_column(types))
                .await?;
        }
    }

    let reused = if attempt > 0 {
        previous_job_if_not_failed(warehouse, app, JobKind::Merge, &blob.table, blob.batch_id, attempt)
            .await?
    } else {
        None
    };

    let id = match reused {
        Some(id) => {
            info!(job_id = %id, "Reusing merge job from a previous attempt");
            id
        }
        None => {
            let diff = diff_query(
                staging_table,
                primary_keys,
                blob.batch_id,
                latest_merged,
                row_id_supported,
                ordering,
                sort_keys,
            );
            let sql = merge_query(
                &blob.table,
                primary_keys,
                &blob.target_schema,
                &diff,
                row_id_supported,
                ordering,
                delete,
                sort_keys,
            );
            let id = job_id(app, JobKind::Merge, &blob.table, blob.batch_id, attempt);
            warehouse.submit_query_job(&id, &sql).await?;
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

    emit!(MergeCompleted {
        table: blob.table.to_string(),
        duration: started.elapsed(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{target_schema, ColumnSchema};

    fn users_source() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::required("id", ColumnType::Int64),
            ColumnSchema::nullable("name", ColumnType::String),
        ])
    }

    fn staging() -> TableId {
        TableId::new("appdb", "_staging_users")
    }

    fn target() -> TableId {
        TableId::new("appdb", "users")
    }

    fn keys() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_diff_query_ordered_without_row_id() {
        let sql = diff_query(
            &staging(),
            &keys(),
            1234567890,
            5,
            false,
            SourceOrdering::Ordered,
            None,
        );

        assert!(sql.contains(
            "SELECT * FROM `appdb._staging_users` WHERE _batch_id = 1234567890 AND _sequence_num > 5"
        ));
        assert!(sql.contains("ON A.`id` = B.`_before_id` AND A._sequence_num < B._sequence_num"));
        assert!(sql.contains("WHERE B.`_before_id` IS NULL"));
        assert!(sql.contains("LEFT OUTER JOIN"));
    }

    #[test]
    fn test_diff_query_ordered_with_row_id() {
        let sql = diff_query(
            &staging(),
            &keys(),
            42,
            0,
            true,
            SourceOrdering::Ordered,
            None,
        );

        assert!(sql.contains("ON A._row_id = B._row_id AND A._sequence_num < B._sequence_num"));
        assert!(sql.contains("WHERE B._row_id IS NULL"));
        assert!(!sql.contains("_before_"));
    }

    #[test]
    fn test_diff_query_composite_primary_key() {
        let keys = vec!["id".to_string(), "region".to_string()];
        let sql = diff_query(&staging(), &keys, 42, 0, false, SourceOrdering::Ordered, None);

        assert!(sql.contains("A.`id` = B.`_before_id` AND A.`region` = B.`_before_region`"));
        assert!(sql.contains("B.`_before_id` IS NULL AND B.`_before_region` IS NULL"));
    }

    #[test]
    fn test_diff_query_unordered_with_sort_keys() {
        let sort = vec![ColumnType::Timestamp, ColumnType::Int64];
        let sql = diff_query(
            &staging(),
            &keys(),
            42,
            0,
            true,
            SourceOrdering::Unordered,
            Some(&sort),
        );

        // lexicographic comparison over the sort struct
        assert!(sql.contains("(A._sort._key_0 < B._sort._key_0)"));
        assert!(sql
            .contains("(A._sort._key_0 = B._sort._key_0 AND A._sort._key_1 < B._sort._key_1)"));
        // null guard on the first key
        assert!(sql.contains("A._sort._key_0 IS NOT NULL AND B._sort._key_0 IS NOT NULL"));
        // fallback for rows written before the sort key upgrade
        assert!(sql.contains("(A._sort._key_0 IS NULL OR B._sort._key_0 IS NULL)"));
        assert!(sql.contains(
            "(A._source_timestamp < B._source_timestamp OR (A._source_timestamp = B._source_timestamp AND A._sequence_num < B._sequence_num))"
        ));
        // ordered comparison must not appear on its own
        assert!(!sql.contains("AND A._sequence_num < B._sequence_num\nWHERE"));
    }

    #[test]
    fn test_diff_query_unordered_without_sort_keys_uses_fallback_only() {
        let sql = diff_query(
            &staging(),
            &keys(),
            42,
            0,
            false,
            SourceOrdering::Unordered,
            None,
        );
        assert!(!sql.contains("_sort."));
        assert!(sql.contains(
            "A._source_timestamp < B._source_timestamp OR (A._source_timestamp = B._source_timestamp AND A._sequence_num < B._sequence_num)"
        ));
    }

    #[test]
    fn test_merge_query_ordered_hard_delete() {
        let schema = target_schema(&users_source(), SourceOrdering::Ordered, None);
        let sql = merge_query(
            &target(),
            &keys(),
            &schema,
            "DIFF",
            false,
            SourceOrdering::Ordered,
            DeleteMode::Hard,
            None,
        );

        assert!(sql.starts_with("MERGE `appdb.users` AS T\nUSING (DIFF) AS D\nON T.`id` = D.`_before_id`"));
        assert!(sql.contains("WHEN MATCHED AND D._op = \"DELETE\" THEN\nDELETE"));
        // set list excludes _is_deleted (set explicitly), _row_id, _source_timestamp
        assert!(sql.contains(
            "UPDATE SET `_sequence_num` = D.`_sequence_num`, `id` = D.`id`, `name` = D.`name`, _is_deleted = null"
        ));
        assert!(sql.contains(
            "WHEN NOT MATCHED AND D._op IN (\"INSERT\", \"UPDATE\") THEN\nINSERT (`_sequence_num`, `id`, `name`) VALUES (`_sequence_num`, `id`, `name`)"
        ));
        // hard delete mode has no tombstone insert branch
        assert!(!sql.contains("WHEN NOT MATCHED AND D._op = \"DELETE\""));
    }

    #[test]
    fn test_merge_query_ordered_soft_delete() {
        let schema = target_schema(&users_source(), SourceOrdering::Ordered, None);
        let sql = merge_query(
            &target(),
            &keys(),
            &schema,
            "DIFF",
            false,
            SourceOrdering::Ordered,
            DeleteMode::Soft,
            None,
        );

        assert!(sql.contains(
            "WHEN MATCHED AND D._op = \"DELETE\" AND _is_deleted IS NOT TRUE THEN\nUPDATE SET _is_deleted = true"
        ));
        assert!(sql.contains(
            "WHEN MATCHED AND D._op IN (\"INSERT\", \"UPDATE\") AND _is_deleted IS NOT TRUE THEN"
        ));
        // reinsert of a soft-deleted row clears the tombstone
        assert!(sql.contains("_is_deleted = null"));
    }

    #[test]
    fn test_merge_query_unordered_with_row_id() {
        let sort = vec![ColumnType::Int64];
        let schema = target_schema(&users_source(), SourceOrdering::Unordered, Some(&sort));
        let sql = merge_query(
            &target(),
            &keys(),
            &schema,
            "DIFF",
            true,
            SourceOrdering::Unordered,
            DeleteMode::Soft,
            Some(&sort),
        );

        assert!(sql.contains("ON T._row_id = D._row_id"));
        // delete updates the full row and sets the tombstone
        assert!(sql.contains("WHEN MATCHED AND D._op = \"DELETE\" AND ((T._sort._key_0 IS NOT NULL"));
        assert!(sql.contains("_is_deleted = true"));
        // row id and unordered bookkeeping participate in the column lists
        assert!(sql.contains("`_row_id`"));
        assert!(sql.contains("`_source_timestamp`"));
        assert!(sql.contains("`_sort`"));
        // terminal tombstone-insert branch
        assert!(sql.contains(
            "WHEN NOT MATCHED AND D._op = \"DELETE\" THEN\nINSERT (`_sequence_num`, `_row_id`, `_source_timestamp`, `_sort`, `id`, `name`, _is_deleted) VALUES (`_sequence_num`, `_row_id`, `_source_timestamp`, `_sort`, `id`, `name`, true)"
        ));
    }

    #[test]
    fn test_merge_query_excludes_row_id_without_support() {
        let schema = target_schema(&users_source(), SourceOrdering::Ordered, None);
        let sql = merge_query(
            &target(),
            &keys(),
            &schema,
            "DIFF",
            false,
            SourceOrdering::Ordered,
            DeleteMode::Hard,
            None,
        );
        assert!(!sql.contains("`_row_id`"));
        assert!(!sql.contains("`_source_timestamp`"));
    }

    #[test]
    fn test_delete_mode_resolution() {
        assert_eq!(delete_mode(false, SourceOrdering::Ordered), DeleteMode::Hard);
        assert_eq!(delete_mode(true, SourceOrdering::Ordered), DeleteMode::Soft);
        // soft-delete config is a no-op for unordered sources
        assert_eq!(delete_mode(false, SourceOrdering::Unordered), DeleteMode::Soft);
        assert_eq!(delete_mode(true, SourceOrdering::Unordered), DeleteMode::Soft);
    }

    /// Insert, key-chasing updates, then a delete within one batch must
    /// reduce to the delete alone: every intermediate row pairs with the
    /// event that superseded it, and only the delete has no successor.
    #[test]
    fn test_diff_and_merge_for_insert_update_delete_chain() {
        let diff = diff_query(
            &staging(),
            &keys(),
            1234567890,
            1,
            false,
            SourceOrdering::Ordered,
            None,
        );
        let schema = target_schema(&users_source(), SourceOrdering::Ordered, None);
        let sql = merge_query(
            &target(),
            &keys(),
            &schema,
            &diff,
            false,
            SourceOrdering::Ordered,
            DeleteMode::Hard,
            None,
        );

        // the idempotence filter appears in both arms of the self-join
        assert_eq!(sql.matches("_sequence_num > 1").count(), 2);
        // and the merge applies deletes as hard deletes
        assert!(sql.contains("THEN\nDELETE"));
    }
}
