use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;
use crate::types::{ColumnSchema, StagingRow, TableSchema};
use crate::warehouse::base::{MergeOutcome, SYNC_STATE_TABLE, Warehouse, staging_table_name};
use crate::warehouse::bigquery::client::BigQueryClient;

/// BigQuery-backed [`Warehouse`].
///
/// One dataset holds the target tables, the per-run `_stg__` staging tables
/// and the checkpoint table. The upsert is a single `MERGE` statement, so a
/// failure mid-merge leaves the target at its pre-merge state.
#[derive(Clone)]
pub struct BigQueryWarehouse {
    inner: Arc<Inner>,
}

struct Inner {
    client: BigQueryClient,
    dataset_id: String,
}

impl BigQueryWarehouse {
    /// Creates a warehouse from a service account key JSON string.
    pub async fn new_with_key(
        project_id: String,
        dataset_id: String,
        sa_key: &str,
    ) -> SyncResult<Self> {
        let client = BigQueryClient::new_with_key(project_id, sa_key).await?;

        Ok(Self {
            inner: Arc::new(Inner { client, dataset_id }),
        })
    }

    async fn ensure_state_table(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let query = format!(
            "create table if not exists `{}.{}.{}` (`table_name` STRING, `last_success` TIMESTAMP)",
            inner.client.project_id(),
            inner.dataset_id,
            SYNC_STATE_TABLE
        );
        let _ = inner.client.query(query).await?;

        Ok(())
    }
}

impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn table_schema(&self, table: &str) -> SyncResult<Option<TableSchema>> {
        let inner = &self.inner;
        let schema = inner.client.table_schema(&inner.dataset_id, table).await?;

        Ok(schema)
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> SyncResult<()> {
        let inner = &self.inner;
        inner
            .client
            .create_table_if_missing(&inner.dataset_id, table, schema)
            .await?;

        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[ColumnSchema]) -> SyncResult<()> {
        let inner = &self.inner;
        inner
            .client
            .add_columns(&inner.dataset_id, table, columns)
            .await
            .map_err(|error| {
                sync_error!(
                    ErrorKind::SchemaEvolutionFailed,
                    "Failed to extend the target schema",
                    format!("table {table}"),
                    source: error
                )
            })?;

        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> SyncResult<()> {
        let inner = &self.inner;
        inner
            .client
            .truncate_table(&inner.dataset_id, table)
            .await?;

        Ok(())
    }

    async fn load_staging(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: Vec<StagingRow>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let staging_table = staging_table_name(table);

        // Replace-then-insert gives the staging table write-truncate
        // semantics: each run starts from an empty staging set.
        inner
            .client
            .replace_table(&inner.dataset_id, &staging_table, schema)
            .await
            .map_err(|error| {
                sync_error!(
                    ErrorKind::StagingLoadFailed,
                    "Failed to reset the staging table",
                    format!("table {staging_table}"),
                    source: error
                )
            })?;

        inner
            .client
            .insert_rows(&inner.dataset_id, &staging_table, &rows)
            .await
            .map_err(|error| {
                sync_error!(
                    ErrorKind::StagingLoadFailed,
                    "Failed to load rows into the staging table",
                    format!("table {staging_table}, {} rows", rows.len()),
                    source: error
                )
            })?;

        Ok(())
    }

    async fn merge_staging(
        &self,
        table: &str,
        unique_key: &str,
        staging_schema: &TableSchema,
    ) -> SyncResult<MergeOutcome> {
        let inner = &self.inner;

        // Duplicate accounting first: the merge itself collapses staging
        // duplicates silently, the report must not.
        let counts_query = format!(
            "select count(*) as total, count(distinct `{key}`) as uniq \
             from `{project}.{dataset}.{staging}` where `{key}` is not null",
            key = unique_key,
            project = inner.client.project_id(),
            dataset = inner.dataset_id,
            staging = staging_table_name(table),
        );

        let (total, unique) = {
            let mut result_set = inner.client.query(counts_query).await?;
            if result_set.next_row() {
                (
                    result_set.get_i64_by_name("total")?.unwrap_or(0) as u64,
                    result_set.get_i64_by_name("uniq")?.unwrap_or(0) as u64,
                )
            } else {
                (0, 0)
            }
        };

        let merge_sql = build_merge_sql(
            inner.client.project_id(),
            &inner.dataset_id,
            table,
            unique_key,
            staging_schema,
        );

        let _ = inner.client.query(merge_sql).await.map_err(|error| {
            sync_error!(
                ErrorKind::MergeFailed,
                "Atomic upsert into the target table failed",
                format!("table {table}, key {unique_key}"),
                source: error
            )
        })?;

        Ok(MergeOutcome {
            rows_merged: unique,
            staging_duplicates: total - unique,
        })
    }

    async fn target_row_count(&self, table: &str) -> SyncResult<u64> {
        let inner = &self.inner;
        let count = inner.client.row_count(&inner.dataset_id, table).await?;

        Ok(count)
    }

    async fn read_checkpoint(&self, entity: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.ensure_state_table().await?;

        let inner = &self.inner;
        let query = format!(
            "select format_timestamp('%Y-%m-%dT%H:%M:%SZ', last_success) as last_success \
             from `{}.{}.{}` where table_name = '{}'",
            inner.client.project_id(),
            inner.dataset_id,
            SYNC_STATE_TABLE,
            entity.replace('\'', "''")
        );

        let mut result_set = inner.client.query(query).await?;
        if result_set.next_row() {
            let raw = result_set.get_string_by_name("last_success")?;
            return Ok(raw.as_deref().and_then(|value| {
                DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc))
            }));
        }

        Ok(None)
    }

    async fn write_checkpoint(&self, entity: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        self.ensure_state_table().await?;

        let inner = &self.inner;
        let query = format!(
            "merge `{project}.{dataset}.{state}` T \
             using (select '{entity}' as table_name, \
                    timestamp '{checkpoint}' as last_success) S \
             on T.table_name = S.table_name \
             when matched then update set last_success = S.last_success \
             when not matched then insert (table_name, last_success) \
             values (S.table_name, S.last_success)",
            project = inner.client.project_id(),
            dataset = inner.dataset_id,
            state = SYNC_STATE_TABLE,
            entity = entity.replace('\'', "''"),
            checkpoint = checkpoint.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let _ = inner.client.query(query).await?;

        Ok(())
    }
}

/// Builds the atomic `MERGE` statement for one entity.
///
/// The staging set is deduplicated inline with `ROW_NUMBER()` per unique
/// key, newest update timestamp first (the key column itself when no
/// timestamp column exists, which makes the ordering a no-op). Provenance
/// keys (leading underscore) may be null in historical target rows, so they
/// match with `IS NOT DISTINCT FROM` plus a null guard on the staging side.
fn build_merge_sql(
    project_id: &str,
    dataset_id: &str,
    table: &str,
    unique_key: &str,
    staging_schema: &TableSchema,
) -> String {
    let target = format!("`{project_id}.{dataset_id}.{table}`");
    let staging = format!(
        "`{project_id}.{dataset_id}.{}`",
        staging_table_name(table)
    );

    let order_column = staging_schema.timestamp_column().unwrap_or(unique_key);

    let match_condition = if unique_key.starts_with('_') {
        format!(
            "T.`{unique_key}` is not distinct from S.`{unique_key}` and S.`{unique_key}` is not null"
        )
    } else {
        format!("T.`{unique_key}` = S.`{unique_key}`")
    };

    let columns: Vec<&str> = staging_schema.column_names().collect();
    let non_key_columns: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|column| *column != unique_key)
        .collect();

    let mut sql = format!(
        "merge {target} T \
         using ( \
           select * except(rn) from ( \
             select *, row_number() over ( \
               partition by `{unique_key}` order by `{order_column}` desc \
             ) as rn \
             from {staging} \
             where `{unique_key}` is not null \
           ) where rn = 1 \
         ) S \
         on {match_condition}"
    );

    if !non_key_columns.is_empty() {
        let set_clause = non_key_columns
            .iter()
            .map(|column| format!("T.`{column}` = S.`{column}`"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" when matched then update set {set_clause}"));
    }

    let insert_columns = columns
        .iter()
        .map(|column| format!("`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_values = columns
        .iter()
        .map(|column| format!("S.`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(
        " when not matched then insert ({insert_columns}) values ({insert_values})"
    ));

    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    fn schema(columns: &[&str]) -> TableSchema {
        TableSchema::new(
            columns
                .iter()
                .map(|name| ColumnSchema::new(*name, ColumnType::String, true))
                .collect(),
        )
    }

    #[test]
    fn merge_sql_uses_equality_for_plain_keys() {
        let sql = build_merge_sql(
            "proj",
            "ds",
            "people",
            "id",
            &schema(&["id", "name", "updatedAt"]),
        );

        assert!(sql.contains("merge `proj.ds.people` T"));
        assert!(sql.contains("from `proj.ds._stg__people`"));
        assert!(sql.contains("on T.`id` = S.`id`"));
        assert!(sql.contains("partition by `id` order by `updatedAt` desc"));
        assert!(sql.contains("when matched then update set T.`name` = S.`name`, T.`updatedAt` = S.`updatedAt`"));
        assert!(sql.contains("when not matched then insert (`id`, `name`, `updatedAt`)"));
    }

    #[test]
    fn merge_sql_uses_null_safe_match_for_provenance_keys() {
        let sql = build_merge_sql(
            "proj",
            "ds",
            "time_entries",
            "_tracker_id",
            &schema(&["id", "_tracker_id", "updatedAt"]),
        );

        assert!(sql.contains(
            "on T.`_tracker_id` is not distinct from S.`_tracker_id` \
             and S.`_tracker_id` is not null"
        ));
    }

    #[test]
    fn merge_sql_falls_back_to_key_ordering_without_timestamp() {
        let sql = build_merge_sql("proj", "ds", "tags", "id", &schema(&["id", "name"]));
        assert!(sql.contains("partition by `id` order by `id` desc"));
    }

    #[test]
    fn merge_sql_omits_update_clause_for_key_only_schema() {
        let sql = build_merge_sql("proj", "ds", "ids", "id", &schema(&["id"]));
        assert!(!sql.contains("when matched"));
        assert!(sql.contains("when not matched then insert (`id`) values (S.`id`)"));
    }
}
