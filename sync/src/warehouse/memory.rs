use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{ColumnSchema, StagingRow, TableSchema};
use crate::warehouse::base::{MergeOutcome, Warehouse};

#[derive(Debug, Default)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<StagingRow>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MemTable>,
    staging: HashMap<String, Vec<StagingRow>>,
    checkpoints: HashMap<String, DateTime<Utc>>,
}

/// In-memory warehouse for tests and local development.
///
/// Implements the same merge semantics as the real warehouse (per-key
/// staging dedup, update-on-match, insert-on-miss, additive schema
/// evolution) against plain vectors, so pipeline behavior can be asserted
/// without network access. All data is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a target table's rows, for assertions.
    pub async fn table_rows(&self, table: &str) -> Vec<StagingRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Returns a copy of a target table's schema, for assertions.
    pub async fn schema_of(&self, table: &str) -> Option<TableSchema> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|t| t.schema.clone())
    }
}

impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn table_schema(&self, table: &str) -> SyncResult<Option<TableSchema>> {
        let inner = self.inner.lock().await;
        Ok(inner.tables.get(table).map(|t| t.schema.clone()))
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.tables.entry(table.to_string()).or_insert(MemTable {
            schema: schema.clone(),
            rows: Vec::new(),
        });

        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[ColumnSchema]) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(mem_table) = inner.tables.get_mut(table) else {
            bail!(
                ErrorKind::SchemaEvolutionFailed,
                "Cannot add columns to a missing table",
                table.to_string()
            );
        };

        mem_table.schema.extend(columns.to_vec());

        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mem_table) = inner.tables.get_mut(table) {
            info!("truncating table {}", table);
            mem_table.rows.clear();
        }

        Ok(())
    }

    async fn load_staging(
        &self,
        table: &str,
        _schema: &TableSchema,
        rows: Vec<StagingRow>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        // Staging load truncates the previous run's staging contents.
        inner.staging.insert(table.to_string(), rows);

        Ok(())
    }

    async fn merge_staging(
        &self,
        table: &str,
        unique_key: &str,
        _staging_schema: &TableSchema,
    ) -> SyncResult<MergeOutcome> {
        let mut inner = self.inner.lock().await;

        let Some(staged) = inner.staging.remove(table) else {
            bail!(
                ErrorKind::InvalidState,
                "Merge requested without a staging load",
                table.to_string()
            );
        };

        // Per-key dedup of the staging set: latest update timestamp wins,
        // load order breaks ties and covers untimestamped rows. Null keys
        // are skipped entirely.
        let mut order: Vec<String> = Vec::new();
        let mut deduped: HashMap<String, StagingRow> = HashMap::new();
        let mut eligible: u64 = 0;

        for row in staged {
            let Some(key) = canonical_key(row.get(unique_key)) else {
                continue;
            };
            eligible += 1;

            match deduped.entry(key) {
                Entry::Vacant(slot) => {
                    order.push(slot.key().clone());
                    slot.insert(row);
                }
                Entry::Occupied(mut slot) => {
                    if replaces_row(slot.get(), &row) {
                        slot.insert(row);
                    }
                }
            }
        }

        let staging_duplicates = eligible - order.len() as u64;

        let Some(mem_table) = inner.tables.get_mut(table) else {
            bail!(
                ErrorKind::MergeFailed,
                "Merge target table does not exist",
                table.to_string()
            );
        };

        // The whole upsert happens under one lock, mirroring the atomicity
        // of a single MERGE statement.
        let mut rows_merged: u64 = 0;
        for key in &order {
            let staged_row = deduped.remove(key).expect("key collected above");
            rows_merged += 1;

            let position = mem_table
                .rows
                .iter()
                .position(|row| canonical_key(row.get(unique_key)).as_ref() == Some(key));

            match position {
                Some(index) => {
                    // Update in place: staging columns overwrite, other
                    // target columns are left alone.
                    let target_row = &mut mem_table.rows[index];
                    for (column, value) in staged_row.into_map() {
                        target_row.set(column, value);
                    }
                }
                None => mem_table.rows.push(staged_row),
            }
        }

        Ok(MergeOutcome {
            rows_merged,
            staging_duplicates,
        })
    }

    async fn target_row_count(&self, table: &str) -> SyncResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .unwrap_or(0))
    }

    async fn read_checkpoint(&self, entity: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner.checkpoints.get(entity).copied())
    }

    async fn write_checkpoint(&self, entity: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.insert(entity.to_string(), checkpoint);

        Ok(())
    }
}

/// Canonical string form of a merge key value; `None` for null or missing.
fn canonical_key(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => serde_json::to_string(other).ok(),
    }
}

/// Whether `incoming` should replace `kept` during staging dedup.
fn replaces_row(kept: &StagingRow, incoming: &StagingRow) -> bool {
    match (kept.updated_at(), incoming.updated_at()) {
        (Some(kept_ts), Some(incoming_ts)) => incoming_ts >= kept_ts,
        (None, None) => true,
        (None, Some(_)) => true,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> StagingRow {
        match value {
            Value::Object(map) => StagingRow::from(map),
            _ => panic!("expected object"),
        }
    }

    async fn load_and_merge(
        warehouse: &MemoryWarehouse,
        table: &str,
        rows: Vec<StagingRow>,
        unique_key: &str,
    ) -> MergeOutcome {
        let schema = TableSchema::infer(&rows);
        if warehouse.table_schema(table).await.unwrap().is_none() {
            warehouse.create_table(table, &schema).await.unwrap();
        }
        warehouse
            .load_staging(table, &schema, rows)
            .await
            .unwrap();
        warehouse
            .merge_staging(table, unique_key, &schema)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn merge_inserts_then_updates() {
        let warehouse = MemoryWarehouse::new();

        let outcome = load_and_merge(
            &warehouse,
            "people",
            vec![row(json!({"id": "a", "name": "Ada"}))],
            "id",
        )
        .await;
        assert_eq!(outcome.rows_merged, 1);
        assert_eq!(warehouse.target_row_count("people").await.unwrap(), 1);

        let outcome = load_and_merge(
            &warehouse,
            "people",
            vec![row(json!({"id": "a", "name": "Ada Lovelace"}))],
            "id",
        )
        .await;
        assert_eq!(outcome.rows_merged, 1);
        assert_eq!(warehouse.target_row_count("people").await.unwrap(), 1);

        let rows = warehouse.table_rows("people").await;
        assert_eq!(rows[0].get("name"), Some(&json!("Ada Lovelace")));
    }

    #[tokio::test]
    async fn staging_dedup_keeps_latest_updated_at() {
        let warehouse = MemoryWarehouse::new();

        let outcome = load_and_merge(
            &warehouse,
            "people",
            vec![
                row(json!({"id": "a", "name": "old", "updatedAt": "2024-03-01T00:00:00Z"})),
                row(json!({"id": "a", "name": "new", "updatedAt": "2024-03-02T00:00:00Z"})),
            ],
            "id",
        )
        .await;

        assert_eq!(outcome.rows_merged, 1);
        assert_eq!(outcome.staging_duplicates, 1);
        let rows = warehouse.table_rows("people").await;
        assert_eq!(rows[0].get("name"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn null_keys_are_skipped() {
        let warehouse = MemoryWarehouse::new();

        let outcome = load_and_merge(
            &warehouse,
            "entries",
            vec![
                row(json!({"_tracker_id": "x", "v": 1})),
                row(json!({"_tracker_id": null, "v": 2})),
            ],
            "_tracker_id",
        )
        .await;

        assert_eq!(outcome.rows_merged, 1);
        assert_eq!(outcome.staging_duplicates, 0);
        assert_eq!(warehouse.target_row_count("entries").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn truncate_tolerates_missing_table() {
        let warehouse = MemoryWarehouse::new();
        warehouse.truncate_table("nope").await.unwrap();
    }

    #[tokio::test]
    async fn checkpoints_round_trip() {
        let warehouse = MemoryWarehouse::new();
        assert_eq!(warehouse.read_checkpoint("people").await.unwrap(), None);

        let ts = Utc::now();
        warehouse.write_checkpoint("people", ts).await.unwrap();
        assert_eq!(warehouse.read_checkpoint("people").await.unwrap(), Some(ts));
    }
}
