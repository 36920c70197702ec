//! The stage-and-merge writer.
//!
//! Sequences one entity's warehouse write: optional full-reload truncate,
//! additive schema evolution, staging load, and the atomic keyed upsert.
//! Failures before the merge leave the target table untouched; the merge
//! itself is a single atomic operation of the [`Warehouse`].

use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{MergeReport, StagingRow, TableSchema};
use crate::warehouse::Warehouse;

/// Options controlling one entity's merge.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Discard all existing target rows before loading.
    pub full_reload: bool,
    /// Column the upsert is keyed on.
    ///
    /// Defaults to `id`. Must be overridden to a provenance column when the
    /// primary identifier is derived rather than source-assigned, otherwise
    /// re-derived identifiers insert duplicates instead of updating.
    pub unique_key_column: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            full_reload: false,
            unique_key_column: "id".to_string(),
        }
    }
}

/// Writes transformed rows into a [`Warehouse`] through its staging area.
pub struct StageMergeWriter<'a, W> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse> StageMergeWriter<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    /// Stages and merges `rows` into the entity's target table.
    ///
    /// Steps, in order: full-reload truncate when requested, additive schema
    /// evolution for columns the target has not seen, staging load, staged
    /// per-key dedup and atomic upsert. Returns the merge accounting.
    pub async fn write(
        &self,
        entity: &str,
        rows: Vec<StagingRow>,
        options: &MergeOptions,
    ) -> SyncResult<MergeReport> {
        if options.full_reload {
            info!(entity, "full reload: truncating target table");
            self.warehouse.truncate_table(entity).await?;
        }

        if rows.is_empty() {
            debug!(entity, "no rows to merge");
            return Ok(MergeReport::default());
        }

        let staging_schema = TableSchema::infer(&rows);
        if !staging_schema.has_column(&options.unique_key_column) {
            bail!(
                ErrorKind::InvalidData,
                "Unique key column missing from staged rows",
                format!("entity {entity}, key {}", options.unique_key_column)
            );
        }

        match self.warehouse.table_schema(entity).await? {
            None => {
                self.warehouse.create_table(entity, &staging_schema).await?;
            }
            Some(target_schema) => {
                let new_columns = staging_schema.columns_missing_from(&target_schema);
                if !new_columns.is_empty() {
                    info!(
                        entity,
                        columns = ?new_columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                        "extending target schema with new nullable columns"
                    );
                    self.warehouse.add_columns(entity, &new_columns).await?;
                }
            }
        }

        self.warehouse
            .load_staging(entity, &staging_schema, rows)
            .await?;

        let outcome = self
            .warehouse
            .merge_staging(entity, &options.unique_key_column, &staging_schema)
            .await?;

        info!(
            entity,
            warehouse = self.warehouse.name(),
            rows_merged = outcome.rows_merged,
            staging_duplicates = outcome.staging_duplicates,
            "merge complete"
        );

        Ok(MergeReport {
            rows_merged: outcome.rows_merged,
            staging_duplicates: outcome.staging_duplicates,
        })
    }
}
