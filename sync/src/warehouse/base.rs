use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::types::{ColumnSchema, StagingRow, TableSchema};

/// Name of the warehouse table tracking per-entity sync checkpoints.
pub const SYNC_STATE_TABLE: &str = "__sync_state";

/// Returns the staging table name for an entity's target table.
pub fn staging_table_name(table: &str) -> String {
    format!("_stg__{table}")
}

/// Counts produced by an atomic staged merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    /// Rows inserted or updated in the target.
    pub rows_merged: u64,
    /// Staging rows dropped by the per-key dedup inside the merge.
    pub staging_duplicates: u64,
}

/// A warehouse that sync entities are merged into.
///
/// Implementations provide a per-entity target table, a run-scoped staging
/// table, additive-only schema evolution and an atomic keyed upsert. The
/// merge must be idempotent: re-running the identical staging set against an
/// already-merged target produces no net change.
///
/// Failure contract: [`Warehouse::add_columns`] and
/// [`Warehouse::load_staging`] failures must leave the target table
/// untouched, and [`Warehouse::merge_staging`] is a single atomic operation;
/// a failure mid-merge leaves the target at its pre-merge state.
pub trait Warehouse: Send + Sync {
    /// Returns the name of the warehouse.
    fn name(&self) -> &'static str;

    /// The target table's schema, or `None` when the table does not exist.
    fn table_schema(
        &self,
        table: &str,
    ) -> impl Future<Output = SyncResult<Option<TableSchema>>> + Send;

    /// Creates the target table with the given schema.
    fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Adds nullable columns to the target table.
    ///
    /// Additive only: existing columns are never dropped or retyped.
    fn add_columns(
        &self,
        table: &str,
        columns: &[ColumnSchema],
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Removes all rows from the target table.
    ///
    /// Called for full reloads; must tolerate the table not existing yet.
    fn truncate_table(&self, table: &str) -> impl Future<Output = SyncResult<()>> + Send;

    /// Replaces the entity's staging table contents with `rows`.
    fn load_staging(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: Vec<StagingRow>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Atomically upserts the staged rows into the target table.
    ///
    /// The staging set is first deduplicated per `unique_key`, keeping the
    /// row with the latest update timestamp (load order when no timestamp
    /// column exists). Staging rows whose key is null are skipped. Matching
    /// target rows are updated in place, the rest are inserted.
    fn merge_staging(
        &self,
        table: &str,
        unique_key: &str,
        staging_schema: &TableSchema,
    ) -> impl Future<Output = SyncResult<MergeOutcome>> + Send;

    /// Number of rows currently in the target table (0 when absent).
    fn target_row_count(&self, table: &str) -> impl Future<Output = SyncResult<u64>> + Send;

    /// Reads the entity's incremental checkpoint, if one was recorded.
    fn read_checkpoint(
        &self,
        entity: &str,
    ) -> impl Future<Output = SyncResult<Option<DateTime<Utc>>>> + Send;

    /// Records the entity's incremental checkpoint.
    fn write_checkpoint(
        &self,
        entity: &str,
        checkpoint: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
