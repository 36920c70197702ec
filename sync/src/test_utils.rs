//! Test support: scripted sources and fault-injecting warehouse wrappers.
//!
//! Used by this crate's unit and integration tests; kept compiled so
//! downstream crates can drive pipelines against deterministic fixtures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::fetch::{PageRequest, PageResponse, PagedSource};
use crate::sync_error;
use crate::types::{ColumnSchema, StagingRow, TableSchema};
use crate::warehouse::{MemoryWarehouse, MergeOutcome, Warehouse};

/// A [`PagedSource`] that replays a scripted sequence of page results.
///
/// Results are consumed in call order; once the script is exhausted every
/// further call returns an empty page. Drive it with page concurrency 1 so
/// the call order is deterministic.
pub struct ScriptedSource {
    script: std::sync::Mutex<Vec<SyncResult<PageResponse>>>,
    calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(script: Vec<SyncResult<PageResponse>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script),
            calls: AtomicU32::new(0),
        }
    }

    /// A page of records with no continuation.
    pub fn page(records: Vec<Value>) -> SyncResult<PageResponse> {
        Ok(PageResponse {
            records,
            next_cursor: None,
        })
    }

    /// A page of records continuing at `cursor`.
    pub fn page_with_cursor(records: Vec<Value>, cursor: &str) -> SyncResult<PageResponse> {
        Ok(PageResponse {
            records,
            next_cursor: Some(cursor.to_string()),
        })
    }

    /// A transient failure (retried by the fetcher).
    pub fn transient_failure() -> SyncResult<PageResponse> {
        Err(sync_error!(
            ErrorKind::SourceUnavailable,
            "Scripted transient failure"
        ))
    }

    /// A permanent failure (never retried).
    pub fn permanent_failure() -> SyncResult<PageResponse> {
        Err(sync_error!(
            ErrorKind::SourceRequestFailed,
            "Scripted permanent failure"
        ))
    }

    /// Number of `fetch_page` calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PagedSource for ScriptedSource {
    fn endpoint(&self) -> String {
        "scripted://test".to_string()
    }

    async fn fetch_page(&self, _request: &PageRequest) -> SyncResult<PageResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut script = self.script.lock().expect("script lock poisoned");
        if script.is_empty() {
            return Ok(PageResponse::default());
        }

        script.remove(0)
    }
}

/// Which warehouse operation a [`FaultInjectingWarehouse`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    AddColumns,
    LoadStaging,
    MergeStaging,
}

/// Wraps a [`MemoryWarehouse`], failing a chosen operation on demand.
///
/// Lets tests assert the writer's failure contract: a failure before the
/// merge leaves the target untouched, a failed merge leaves it at its
/// pre-merge state.
#[derive(Clone)]
pub struct FaultInjectingWarehouse {
    inner: MemoryWarehouse,
    fail_add_columns: Arc<AtomicBool>,
    fail_load_staging: Arc<AtomicBool>,
    fail_merge: Arc<AtomicBool>,
}

impl FaultInjectingWarehouse {
    pub fn wrap(inner: MemoryWarehouse) -> Self {
        Self {
            inner,
            fail_add_columns: Arc::new(AtomicBool::new(false)),
            fail_load_staging: Arc::new(AtomicBool::new(false)),
            fail_merge: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inner(&self) -> &MemoryWarehouse {
        &self.inner
    }

    /// Arms a fault; the chosen operation fails until disarmed.
    pub fn arm(&self, point: FaultPoint) {
        self.flag(point).store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self, point: FaultPoint) {
        self.flag(point).store(false, Ordering::SeqCst);
    }

    fn flag(&self, point: FaultPoint) -> &AtomicBool {
        match point {
            FaultPoint::AddColumns => &self.fail_add_columns,
            FaultPoint::LoadStaging => &self.fail_load_staging,
            FaultPoint::MergeStaging => &self.fail_merge,
        }
    }

    fn check(&self, point: FaultPoint, kind: ErrorKind) -> SyncResult<()> {
        if self.flag(point).load(Ordering::SeqCst) {
            return Err(SyncError::from((kind, "Injected warehouse fault")));
        }
        Ok(())
    }
}

impl Warehouse for FaultInjectingWarehouse {
    fn name(&self) -> &'static str {
        "fault-injecting"
    }

    async fn table_schema(&self, table: &str) -> SyncResult<Option<TableSchema>> {
        self.inner.table_schema(table).await
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> SyncResult<()> {
        self.inner.create_table(table, schema).await
    }

    async fn add_columns(&self, table: &str, columns: &[ColumnSchema]) -> SyncResult<()> {
        self.check(FaultPoint::AddColumns, ErrorKind::SchemaEvolutionFailed)?;
        self.inner.add_columns(table, columns).await
    }

    async fn truncate_table(&self, table: &str) -> SyncResult<()> {
        self.inner.truncate_table(table).await
    }

    async fn load_staging(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: Vec<StagingRow>,
    ) -> SyncResult<()> {
        self.check(FaultPoint::LoadStaging, ErrorKind::StagingLoadFailed)?;
        self.inner.load_staging(table, schema, rows).await
    }

    async fn merge_staging(
        &self,
        table: &str,
        unique_key: &str,
        staging_schema: &TableSchema,
    ) -> SyncResult<MergeOutcome> {
        self.check(FaultPoint::MergeStaging, ErrorKind::MergeFailed)?;
        self.inner
            .merge_staging(table, unique_key, staging_schema)
            .await
    }

    async fn target_row_count(&self, table: &str) -> SyncResult<u64> {
        self.inner.target_row_count(table).await
    }

    async fn read_checkpoint(&self, entity: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.inner.read_checkpoint(entity).await
    }

    async fn write_checkpoint(&self, entity: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        self.inner.write_checkpoint(entity, checkpoint).await
    }
}
