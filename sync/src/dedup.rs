//! Run-scoped collapsing of repeated record observations.
//!
//! Per-subject iteration on the tracker emits the same logical record once
//! per subject that can see it, so the observed record count can be several
//! times the true count. The deduplicator collapses those observations to
//! one record per sync key and reports how much it dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::types::{DedupReport, SourceRecord};

/// How the deduplication key of a record is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncKey {
    /// The record's raw source identifier.
    SourceId,
    /// A cross-source business attribute, trimmed and lowercased before
    /// comparison. Records missing the field fall back to the source id.
    BusinessField(String),
}

impl Default for SyncKey {
    fn default() -> Self {
        SyncKey::SourceId
    }
}

impl SyncKey {
    /// Computes the key for a record.
    pub fn of(&self, record: &SourceRecord) -> String {
        match self {
            SyncKey::SourceId => record.source_id().to_string(),
            SyncKey::BusinessField(field) => match record.str_field(field) {
                Some(value) if !value.trim().is_empty() => value.trim().to_lowercase(),
                _ => record.source_id().to_string(),
            },
        }
    }
}

/// Collapses a fetched sequence to one record per sync key.
///
/// State is scoped to a single run: the orchestrator creates a fresh
/// deduplicator per entity per run and drops it with the run, so nothing
/// leaks across invocations in a long-lived process.
///
/// Collapse policy: the record with the latest `updatedAt` survives; when
/// the competing records lack timestamps the last observed one wins, and a
/// timestamped record is preferred over an untimestamped one.
#[derive(Debug, Default)]
pub struct RecordDeduplicator {
    key: SyncKey,
    order: Vec<String>,
    records: HashMap<String, SourceRecord>,
    received: u64,
    duplicates: u64,
}

impl RecordDeduplicator {
    pub fn new(key: SyncKey) -> Self {
        Self {
            key,
            order: Vec::new(),
            records: HashMap::new(),
            received: 0,
            duplicates: 0,
        }
    }

    /// Consumes one observation.
    pub fn observe(&mut self, record: SourceRecord) {
        self.received += 1;
        let key = self.key.of(&record);

        match self.records.entry(key) {
            Entry::Vacant(slot) => {
                self.order.push(slot.key().clone());
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                self.duplicates += 1;
                if replaces(slot.get(), &record) {
                    slot.insert(record);
                }
            }
        }
    }

    /// Consumes a whole batch of observations.
    pub fn observe_all(&mut self, records: impl IntoIterator<Item = SourceRecord>) {
        for record in records {
            self.observe(record);
        }
    }

    /// Finishes the run, returning the surviving records in first-seen key
    /// order plus the duplicate accounting.
    pub fn finish(mut self) -> (Vec<SourceRecord>, DedupReport) {
        let records: Vec<SourceRecord> = self
            .order
            .iter()
            .filter_map(|key| self.records.remove(key))
            .collect();

        let report = DedupReport {
            received: self.received,
            unique: records.len() as u64,
            duplicates: self.duplicates,
        };

        (records, report)
    }
}

/// Whether `incoming` should replace the currently kept record.
fn replaces(kept: &SourceRecord, incoming: &SourceRecord) -> bool {
    match (kept.updated_at(), incoming.updated_at()) {
        (Some(kept_ts), Some(incoming_ts)) => incoming_ts >= kept_ts,
        // Neither side has a timestamp: last observed wins.
        (None, None) => true,
        // A timestamped record beats an untimestamped one.
        (None, Some(_)) => true,
        (Some(_), None) => false,
    }
}
