use serde::Serialize;
use uuid::Uuid;

use crate::error::SyncError;

/// Telemetry from one paginated fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    /// Pages retrieved, including the final short or empty page.
    pub pages: u32,
    /// Raw records received across all pages.
    pub received: u64,
    /// Retries performed across all page requests.
    pub retries: u32,
}

impl FetchReport {
    /// Folds another fetch's counters into this one, used when a resource is
    /// fetched once per subject.
    pub fn absorb(&mut self, other: &FetchReport) {
        self.pages += other.pages;
        self.received += other.received;
        self.retries += other.retries;
    }
}

/// Telemetry from collapsing repeated observations of the same record.
///
/// Required run output: operators watch the duplication ratio to catch
/// silent duplication regressions before they reach the warehouse.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    /// Records consumed from the fetcher.
    pub received: u64,
    /// Distinct records emitted.
    pub unique: u64,
    /// Observations dropped as duplicates.
    pub duplicates: u64,
}

impl DedupReport {
    /// Received-to-unique ratio; 1.0 when nothing was duplicated.
    pub fn duplication_ratio(&self) -> f64 {
        if self.unique == 0 {
            return 0.0;
        }
        self.received as f64 / self.unique as f64
    }
}

/// Telemetry from the cross-source identity join.
///
/// Required output, not optional logging: match-rate degradation silently
/// corrupts downstream joins.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchReport {
    /// Foreign-source records considered.
    pub foreign_total: u64,
    /// Target-space records indexed.
    pub target_total: u64,
    /// Foreign records resolved to exactly one target identity.
    pub matched: u64,
    /// Foreign records with no target candidate.
    pub unmatched: u64,
    /// Foreign records whose join attribute matched several targets.
    pub ambiguous: u64,
    /// Join-attribute values that did not resolve, for diagnosis.
    pub unmatched_values: Vec<String>,
}

impl MatchReport {
    /// Fraction of foreign records resolved to a target identity.
    pub fn match_rate(&self) -> f64 {
        if self.foreign_total == 0 {
            return 0.0;
        }
        self.matched as f64 / self.foreign_total as f64
    }
}

/// Telemetry from one stage-and-merge write.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    /// Rows inserted or updated by the merge.
    pub rows_merged: u64,
    /// Staging rows dropped by the per-key dedup inside the merge.
    pub staging_duplicates: u64,
}

/// The result of one entity's pipeline within a run.
#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub entity: String,
    pub rows_written: u64,
    pub fetch: Option<FetchReport>,
    pub dedup: Option<DedupReport>,
    pub merge: Option<MergeReport>,
    pub error: Option<SyncError>,
}

impl EntityOutcome {
    /// An outcome carrying only a failure.
    pub fn failed(entity: impl Into<String>, error: SyncError) -> Self {
        Self {
            entity: entity.into(),
            rows_written: 0,
            fetch: None,
            dedup: None,
            merge: None,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// The externally observable result of one sync run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub full_reload: bool,
    pub entities: Vec<EntityOutcome>,
    /// Present when the run performed cross-source identity resolution.
    pub match_report: Option<MatchReport>,
}

impl RunSummary {
    pub fn total_rows(&self) -> u64 {
        self.entities.iter().map(|e| e.rows_written).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.entities.iter().filter(|e| e.is_failed()).count()
    }

    /// Whether every entity in the run failed.
    ///
    /// This is the condition under which the process exits non-zero; partial
    /// failures are reported in the summary but do not fail the run.
    pub fn all_failed(&self) -> bool {
        !self.entities.is_empty() && self.failed_count() == self.entities.len()
    }

    /// Aggregates the entity errors, for surfacing an all-failed run.
    pub fn errors(&self) -> Vec<SyncError> {
        self.entities
            .iter()
            .filter_map(|e| e.error.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sync_error;

    #[test]
    fn duplication_ratio_matches_received_over_unique() {
        let report = DedupReport {
            received: 60,
            unique: 23,
            duplicates: 37,
        };

        assert!((report.duplication_ratio() - 2.608).abs() < 0.01);
    }

    #[test]
    fn match_rate_is_zero_without_foreign_records() {
        assert_eq!(MatchReport::default().match_rate(), 0.0);
    }

    #[test]
    fn all_failed_requires_every_entity_to_fail() {
        let ok = EntityOutcome {
            entity: "people".to_string(),
            rows_written: 10,
            fetch: None,
            dedup: None,
            merge: None,
            error: None,
        };
        let failed = EntityOutcome::failed(
            "projects",
            sync_error!(ErrorKind::SourceUnavailable, "Source down"),
        );

        let partial = RunSummary {
            run_id: Uuid::new_v4(),
            full_reload: false,
            entities: vec![ok, failed.clone()],
            match_report: None,
        };
        assert!(!partial.all_failed());
        assert_eq!(partial.failed_count(), 1);
        assert_eq!(partial.total_rows(), 10);

        let total = RunSummary {
            run_id: Uuid::new_v4(),
            full_reload: false,
            entities: vec![failed],
            match_report: None,
        };
        assert!(total.all_failed());
    }
}
