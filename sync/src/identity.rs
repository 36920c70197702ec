//! Deterministic identity assignment and cross-source identity resolution.
//!
//! Surrogate identifiers are derived from a fixed, versioned hash of the
//! immutable source identifier. The derivation is part of the warehouse
//! schema contract: it must produce the same value across process restarts
//! and over the lifetime of the system, which rules out the language's
//! seeded hasher. Changing [`SURROGATE_ID_VERSION`] requires a full reload.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::types::{MatchReport, SourceRecord};

/// Version of the surrogate-id derivation below.
pub const SURROGATE_ID_VERSION: u32 = 1;

/// Width of the surrogate-id space: values fit in 10 decimal digits.
const SURROGATE_ID_MODULUS: u64 = 10_000_000_000;

/// Derives the deterministic surrogate identifier for a source id.
///
/// Version 1: SHA-256 of the identifier's bytes, first 8 digest bytes taken
/// as a big-endian integer, reduced modulo 10^10.
pub fn surrogate_id(source_id: &str) -> i64 {
    let digest = Sha256::digest(source_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);

    (u64::from_be_bytes(prefix) % SURROGATE_ID_MODULUS) as i64
}

/// Result of joining one foreign record against the target identity space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Exactly one target record shares the join attribute.
    Unique(i64),
    /// No target record shares the join attribute.
    NoMatch,
    /// Several target records share the join attribute.
    Ambiguous(usize),
}

/// A resolved identity for one foreign record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Target-space identifier: the native one on a unique match, the
    /// surrogate id otherwise.
    pub id: i64,
    /// Whether the identity came from a unique business-key match.
    pub matched_by_business_key: bool,
}

/// A per-run mapping from foreign-source identifiers to target identities.
///
/// Built once per orchestrator run by joining two record sets on a shared
/// business attribute (case-insensitive, trimmed), then discarded with the
/// run. Never persisted.
#[derive(Debug)]
pub struct IdentityMap {
    resolved: HashMap<String, ResolvedIdentity>,
    report: MatchReport,
}

impl IdentityMap {
    /// Joins `foreign` records to `target` records on `join_attribute`.
    ///
    /// Ambiguous and missing matches both fall back to a surrogate id
    /// derived from the foreign source id; they are counted separately in
    /// the report, and the unmatched attribute values are collected for
    /// diagnosis.
    pub fn build(
        foreign: &[SourceRecord],
        target: &[SourceRecord],
        join_attribute: &str,
    ) -> IdentityMap {
        let mut candidates: HashMap<String, Vec<i64>> = HashMap::new();
        for record in target {
            let Some(value) = normalized_attribute(record, join_attribute) else {
                continue;
            };
            candidates
                .entry(value)
                .or_default()
                .push(native_target_id(record));
        }

        let mut resolved = HashMap::new();
        let mut report = MatchReport {
            foreign_total: foreign.len() as u64,
            target_total: target.len() as u64,
            ..MatchReport::default()
        };

        for record in foreign {
            let outcome = match normalized_attribute(record, join_attribute) {
                Some(value) => match candidates.get(&value) {
                    Some(ids) if ids.len() == 1 => JoinOutcome::Unique(ids[0]),
                    Some(ids) => JoinOutcome::Ambiguous(ids.len()),
                    None => JoinOutcome::NoMatch,
                },
                None => JoinOutcome::NoMatch,
            };

            let identity = match outcome {
                JoinOutcome::Unique(id) => {
                    report.matched += 1;
                    ResolvedIdentity {
                        id,
                        matched_by_business_key: true,
                    }
                }
                JoinOutcome::Ambiguous(count) => {
                    report.ambiguous += 1;
                    report.unmatched += 1;
                    record_unmatched_value(&mut report, record, join_attribute);
                    tracing::warn!(
                        source_id = record.source_id(),
                        candidates = count,
                        "ambiguous identity join, falling back to surrogate id"
                    );
                    ResolvedIdentity {
                        id: surrogate_id(record.source_id()),
                        matched_by_business_key: false,
                    }
                }
                JoinOutcome::NoMatch => {
                    report.unmatched += 1;
                    record_unmatched_value(&mut report, record, join_attribute);
                    ResolvedIdentity {
                        id: surrogate_id(record.source_id()),
                        matched_by_business_key: false,
                    }
                }
            };

            resolved.insert(record.source_id().to_string(), identity);
        }

        IdentityMap { resolved, report }
    }

    /// Resolves a foreign source id seen during the join.
    pub fn resolve(&self, foreign_source_id: &str) -> Option<&ResolvedIdentity> {
        self.resolved.get(foreign_source_id)
    }

    /// Match statistics for the run summary.
    pub fn report(&self) -> &MatchReport {
        &self.report
    }
}

/// The target's native identifier, falling back to its surrogate when the
/// native id is not numeric.
fn native_target_id(record: &SourceRecord) -> i64 {
    record
        .source_id()
        .parse::<i64>()
        .unwrap_or_else(|_| surrogate_id(record.source_id()))
}

fn normalized_attribute(record: &SourceRecord, attribute: &str) -> Option<String> {
    let value = record.str_field(attribute)?.trim().to_lowercase();
    if value.is_empty() { None } else { Some(value) }
}

fn record_unmatched_value(report: &mut MatchReport, record: &SourceRecord, attribute: &str) {
    let value = record
        .str_field(attribute)
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("<missing {attribute}>"));

    if !report.unmatched_values.contains(&value) {
        report.unmatched_values.push(value);
    }
}
