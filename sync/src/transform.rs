//! Built-in record transforms.
//!
//! Field-level mapping tables are external configuration; the engine ships
//! two transforms. Passthrough lands records as fetched plus provenance
//! columns. The time-entry transform flattens the tracker's interval
//! structure into the warehouse shape used by reporting and resolves the
//! entry's person against the planner identity space.

use chrono::{DateTime, Utc};
use config::shared::{SourceKind, TransformKind};
use serde_json::{Map, Value};

use crate::error::SyncResult;
use crate::identity::{IdentityMap, surrogate_id};
use crate::types::{SourceRecord, StagingRow};

/// Per-run inputs available to transforms.
pub struct TransformContext<'a> {
    /// Which source the records came from; lands in the `_source` column.
    pub source: SourceKind,
    /// Cross-source identity map, present when the run resolved identities.
    pub identity: Option<&'a IdentityMap>,
}

/// Applies the configured transform to one deduplicated record.
pub fn apply(
    kind: TransformKind,
    record: &SourceRecord,
    ctx: &TransformContext<'_>,
) -> SyncResult<StagingRow> {
    match kind {
        TransformKind::Passthrough => Ok(passthrough(record, ctx)),
        TransformKind::TimeEntries => Ok(time_entry(record, ctx)),
    }
}

/// Records land as fetched, plus an `id` column and the origin source.
fn passthrough(record: &SourceRecord, ctx: &TransformContext<'_>) -> StagingRow {
    let mut row = StagingRow::from(record.fields().clone());

    if !row.contains("id") {
        row.set("id", Value::String(record.source_id().to_string()));
    }
    row.set("_source", Value::String(source_name(ctx.source).to_string()));

    row
}

/// Flattens a tracker time entry into the warehouse actuals shape.
///
/// The surrogate id becomes the row id, the person is resolved through the
/// identity map (or falls back to a surrogate), and the original tracker
/// identifiers are kept in provenance columns so the merge can key on them.
fn time_entry(record: &SourceRecord, ctx: &TransformContext<'_>) -> StagingRow {
    let interval = record
        .field("timeInterval")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    let start_raw = interval.get("start").and_then(Value::as_str);
    let end_raw = interval.get("end").and_then(Value::as_str);
    let duration_raw = interval.get("duration").and_then(Value::as_str);

    let start = start_raw.and_then(parse_rfc3339);
    let end = end_raw.and_then(parse_rfc3339);

    let total_minutes = match (start, end) {
        (Some(start), Some(end)) if end >= start => (end - start).num_minutes(),
        _ => duration_raw.map(parse_duration_to_minutes).unwrap_or(0),
    };

    let billable = record
        .field("billable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let description = record.str_field("description").unwrap_or("");

    let (billable_minutes, nonbillable_minutes) = if billable {
        (total_minutes, 0)
    } else {
        (0, total_minutes)
    };

    let user_id = record.str_field("userId");
    let (person_id, matched_by_email) = match (user_id, ctx.identity) {
        (Some(user_id), Some(identity)) => match identity.resolve(user_id) {
            Some(resolved) => (Some(resolved.id), resolved.matched_by_business_key),
            None => (Some(surrogate_id(user_id)), false),
        },
        (Some(user_id), None) => (Some(surrogate_id(user_id)), false),
        (None, _) => (None, false),
    };

    let project_id = record.str_field("projectId").map(surrogate_id);

    let created_at = start_raw.map(str::to_string);
    let updated_at = end_raw.or(start_raw).map(str::to_string);

    let mut row = StagingRow::new();
    row.set("id", Value::from(surrogate_id(record.source_id())));
    row.set(
        "date",
        start_raw
            .map(|s| Value::String(s.chars().take(10).collect()))
            .unwrap_or(Value::Null),
    );
    row.set("billableMinutes", Value::from(billable_minutes));
    row.set("nonbillableMinutes", Value::from(nonbillable_minutes));
    row.set(
        "billableNote",
        Value::String(if billable { description } else { "" }.to_string()),
    );
    row.set(
        "nonbillableNote",
        Value::String(if billable { "" } else { description }.to_string()),
    );
    row.set("personId", person_id.map(Value::from).unwrap_or(Value::Null));
    row.set(
        "projectId",
        project_id.map(Value::from).unwrap_or(Value::Null),
    );
    row.set(
        "createdAt",
        created_at.map(Value::String).unwrap_or(Value::Null),
    );
    row.set(
        "updatedAt",
        updated_at.map(Value::String).unwrap_or(Value::Null),
    );

    // Provenance: the stable tracker identifiers and how the person was
    // resolved. The merge keys on `_tracker_id` because the surrogate row id
    // is derived, not source-assigned.
    row.set(
        "_tracker_id",
        Value::String(record.source_id().to_string()),
    );
    row.set(
        "_tracker_user_id",
        user_id
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
    );
    row.set(
        "_tracker_project_id",
        record
            .str_field("projectId")
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
    );
    row.set(
        "_tracker_task_id",
        record
            .str_field("taskId")
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
    );
    row.set("_matched_by_email", Value::Bool(matched_by_email));
    row.set("_source", Value::String(source_name(ctx.source).to_string()));

    row
}

/// Parses an ISO-8601 duration like `PT2H30M` into minutes.
///
/// Malformed input yields 0, matching how the original reporting treated
/// unparsable durations.
pub fn parse_duration_to_minutes(duration: &str) -> i64 {
    let Some(rest) = duration.strip_prefix("PT") else {
        return 0;
    };

    let mut minutes: i64 = 0;
    let mut rest = rest;

    if let Some(position) = rest.find('H') {
        match rest[..position].parse::<i64>() {
            Ok(hours) => minutes += hours * 60,
            Err(_) => return 0,
        }
        rest = &rest[position + 1..];
    }

    if let Some(position) = rest.find('M') {
        match rest[..position].parse::<i64>() {
            Ok(min) => minutes += min,
            Err(_) => return 0,
        }
    }

    minutes
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn source_name(source: SourceKind) -> &'static str {
    match source {
        SourceKind::Tracker => "tracker",
        SourceKind::Planner => "planner",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityMap;
    use serde_json::json;

    fn sample_entry() -> SourceRecord {
        SourceRecord::from_value(json!({
            "id": "entry-1",
            "description": "feature work",
            "userId": "user-1",
            "billable": true,
            "projectId": "proj-1",
            "taskId": "task-1",
            "timeInterval": {
                "start": "2024-01-15T08:00:00Z",
                "end": "2024-01-15T10:30:00Z",
                "duration": "PT2H30M"
            }
        }))
        .unwrap()
    }

    #[test]
    fn passthrough_adds_provenance_and_keeps_fields() {
        let record = SourceRecord::from_value(json!({"id": "p1", "name": "Alpha"})).unwrap();
        let ctx = TransformContext {
            source: SourceKind::Planner,
            identity: None,
        };

        let row = apply(TransformKind::Passthrough, &record, &ctx).unwrap();
        assert_eq!(row.get("name"), Some(&json!("Alpha")));
        assert_eq!(row.get("_source"), Some(&json!("planner")));
        assert_eq!(row.get("id"), Some(&json!("p1")));
    }

    #[test]
    fn time_entry_flattens_interval_and_splits_billable() {
        let ctx = TransformContext {
            source: SourceKind::Tracker,
            identity: None,
        };
        let row = apply(TransformKind::TimeEntries, &sample_entry(), &ctx).unwrap();

        assert_eq!(row.get("date"), Some(&json!("2024-01-15")));
        assert_eq!(row.get("billableMinutes"), Some(&json!(150)));
        assert_eq!(row.get("nonbillableMinutes"), Some(&json!(0)));
        assert_eq!(row.get("billableNote"), Some(&json!("feature work")));
        assert_eq!(row.get("_tracker_id"), Some(&json!("entry-1")));
        assert_eq!(row.get("_matched_by_email"), Some(&json!(false)));
        assert_eq!(row.get("updatedAt"), Some(&json!("2024-01-15T10:30:00Z")));

        // Person falls back to the surrogate without an identity map.
        assert_eq!(row.get("personId"), Some(&json!(surrogate_id("user-1"))));
    }

    #[test]
    fn time_entry_resolves_person_through_identity_map() {
        let foreign =
            vec![SourceRecord::from_value(json!({"id": "user-1", "email": "a@b.c"})).unwrap()];
        let target = vec![SourceRecord::from_value(json!({"id": 42, "email": "a@b.c"})).unwrap()];
        let identity = IdentityMap::build(&foreign, &target, "email");

        let ctx = TransformContext {
            source: SourceKind::Tracker,
            identity: Some(&identity),
        };
        let row = apply(TransformKind::TimeEntries, &sample_entry(), &ctx).unwrap();

        assert_eq!(row.get("personId"), Some(&json!(42)));
        assert_eq!(row.get("_matched_by_email"), Some(&json!(true)));
    }

    #[test]
    fn time_entry_without_interval_uses_duration_fallback() {
        let record = SourceRecord::from_value(json!({
            "id": "entry-2",
            "billable": false,
            "timeInterval": {"duration": "PT45M"}
        }))
        .unwrap();
        let ctx = TransformContext {
            source: SourceKind::Tracker,
            identity: None,
        };

        let row = apply(TransformKind::TimeEntries, &record, &ctx).unwrap();
        assert_eq!(row.get("nonbillableMinutes"), Some(&json!(45)));
        assert_eq!(row.get("date"), Some(&json!(null)));
    }

    #[test]
    fn duration_parsing_covers_common_shapes() {
        assert_eq!(parse_duration_to_minutes("PT2H30M"), 150);
        assert_eq!(parse_duration_to_minutes("PT45M"), 45);
        assert_eq!(parse_duration_to_minutes("PT1H"), 60);
        assert_eq!(parse_duration_to_minutes("PT0H"), 0);
        assert_eq!(parse_duration_to_minutes("garbage"), 0);
        assert_eq!(parse_duration_to_minutes(""), 0);
    }
}
