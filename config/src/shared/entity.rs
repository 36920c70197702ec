use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Which external source a resource is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The page-numbered time-tracking API.
    Tracker,
    /// The cursor-paginated resource-planning API.
    Planner,
}

/// Which built-in transform is applied to fetched records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Records land in the warehouse as fetched, plus provenance columns.
    Passthrough,
    /// Tracker time entries: interval flattening, billable split and
    /// cross-source person resolution.
    TimeEntries,
}

impl Default for TransformKind {
    fn default() -> Self {
        TransformKind::Passthrough
    }
}

/// One entity in the sync registry.
///
/// The entity name doubles as the warehouse table name. A `{user_id}`
/// placeholder in the path makes the resource per-user: it is fetched once
/// per tracker user, with the placeholder substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EntityConfig {
    /// Entity name and warehouse table name.
    pub name: String,
    /// Source API this entity is fetched from.
    pub source: SourceKind,
    /// Resource path relative to the source base URL.
    pub path: String,
    /// Disabled entities are skipped by the orchestrator.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Column the warehouse merge is keyed on.
    ///
    /// Defaults to `id`. Override with a provenance column (such as
    /// `_tracker_id`) when the primary identifier is not stable across runs.
    #[serde(default = "default_unique_key")]
    pub unique_key: String,
    /// Record field used as the deduplication key during a run.
    ///
    /// Unset means the raw source id. When set, the named field is trimmed
    /// and lowercased before comparison (a cross-source business key such as
    /// an email address).
    #[serde(default)]
    pub sync_key: Option<String>,
    /// Transform applied between fetch and merge.
    #[serde(default)]
    pub transform: TransformKind,
    /// Whether the resource supports `modifiedAfter` incremental fetches.
    #[serde(default)]
    pub incremental: bool,
}

impl EntityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "entities.name",
                constraint: "must not be empty",
            });
        }
        if self.unique_key.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "entities.unique_key",
                constraint: "must not be empty",
            });
        }

        Ok(())
    }
}

/// The standard entity registry, used when the configuration does not list
/// entities explicitly.
pub fn default_entities() -> Vec<EntityConfig> {
    fn entity(
        name: &str,
        source: SourceKind,
        path: &str,
        unique_key: &str,
        transform: TransformKind,
        incremental: bool,
    ) -> EntityConfig {
        EntityConfig {
            name: name.to_string(),
            source,
            path: path.to_string(),
            enabled: true,
            unique_key: unique_key.to_string(),
            sync_key: None,
            transform,
            incremental,
        }
    }

    vec![
        entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        ),
        entity(
            "projects",
            SourceKind::Tracker,
            "/projects",
            "id",
            TransformKind::Passthrough,
            false,
        ),
        entity(
            "clients",
            SourceKind::Tracker,
            "/clients",
            "id",
            TransformKind::Passthrough,
            false,
        ),
        entity(
            "time_entries",
            SourceKind::Tracker,
            "/user/{user_id}/time-entries",
            "_tracker_id",
            TransformKind::TimeEntries,
            false,
        ),
        entity(
            "assignments",
            SourceKind::Planner,
            "/assignments",
            "id",
            TransformKind::Passthrough,
            true,
        ),
        entity(
            "time_offs_leave",
            SourceKind::Planner,
            "/time-offs/leave",
            "id",
            TransformKind::Passthrough,
            false,
        ),
    ]
}

fn default_enabled() -> bool {
    true
}

fn default_unique_key() -> String {
    "id".to_string()
}
