use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::shared::{
    ApiConfig, EntityConfig, PlannerSourceConfig, RetryConfig, SyncConfig, TrackerSourceConfig,
    ValidationError, WarehouseConfig, default_entities,
};

/// Top-level configuration for the sync system.
///
/// Deserialized from the layered configuration sources by
/// [`crate::load_config`] and shared by the `syncd` and `api` binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub tracker: TrackerSourceConfig,
    pub planner: PlannerSourceConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_entities")]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

impl AppConfig {
    /// Validates the whole configuration tree.
    ///
    /// Called once at startup, before any entity pipeline runs, so that
    /// configuration problems fail the process instead of individual entities.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tracker.validate()?;
        self.planner.validate()?;
        self.retry.validate()?;
        self.sync.validate()?;

        if self.entities.is_empty() {
            return Err(ValidationError::NoEntities);
        }

        let mut names = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(ValidationError::DuplicateEntityName(entity.name.clone()));
            }
        }

        Ok(())
    }
}
