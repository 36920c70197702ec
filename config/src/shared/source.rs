use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Configuration for the page-numbered time-tracking source.
///
/// The tracker API authenticates with an API key header, paginates with
/// `page`/`page-size` query parameters and returns bare JSON arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TrackerSourceConfig {
    /// Base URL of the tracker API, without a trailing slash.
    pub base_url: String,
    /// API key sent in the `X-Api-Key` header. Redacted in debug output.
    pub api_key: SerializableSecretString,
    /// Workspace whose collections are synced.
    pub workspace_id: String,
    /// Records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl TrackerSourceConfig {
    /// Default page size for tracker requests.
    pub const DEFAULT_PAGE_SIZE: u32 = 200;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.page_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "tracker.page_size",
                constraint: "must be greater than 0",
            });
        }

        Ok(())
    }
}

/// Configuration for the cursor-paginated resource-planning source.
///
/// The planner API authenticates with a bearer token, paginates with
/// `cursor`/`limit` query parameters and wraps results in a
/// `{"values": [...], "nextCursor": ...}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlannerSourceConfig {
    /// Base URL of the planner API, without a trailing slash.
    pub base_url: String,
    /// Bearer token for the planner API. Redacted in debug output.
    pub api_token: SerializableSecretString,
    /// Records requested per cursor page.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl PlannerSourceConfig {
    /// Default per-request limit for planner requests.
    pub const DEFAULT_PAGE_LIMIT: u32 = 200;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.page_limit == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "planner.page_limit",
                constraint: "must be greater than 0",
            });
        }

        Ok(())
    }
}

fn default_page_size() -> u32 {
    TrackerSourceConfig::DEFAULT_PAGE_SIZE
}

fn default_page_limit() -> u32 {
    PlannerSourceConfig::DEFAULT_PAGE_LIMIT
}
