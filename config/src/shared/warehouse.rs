use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;

/// Configuration for the warehouse the sync writes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarehouseConfig {
    /// In-memory warehouse, for tests and local development.
    Memory,
    /// BigQuery dataset.
    BigQuery {
        /// GCP project id.
        project_id: String,
        /// Dataset holding the target and staging tables.
        dataset_id: String,
        /// Service account key JSON. Redacted in debug output.
        service_account_key: SerializableSecretString,
    },
}
