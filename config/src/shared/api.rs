use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;

/// Configuration for the HTTP trigger surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ApiConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on trigger requests. Unset disables auth,
    /// which is only acceptable for local development.
    #[serde(default)]
    pub auth_token: Option<SerializableSecretString>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}
