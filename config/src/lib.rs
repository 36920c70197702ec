//! Configuration loading and shared configuration types for the sync system.
//!
//! Configuration is layered: `configuration/base.yaml` is always loaded, an
//! environment-specific file (`dev.yaml`/`prod.yaml`) is merged on top, and
//! `APP_`-prefixed environment variables override both.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{LoadConfigError, load_config};

/// A secret string that can round-trip through configuration files.
///
/// Wraps [`SecretString`] so that values deserialize from plain strings in
/// YAML/JSON configuration while remaining redacted in `Debug` output. The
/// secret is only reachable through [`SerializableSecretString::expose_secret`].
#[derive(Clone)]
pub struct SerializableSecretString(SecretString);

impl SerializableSecretString {
    /// Returns the wrapped secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializableSecretString([REDACTED])")
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(SecretString::new(value))
    }
}

impl Serialize for SerializableSecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.expose_secret())
    }
}

impl<'de> Deserialize<'de> for SerializableSecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value))
    }
}
