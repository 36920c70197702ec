use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;

/// A raw decoded record from a source API.
///
/// Carries the source identifier, the update timestamp when the payload has
/// one, and the full field map as decoded from JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    source_id: String,
    updated_at: Option<DateTime<Utc>>,
    fields: Map<String, Value>,
}

impl SourceRecord {
    /// Builds a record from a decoded JSON value.
    ///
    /// The value must be an object carrying an `id` (or `_id`) that is a
    /// string or number. `updatedAt`/`updated_at` is parsed as RFC 3339 when
    /// present; an unparseable timestamp is treated as absent rather than
    /// failing the record.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let Value::Object(fields) = value else {
            bail!(
                ErrorKind::SourceResponseInvalid,
                "Source record is not a JSON object",
                format!("got {}", json_type_name(&value))
            );
        };

        let source_id = fields
            .get("id")
            .or_else(|| fields.get("_id"))
            .and_then(id_to_string)
            .ok_or_else(|| {
                sync_error!(
                    ErrorKind::SourceResponseInvalid,
                    "Source record has no usable identifier",
                    format!("fields: {:?}", fields.keys().collect::<Vec<_>>())
                )
            })?;

        let updated_at = fields
            .get("updatedAt")
            .or_else(|| fields.get("updated_at"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        Ok(Self {
            source_id,
            updated_at,
            fields,
        })
    }

    /// Builds a record directly from parts, used by tests and transforms.
    pub fn from_parts(
        source_id: impl Into<String>,
        updated_at: Option<DateTime<Utc>>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            updated_at,
            fields,
        }
    }

    /// The record's identifier, unique within its source and resource.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The record's update timestamp, when the source provides one.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// The decoded field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// A single field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// A string field by name.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Consumes the record, returning the field map.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
