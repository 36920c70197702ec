use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::record::parse_timestamp;

/// A transformed record, shaped for the warehouse target schema.
///
/// Rows are flat JSON objects: column name to scalar (or JSON) value. The
/// staging loader serializes them as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StagingRow(Map<String, Value>);

impl StagingRow {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Sets a column value, replacing any previous value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    /// The row's update timestamp, read from `updatedAt` or `updated_at`.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("updatedAt")
            .or_else(|| self.0.get("updated_at"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Column names in insertion order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl Default for StagingRow {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for StagingRow {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
