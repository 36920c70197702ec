use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::types::StagingRow;

/// Column types supported by the warehouse targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    String,
    Timestamp,
    Date,
    Json,
}

impl ColumnType {
    /// Infers a column type from a JSON value. `Null` carries no information
    /// and returns `None`.
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(ColumnType::Int64)
                } else {
                    Some(ColumnType::Float64)
                }
            }
            Value::String(s) => Some(infer_string_type(s)),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
        }
    }

    /// The BigQuery name of this type, used in DDL statements.
    pub fn bigquery_name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOL",
            ColumnType::Int64 => "INT64",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::String => "STRING",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Date => "DATE",
            ColumnType::Json => "JSON",
        }
    }
}

/// Schema of a single warehouse column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub typ: ColumnType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, typ: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            typ,
            nullable,
        }
    }
}

/// Schema of a warehouse table, with columns in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self { columns }
    }

    /// Infers a schema from a set of staging rows.
    ///
    /// Column order follows first appearance across the rows. A column's type
    /// comes from its first non-null value; columns that never carry a
    /// non-null value fall back to strings, mirroring how the warehouse
    /// autodetects loaded JSON. Every inferred column is nullable, since rows
    /// are not guaranteed to carry every column.
    pub fn infer(rows: &[StagingRow]) -> TableSchema {
        let mut order: Vec<String> = Vec::new();
        let mut types: std::collections::HashMap<String, Option<ColumnType>> =
            std::collections::HashMap::new();

        for row in rows {
            for (name, value) in row.as_map() {
                let slot = types.entry(name.clone()).or_insert_with(|| {
                    order.push(name.clone());
                    None
                });
                if slot.is_none() {
                    *slot = ColumnType::of_value(value);
                }
            }
        }

        let columns = order
            .into_iter()
            .map(|name| {
                let typ = types
                    .get(&name)
                    .copied()
                    .flatten()
                    .unwrap_or(ColumnType::String);
                ColumnSchema::new(name, typ, true)
            })
            .collect();

        TableSchema { columns }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Columns present here but absent from `target`, in schema order.
    ///
    /// These are the additive columns a merge must create before loading.
    pub fn columns_missing_from(&self, target: &TableSchema) -> Vec<ColumnSchema> {
        self.columns
            .iter()
            .filter(|c| !target.has_column(&c.name))
            .cloned()
            .collect()
    }

    /// Appends columns to the schema. Existing columns are never retyped.
    pub fn extend(&mut self, columns: Vec<ColumnSchema>) {
        for column in columns {
            if !self.has_column(&column.name) {
                self.columns.push(column);
            }
        }
    }

    /// The column used to order staged duplicates, newest first.
    ///
    /// `updatedAt` is preferred, then `updated_at`. `None` means the staging
    /// dedup falls back to load order.
    pub fn timestamp_column(&self) -> Option<&str> {
        if self.has_column("updatedAt") {
            Some("updatedAt")
        } else if self.has_column("updated_at") {
            Some("updated_at")
        } else {
            None
        }
    }
}

fn infer_string_type(value: &str) -> ColumnType {
    if DateTime::parse_from_rfc3339(value).is_ok() {
        ColumnType::Timestamp
    } else if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
        ColumnType::Date
    } else {
        ColumnType::String
    }
}
