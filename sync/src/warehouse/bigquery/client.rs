use gcp_bigquery_client::Client;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use tracing::info;

use crate::types::{ColumnSchema, ColumnType, StagingRow, TableSchema};

/// Rows per `insertAll` request; BigQuery accepts far more, this keeps
/// request bodies small.
const INSERT_BATCH_SIZE: usize = 500;

/// A thin client for the BigQuery operations the sync needs.
///
/// Tables are managed through DDL statements and rows are loaded through the
/// JSON `insertAll` API, matching the shape of the staging rows.
pub struct BigQueryClient {
    project_id: String,
    client: Client,
}

impl BigQueryClient {
    /// Creates a client from a service account key JSON string.
    pub async fn new_with_key(project_id: String, sa_key: &str) -> Result<Self, BQError> {
        let sa_key = parse_service_account_key(sa_key)?;
        let client = Client::from_service_account_key(sa_key, false).await?;

        Ok(Self { project_id, client })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Executes an SQL statement and returns the result set.
    pub async fn query(&self, query: String) -> Result<ResultSet, BQError> {
        let response = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(query))
            .await?;

        Ok(ResultSet::new_from_query_response(response))
    }

    /// Whether a table exists in the dataset.
    pub async fn table_exists(&self, dataset_id: &str, table: &str) -> Result<bool, BQError> {
        let query = format!(
            "select exists (select 1 from `{}.{}.INFORMATION_SCHEMA.TABLES` \
             where table_name = '{}') as table_exists",
            self.project_id,
            dataset_id,
            escape_literal(table)
        );

        let mut result_set = self.query(query).await?;
        let mut exists = false;
        if result_set.next_row() {
            exists = result_set.get_bool_by_name("table_exists")?.unwrap_or(false);
        }

        Ok(exists)
    }

    /// Reads a table's schema from `INFORMATION_SCHEMA.COLUMNS`.
    ///
    /// Returns `None` when the table has no columns there, meaning it does
    /// not exist.
    pub async fn table_schema(
        &self,
        dataset_id: &str,
        table: &str,
    ) -> Result<Option<TableSchema>, BQError> {
        let query = format!(
            "select column_name, data_type \
             from `{}.{}.INFORMATION_SCHEMA.COLUMNS` \
             where table_name = '{}' \
             order by ordinal_position",
            self.project_id,
            dataset_id,
            escape_literal(table)
        );

        let mut result_set = self.query(query).await?;
        let mut columns = Vec::new();
        while result_set.next_row() {
            let name = result_set
                .get_string_by_name("column_name")?
                .unwrap_or_default();
            let data_type = result_set
                .get_string_by_name("data_type")?
                .unwrap_or_default();

            columns.push(ColumnSchema::new(name, bigquery_type(&data_type), true));
        }

        if columns.is_empty() {
            return Ok(None);
        }

        Ok(Some(TableSchema::new(columns)))
    }

    /// Creates a table from a schema, if it is missing.
    pub async fn create_table_if_missing(
        &self,
        dataset_id: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), BQError> {
        let columns_spec = schema
            .columns()
            .iter()
            .map(column_spec)
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            "creating table {}.{}.{} in bigquery",
            self.project_id, dataset_id, table
        );

        let query = format!(
            "create table if not exists `{}.{}.{}` ({})",
            self.project_id, dataset_id, table, columns_spec
        );
        let _ = self.query(query).await?;

        Ok(())
    }

    /// Replaces a table (used for staging tables) with a fresh empty one.
    pub async fn replace_table(
        &self,
        dataset_id: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), BQError> {
        let columns_spec = schema
            .columns()
            .iter()
            .map(column_spec)
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "create or replace table `{}.{}.{}` ({})",
            self.project_id, dataset_id, table, columns_spec
        );
        let _ = self.query(query).await?;

        Ok(())
    }

    /// Adds nullable columns to an existing table.
    pub async fn add_columns(
        &self,
        dataset_id: &str,
        table: &str,
        columns: &[ColumnSchema],
    ) -> Result<(), BQError> {
        for column in columns {
            info!(
                "adding column `{}` {} to {}.{}.{}",
                column.name,
                column.typ.bigquery_name(),
                self.project_id,
                dataset_id,
                table
            );

            let query = format!(
                "alter table `{}.{}.{}` add column if not exists `{}` {}",
                self.project_id,
                dataset_id,
                table,
                column.name,
                column.typ.bigquery_name()
            );
            let _ = self.query(query).await?;
        }

        Ok(())
    }

    /// Truncates a table, tolerating its absence.
    pub async fn truncate_table(&self, dataset_id: &str, table: &str) -> Result<(), BQError> {
        if !self.table_exists(dataset_id, table).await? {
            info!(
                "table {}.{}.{} does not exist, nothing to truncate",
                self.project_id, dataset_id, table
            );
            return Ok(());
        }

        let query = format!(
            "truncate table `{}.{}.{}`",
            self.project_id, dataset_id, table
        );
        let _ = self.query(query).await?;

        Ok(())
    }

    /// Streams rows into a table through the JSON `insertAll` API.
    pub async fn insert_rows(
        &self,
        dataset_id: &str,
        table: &str,
        rows: &[StagingRow],
    ) -> Result<(), BQError> {
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let mut request = TableDataInsertAllRequest::new();
            for row in chunk {
                request.add_row(None, row.as_map().clone())?;
            }

            self.client
                .tabledata()
                .insert_all(&self.project_id, dataset_id, table, request)
                .await?;
        }

        Ok(())
    }

    /// Number of rows in a table, 0 when the table is missing.
    pub async fn row_count(&self, dataset_id: &str, table: &str) -> Result<u64, BQError> {
        if !self.table_exists(dataset_id, table).await? {
            return Ok(0);
        }

        let query = format!(
            "select count(*) as row_count from `{}.{}.{}`",
            self.project_id, dataset_id, table
        );
        let mut result_set = self.query(query).await?;

        let mut count = 0u64;
        if result_set.next_row() {
            count = result_set.get_i64_by_name("row_count")?.unwrap_or(0) as u64;
        }

        Ok(count)
    }
}

/// SQL column specification for DDL statements; every column is nullable.
fn column_spec(column: &ColumnSchema) -> String {
    format!("`{}` {}", column.name, column.typ.bigquery_name())
}

/// Maps an `INFORMATION_SCHEMA` data type back to a [`ColumnType`].
fn bigquery_type(data_type: &str) -> ColumnType {
    match data_type {
        "BOOL" | "BOOLEAN" => ColumnType::Bool,
        "INT64" | "INTEGER" => ColumnType::Int64,
        "FLOAT64" | "FLOAT" => ColumnType::Float64,
        "TIMESTAMP" => ColumnType::Timestamp,
        "DATE" => ColumnType::Date,
        "JSON" => ColumnType::Json,
        _ => ColumnType::String,
    }
}

/// Escapes a string literal for embedding in generated SQL.
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}
