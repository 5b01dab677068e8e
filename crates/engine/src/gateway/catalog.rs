//! Catalog browsing on top of [`TabularQueryGateway`].
//!
//! Identifiers are validated and backtick-quoted before they are spliced into
//! SQL; an invalid identifier fails with `MalformedQuery` without any remote
//! call.

use std::fmt;

use dqstudio_core::{Credential, StudioError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Column, Row, TabularQueryGateway};

/// Upper bound on rows returned by [`TabularQueryGateway::sample_table`].
pub const MAX_SAMPLE_ROWS: usize = 1_000;

const MAX_IDENTIFIER_LEN: usize = 255;

/// A validated three-part table name, `catalog.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn parse(name: &str) -> Result<Self, StudioError> {
        let parts: Vec<&str> = name.trim().split('.').collect();
        let [catalog, schema, table] = parts.as_slice() else {
            return Err(StudioError::MalformedQuery(format!(
                "table name must be catalog.schema.table, got '{name}'"
            )));
        };
        Ok(TableName {
            catalog: check_identifier(catalog)?.to_string(),
            schema: check_identifier(schema)?.to_string(),
            table: check_identifier(table)?.to_string(),
        })
    }

    /// `` `catalog`.`schema`.`table` ``
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}.{}",
            quote(&self.catalog),
            quote(&self.schema),
            quote(&self.table)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

/// One column from `DESCRIBE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub comment: Option<String>,
}

/// A handful of rows from a table, keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSample {
    pub table_name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

pub(crate) fn check_identifier(part: &str) -> Result<&str, StudioError> {
    let valid = !part.is_empty()
        && part.len() <= MAX_IDENTIFIER_LEN
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(part)
    } else {
        Err(StudioError::MalformedQuery(format!(
            "invalid identifier '{part}'"
        )))
    }
}

fn quote(identifier: &str) -> String {
    format!("`{identifier}`")
}

fn first_column(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|r| r.str_at(0).map(str::to_string))
        .collect()
}

impl TabularQueryGateway {
    pub async fn list_catalogs(&self, credential: &Credential) -> Result<Vec<String>, StudioError> {
        let rows = self.query("SHOW CATALOGS", credential).await?.collect_all().await?;
        Ok(first_column(&rows))
    }

    pub async fn list_schemas(
        &self,
        catalog: &str,
        credential: &Credential,
    ) -> Result<Vec<String>, StudioError> {
        let sql = format!("SHOW SCHEMAS IN {}", quote(check_identifier(catalog)?));
        let rows = self.query(&sql, credential).await?.collect_all().await?;
        Ok(first_column(&rows))
    }

    pub async fn list_tables(
        &self,
        catalog: &str,
        schema: &str,
        credential: &Credential,
    ) -> Result<Vec<String>, StudioError> {
        let sql = format!(
            "SHOW TABLES IN {}.{}",
            quote(check_identifier(catalog)?),
            quote(check_identifier(schema)?)
        );
        let rows = self.query(&sql, credential).await?.collect_all().await?;
        // SHOW TABLES yields (database, tableName, isTemporary).
        Ok(rows
            .iter()
            .filter_map(|r| r.get_str("tableName").or_else(|| r.str_at(1)))
            .map(str::to_string)
            .collect())
    }

    pub async fn describe_table(
        &self,
        table: &TableName,
        credential: &Credential,
    ) -> Result<Vec<ColumnDescription>, StudioError> {
        let sql = format!("DESCRIBE TABLE {}", table.quoted());
        let rows = self.query(&sql, credential).await?.collect_all().await?;
        let mut columns = Vec::new();
        for row in &rows {
            let name = row.get_str("col_name").or_else(|| row.str_at(0)).unwrap_or("");
            // Partition and metadata sections start with a blank or '#' row.
            if name.trim().is_empty() || name.starts_with('#') {
                break;
            }
            columns.push(ColumnDescription {
                name: name.to_string(),
                data_type: row
                    .get_str("data_type")
                    .or_else(|| row.str_at(1))
                    .unwrap_or_default()
                    .to_string(),
                comment: row
                    .get_str("comment")
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            });
        }
        Ok(columns)
    }

    /// Up to `limit` rows (clamped to `1..=MAX_SAMPLE_ROWS`).
    pub async fn sample_table(
        &self,
        table: &TableName,
        limit: usize,
        credential: &Credential,
    ) -> Result<TableSample, StudioError> {
        let limit = limit.clamp(1, MAX_SAMPLE_ROWS);
        let sql = format!("SELECT * FROM {} LIMIT {limit}", table.quoted());
        let mut stream = self.query(&sql, credential).await?;
        let rows = stream.take(limit).await?;
        Ok(TableSample {
            table_name: table.to_string(),
            columns: stream.columns().to_vec(),
            rows: rows.iter().map(Row::to_object).collect(),
        })
    }
}
