//! SQL warehouse client for the statement execution API.
//!
//! Statements are submitted with an inline JSON-array result and a bounded
//! server-side wait. A statement still running when the wait expires is
//! cancelled server-side and reported as `WarehouseUnavailable`, so a
//! single `execute` never loops.

use std::time::Duration;

use async_trait::async_trait;
use dqstudio_core::{Credential, StudioConfig, StudioError};
use serde_json::{json, Value};

use super::{Column, PageToken, ResultPage, TabularEngine};
use crate::http::{HttpClient, HttpError};

const STATEMENTS_PATH: &str = "/api/2.0/sql/statements";

/// Error codes and message fragments that mean the statement itself is bad.
const QUERY_ERROR_MARKERS: [&str; 6] = [
    "PARSE_SYNTAX_ERROR",
    "TABLE_OR_VIEW_NOT_FOUND",
    "UNRESOLVED_COLUMN",
    "SCHEMA_NOT_FOUND",
    "CATALOG_NOT_FOUND",
    "AnalysisException",
];

pub struct WarehouseClient {
    http: HttpClient,
    warehouse_id: String,
    wait_timeout_secs: u64,
}

impl WarehouseClient {
    pub fn new(http: HttpClient, warehouse_id: &str, wait_timeout_secs: u64) -> Self {
        WarehouseClient {
            http,
            warehouse_id: warehouse_id.to_string(),
            wait_timeout_secs: wait_timeout_secs.clamp(5, 50),
        }
    }

    pub fn from_config(config: &StudioConfig) -> Result<Self, StudioError> {
        if config.host().is_empty() || config.warehouse.warehouse_id.trim().is_empty() {
            return Err(StudioError::InvalidInput(
                "workspace.host and warehouse.warehouse_id are required for queries".to_string(),
            ));
        }
        let http = HttpClient::new(
            config.host(),
            Duration::from_secs(config.warehouse.request_timeout_secs),
        );
        Ok(WarehouseClient::new(
            http,
            config.warehouse.warehouse_id.trim(),
            config.warehouse.wait_timeout_secs,
        ))
    }

    fn statement_body(&self, sql: &str) -> Value {
        json!({
            "statement": sql,
            "warehouse_id": self.warehouse_id,
            "wait_timeout": format!("{}s", self.wait_timeout_secs),
            "on_wait_timeout": "CANCEL",
            "disposition": "INLINE",
            "format": "JSON_ARRAY",
        })
    }
}

#[async_trait]
impl TabularEngine for WarehouseClient {
    async fn execute(&self, sql: &str, credential: &Credential) -> Result<ResultPage, StudioError> {
        let response = self
            .http
            .post_json(STATEMENTS_PATH, self.statement_body(sql), credential)
            .await
            .map_err(map_http_error)?;
        parse_statement_response(&response, self.wait_timeout_secs)
    }

    async fn fetch_page(
        &self,
        token: &PageToken,
        credential: &Credential,
    ) -> Result<ResultPage, StudioError> {
        let response = self
            .http
            .get_json(&token.0, credential)
            .await
            .map_err(map_http_error)?;
        Ok(parse_chunk(&response))
    }
}

/// HTTP 401/403 -> Unauthorized; 400/404 -> MalformedQuery; everything
/// else (429, 5xx, transport, undecodable bodies) -> WarehouseUnavailable.
fn map_http_error(err: HttpError) -> StudioError {
    match &err {
        HttpError::Status { status: 401 | 403, message } => {
            StudioError::Unauthorized(message.clone())
        }
        HttpError::Status { status: 400 | 404, message } => {
            StudioError::MalformedQuery(message.clone())
        }
        _ => StudioError::WarehouseUnavailable(err.to_string()),
    }
}

fn parse_statement_response(response: &Value, wait_secs: u64) -> Result<ResultPage, StudioError> {
    let state = response
        .pointer("/status/state")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");

    match state {
        "SUCCEEDED" => {
            let columns = response
                .pointer("/manifest/schema/columns")
                .and_then(Value::as_array)
                .map(|cols| {
                    cols.iter()
                        .map(|c| {
                            Column::new(
                                c.get("name").and_then(Value::as_str).unwrap_or_default(),
                                c.get("type_name").and_then(Value::as_str).unwrap_or_default(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            let mut page = response.get("result").map(parse_chunk).unwrap_or_default();
            page.columns = columns;
            Ok(page)
        }
        "FAILED" => {
            let code = response
                .pointer("/status/error/error_code")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let message = response
                .pointer("/status/error/message")
                .and_then(Value::as_str)
                .unwrap_or("statement failed")
                .to_string();
            Err(classify_statement_failure(code, message))
        }
        "PENDING" | "RUNNING" | "CANCELED" => Err(StudioError::WarehouseUnavailable(format!(
            "statement did not finish within {wait_secs}s (state {state})"
        ))),
        other => Err(StudioError::WarehouseUnavailable(format!(
            "unexpected statement state {other}"
        ))),
    }
}

fn classify_statement_failure(code: &str, message: String) -> StudioError {
    if matches!(code, "PERMISSION_DENIED" | "UNAUTHENTICATED") {
        return StudioError::Unauthorized(message);
    }
    let is_query_error = matches!(code, "BAD_REQUEST" | "INVALID_PARAMETER_VALUE")
        || QUERY_ERROR_MARKERS
            .iter()
            .any(|marker| code.contains(marker) || message.contains(marker));
    if is_query_error {
        StudioError::MalformedQuery(message)
    } else {
        StudioError::WarehouseUnavailable(message)
    }
}

fn parse_chunk(chunk: &Value) -> ResultPage {
    let rows = chunk
        .get("data_array")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| row.as_array().cloned().unwrap_or_default())
                .collect()
        })
        .unwrap_or_default();
    let next = chunk
        .get("next_chunk_internal_link")
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
        .map(|link| PageToken(link.to_string()));
    ResultPage {
        columns: Vec::new(),
        rows,
        next,
    }
}
