//! Model-serving endpoint client: one chat completion per summary.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use dqstudio_core::{Credential, StudioConfig, StudioError};
use serde_json::{json, Value};

use super::{strip_code_fences, SummaryEndpoint, SummaryRequest};
use crate::http::{truncate, HttpClient, HttpError};

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Sample rows included in the prompt.
const PROMPT_SAMPLE_ROWS: usize = 20;

/// Longest rendering of a single sample row in the prompt.
const PROMPT_ROW_CHARS: usize = 400;

pub struct ServingEndpointClient {
    http: HttpClient,
    endpoint_name: String,
    max_tokens: u32,
}

impl ServingEndpointClient {
    pub fn new(http: HttpClient, endpoint_name: impl Into<String>) -> Self {
        ServingEndpointClient {
            http,
            endpoint_name: endpoint_name.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// `None` when no `[summary] endpoint_name` is configured.
    pub fn from_config(config: &StudioConfig) -> Option<Self> {
        let name = config
            .summary
            .endpoint_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())?;
        if config.host().is_empty() {
            return None;
        }
        let http = HttpClient::new(
            config.host(),
            Duration::from_secs(config.summary.timeout_secs),
        );
        Some(ServingEndpointClient::new(http, name))
    }

    fn invocations_path(&self) -> String {
        format!("/serving-endpoints/{}/invocations", self.endpoint_name)
    }
}

#[async_trait]
impl SummaryEndpoint for ServingEndpointClient {
    async fn summarize(
        &self,
        request: &SummaryRequest,
        credential: &Credential,
    ) -> Result<Value, StudioError> {
        let body = json!({
            "messages": [
                { "role": "system", "content": build_system_prompt() },
                { "role": "user", "content": build_user_prompt(request) },
            ],
            "max_tokens": self.max_tokens,
        });

        let response = self
            .http
            .post_json(&self.invocations_path(), body, credential)
            .await
            .map_err(map_serving_error)?;
        parse_reply(&response)
    }
}

fn map_serving_error(err: HttpError) -> StudioError {
    match err {
        HttpError::Status {
            status: 401 | 403,
            message,
        } => StudioError::Unauthorized(message),
        other => StudioError::SummaryUnavailable(other.to_string()),
    }
}

/// Pull the model's text out of a chat-completions body.
fn parse_reply(response: &Value) -> Result<Value, StudioError> {
    let content = response
        .pointer("/choices/0/message/content")
        .or_else(|| response.pointer("/predictions/0"))
        .ok_or_else(|| {
            StudioError::SummaryUnavailable(format!(
                "reply has no message content: {}",
                truncate(&response.to_string(), 200)
            ))
        })?;

    match content {
        Value::String(text) => {
            let body = strip_code_fences(text);
            Ok(serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string())))
        }
        other => Ok(other.clone()),
    }
}

// ── Prompt construction ──────────────────────────────────────────────────────

fn build_system_prompt() -> String {
    r#"You review data-quality rule sets for tabular data.

Given a table name, a rule set, and optionally sample rows and validation results,
assess how well the rules protect the table's data quality.

Return ONLY a JSON object. No explanation outside the object, no code fences:
{
  "summary": "<two or three sentences on what the rules check>",
  "coverage_notes": ["<one note per column or concern that is or is not covered>"],
  "recommendations": ["<one concrete rule to add, tighten or drop>"],
  "risk_level": "low" | "medium" | "high"
}

Base risk_level on the columns left unchecked and on any failing rules."#
        .to_string()
}

fn build_user_prompt(request: &SummaryRequest) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "## Table\n\n{}\n", request.table_name);

    prompt.push_str("## Rules\n\n");
    for rule in request.rules.iter() {
        let arguments = serde_json::to_string(&rule.check.arguments).unwrap_or_default();
        let _ = writeln!(
            prompt,
            "- {} [{}]: {}({})",
            rule.name, rule.criticality, rule.check.function, arguments
        );
    }
    prompt.push('\n');

    if let Some(sample) = &request.sample {
        let columns: Vec<String> = sample
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.type_name))
            .collect();
        let _ = writeln!(prompt, "## Columns\n\n{}\n", columns.join(", "));

        if !sample.rows.is_empty() {
            let _ = writeln!(
                prompt,
                "## Sample rows ({} of {})\n",
                sample.rows.len().min(PROMPT_SAMPLE_ROWS),
                sample.rows.len()
            );
            for row in sample.rows.iter().take(PROMPT_SAMPLE_ROWS) {
                let line = serde_json::to_string(row).unwrap_or_default();
                let _ = writeln!(prompt, "{}", truncate(&line, PROMPT_ROW_CHARS));
            }
            prompt.push('\n');
        }
    }

    if let Some(report) = &request.validation {
        let _ = writeln!(
            prompt,
            "## Validation results\n\n{} of {} rows valid ({}%); {} passed, {} failed, {} warnings\n",
            report.valid_rows,
            report.total_rows,
            report.pass_rate,
            report.passed,
            report.failed,
            report.warnings
        );
        for result in &report.rule_results {
            let _ = writeln!(
                prompt,
                "- {} on {}: {:?}, {} violations",
                result.rule_name, result.column, result.status, result.violation_count
            );
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Column, TableSample};
    use dqstudio_core::RuleSet;

    fn request() -> SummaryRequest {
        let rules = RuleSet::from_json(&json!([
            {"check": {"function": "is_not_null", "arguments": {"column": "id"}}, "name": "id_present", "criticality": "error"},
            {"check": {"function": "regex_match", "arguments": {"column": "email", "regex": ".+@.+"}}, "name": "email_format", "criticality": "warn"}
        ]))
        .unwrap();
        let mut row = serde_json::Map::new();
        row.insert("id".into(), json!("1"));
        row.insert("email".into(), json!("a@b.c"));
        SummaryRequest::new("main.sales.customers", rules).with_sample(TableSample {
            table_name: "main.sales.customers".into(),
            columns: vec![Column::new("id", "BIGINT"), Column::new("email", "STRING")],
            rows: vec![row],
        })
    }

    #[test]
    fn system_prompt_demands_json() {
        let prompt = build_system_prompt();
        assert!(prompt.contains("Return ONLY a JSON object"));
        assert!(prompt.contains("risk_level"));
    }

    #[test]
    fn user_prompt_lists_rules_and_sample() {
        let prompt = build_user_prompt(&request());
        assert!(prompt.contains("main.sales.customers"));
        assert!(prompt.contains("- id_present [error]: is_not_null({\"column\":\"id\"})"));
        assert!(prompt.contains("email_format [warn]"));
        assert!(prompt.contains("id BIGINT, email STRING"));
        assert!(prompt.contains("Sample rows (1 of 1)"));
        assert!(!prompt.contains("Validation results"));
    }

    #[test]
    fn reply_content_is_unfenced_and_parsed() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "```json\n{\"summary\": \"ok\"}\n```"}}]
        });
        assert_eq!(parse_reply(&response).unwrap(), json!({"summary": "ok"}));

        let prose = json!({"choices": [{"message": {"content": "Looks fine."}}]});
        assert_eq!(parse_reply(&prose).unwrap(), json!("Looks fine."));

        assert!(matches!(
            parse_reply(&json!({"id": "x"})),
            Err(StudioError::SummaryUnavailable(_))
        ));
    }

    #[test]
    fn auth_errors_stay_unauthorized() {
        let err = map_serving_error(HttpError::Status {
            status: 403,
            message: "no access".into(),
        });
        assert_eq!(err, StudioError::Unauthorized("no access".into()));
        let err = map_serving_error(HttpError::Transport("reset".into()));
        assert!(matches!(err, StudioError::SummaryUnavailable(_)));
    }

    #[test]
    fn from_config_requires_endpoint_name() {
        let mut config = StudioConfig::default();
        config.workspace.host = "https://example.cloud.databricks.com".into();
        assert!(ServingEndpointClient::from_config(&config).is_none());
        config.summary.endpoint_name = Some("rules-analyst".into());
        let client = ServingEndpointClient::from_config(&config).unwrap();
        assert_eq!(client.invocations_path(), "/serving-endpoints/rules-analyst/invocations");
        assert_eq!(client.http.timeout(), Duration::from_secs(60));

        config.warehouse.request_timeout_secs = 5;
        config.summary.timeout_secs = 120;
        let client = ServingEndpointClient::from_config(&config).unwrap();
        assert_eq!(client.http.timeout(), Duration::from_secs(120));
    }
}
