//! AnalysisRelay: AI commentary on candidate or accepted rule sets.
//!
//! The relay never fails its caller. Anything that goes wrong on the way to
//! a summary (no endpoint configured, no credential, a timeout, an
//! unparseable reply) becomes [`RelayOutcome::Degraded`] with a reason.

mod serving;

pub use serving::ServingEndpointClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dqstudio_core::{
    Credential, CredentialSelector, OperationClass, RequestContext, RuleSet, StudioError,
    ValidationReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::TableSample;

/// Upper bound on one summarization round trip.
pub const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the summarizer gets to look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRequest {
    pub table_name: String,
    pub rules: RuleSet,
    pub sample: Option<TableSample>,
    pub validation: Option<ValidationReport>,
}

impl SummaryRequest {
    pub fn new(table_name: impl Into<String>, rules: RuleSet) -> Self {
        SummaryRequest {
            table_name: table_name.into(),
            rules,
            sample: None,
            validation: None,
        }
    }

    pub fn with_sample(mut self, sample: TableSample) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn with_validation(mut self, report: ValidationReport) -> Self {
        self.validation = Some(report);
        self
    }
}

/// The remote AI summarization endpoint.
///
/// Returns the model's reply as JSON when it is JSON, otherwise as a string.
#[async_trait]
pub trait SummaryEndpoint: Send + Sync {
    async fn summarize(
        &self,
        request: &SummaryRequest,
        credential: &Credential,
    ) -> Result<Value, StudioError>;
}

/// Fixed-shape summary, whatever shape the model answered in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AiSummary {
    pub summary: String,
    #[serde(default)]
    pub coverage_notes: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
}

const SUMMARY_KEYS: &[&str] = &["summary", "overview", "analysis"];
const COVERAGE_KEYS: &[&str] = &["coverage_notes", "coverage", "notes"];
const RECOMMENDATION_KEYS: &[&str] = &["recommendations", "suggestions"];
const RISK_KEYS: &[&str] = &["risk_level", "risk"];

impl AiSummary {
    /// Normalize a loosely shaped model reply.
    ///
    /// Accepts an object (with alternative key names, string-or-list
    /// fields), JSON text optionally wrapped in code fences, or plain prose,
    /// which becomes the summary text.
    pub fn normalize(reply: &Value) -> Result<Self, StudioError> {
        let summary = match reply {
            Value::String(text) => {
                let body = strip_code_fences(text);
                match serde_json::from_str::<Value>(body) {
                    Ok(parsed @ Value::Object(_)) => return AiSummary::normalize(&parsed),
                    _ => AiSummary {
                        summary: body.to_string(),
                        ..AiSummary::default()
                    },
                }
            }
            Value::Object(map) => {
                let field = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));
                AiSummary {
                    summary: field(SUMMARY_KEYS).map(text_of).unwrap_or_default(),
                    coverage_notes: field(COVERAGE_KEYS).map(list_of).unwrap_or_default(),
                    recommendations: field(RECOMMENDATION_KEYS).map(list_of).unwrap_or_default(),
                    risk_level: field(RISK_KEYS)
                        .map(text_of)
                        .map(|r| r.trim().to_ascii_lowercase())
                        .filter(|r| !r.is_empty()),
                }
            }
            other => {
                return Err(StudioError::SummaryUnavailable(format!(
                    "unexpected summary shape: {}",
                    crate::http::truncate(&other.to_string(), 120)
                )))
            }
        };

        if summary.is_empty() {
            return Err(StudioError::SummaryUnavailable(
                "summary reply was empty".to_string(),
            ));
        }
        Ok(summary)
    }

    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.coverage_notes.is_empty()
            && self.recommendations.is_empty()
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(_) => list_of(value).join("\n").trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// Scalars inside lists are kept as their JSON text.
fn list_item(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn list_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(list_item)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Strip markdown code fences (```json ... ```) from a model reply.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    if !text.starts_with("```") {
        return text;
    }
    let Some(nl) = text.find('\n') else {
        return text.trim_matches('`').trim();
    };
    let after_open = &text[nl + 1..];
    match after_open.rfind("```") {
        Some(close) => after_open[..close].trim(),
        None => after_open.trim(),
    }
}

/// What `summarize` produced: a summary, or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelayOutcome {
    Summarized(AiSummary),
    Degraded { reason: String },
}

impl RelayOutcome {
    pub fn degraded(reason: impl Into<String>) -> Self {
        RelayOutcome::Degraded {
            reason: reason.into(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, RelayOutcome::Degraded { .. })
    }

    pub fn summary(&self) -> Option<&AiSummary> {
        match self {
            RelayOutcome::Summarized(summary) => Some(summary),
            RelayOutcome::Degraded { .. } => None,
        }
    }

    pub fn into_summary(self) -> Option<AiSummary> {
        match self {
            RelayOutcome::Summarized(summary) => Some(summary),
            RelayOutcome::Degraded { .. } => None,
        }
    }
}

/// Forwards rule sets to the summary endpoint and normalizes the reply.
#[derive(Clone)]
pub struct AnalysisRelay {
    endpoint: Option<Arc<dyn SummaryEndpoint>>,
    selector: Arc<CredentialSelector>,
    timeout: Duration,
}

impl AnalysisRelay {
    pub fn new(endpoint: Arc<dyn SummaryEndpoint>, selector: Arc<CredentialSelector>) -> Self {
        AnalysisRelay {
            endpoint: Some(endpoint),
            selector,
            timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    /// A relay with no endpoint; every call degrades.
    pub fn disabled(selector: Arc<CredentialSelector>) -> Self {
        AnalysisRelay {
            endpoint: None,
            selector,
            timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Summarize `request` on behalf of the caller in `ctx`.
    pub async fn summarize(&self, request: &SummaryRequest, ctx: &RequestContext) -> RelayOutcome {
        match self.try_summarize(request, ctx).await {
            Ok(summary) => {
                tracing::debug!(
                    table = %request.table_name,
                    recommendations = summary.recommendations.len(),
                    "summary received"
                );
                RelayOutcome::Summarized(summary)
            }
            Err(err) => {
                tracing::warn!(
                    table = %request.table_name,
                    error = %err,
                    "summary unavailable; continuing without it"
                );
                RelayOutcome::degraded(err.to_string())
            }
        }
    }

    async fn try_summarize(
        &self,
        request: &SummaryRequest,
        ctx: &RequestContext,
    ) -> Result<AiSummary, StudioError> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            StudioError::SummaryUnavailable("no summary endpoint is configured".to_string())
        })?;
        let credential = self.selector.resolve(OperationClass::UserAIQuery, ctx)?;

        let reply = tokio::time::timeout(self.timeout, endpoint.summarize(request, &credential))
            .await
            .map_err(|_| {
                StudioError::SummaryUnavailable(format!("no reply within {:?}", self.timeout))
            })??;
        AiSummary::normalize(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqstudio_core::Environment;
    use serde_json::json;

    fn rules() -> RuleSet {
        RuleSet::from_json(&json!([
            {"check": {"function": "is_not_null", "arguments": {"column": "id"}}, "name": "id_present", "criticality": "error"}
        ]))
        .unwrap()
    }

    enum Reply {
        Value(Value),
        Fail(StudioError),
        Hang,
    }

    struct ScriptedEndpoint(Reply);

    #[async_trait]
    impl SummaryEndpoint for ScriptedEndpoint {
        async fn summarize(&self, _r: &SummaryRequest, c: &Credential) -> Result<Value, StudioError> {
            assert_eq!(c.token(), "user-token");
            match &self.0 {
                Reply::Value(v) => Ok(v.clone()),
                Reply::Fail(e) => Err(e.clone()),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
            }
        }
    }

    fn relay(reply: Reply) -> AnalysisRelay {
        let selector = Arc::new(CredentialSelector::new(None, None, Environment::Local));
        AnalysisRelay::new(Arc::new(ScriptedEndpoint(reply)), selector)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Some("user-token".into()), Some("ana@example.com".into()))
    }

    #[test]
    fn normalize_accepts_alternative_keys() {
        let reply = json!({
            "overview": "Rules cover identity columns only.",
            "coverage": "- id checked\n- email unchecked",
            "suggestions": ["Add a format check on email", null, ""],
            "risk": " Medium "
        });
        let summary = AiSummary::normalize(&reply).unwrap();
        assert_eq!(summary.summary, "Rules cover identity columns only.");
        assert_eq!(summary.coverage_notes, vec!["id checked", "email unchecked"]);
        assert_eq!(summary.recommendations, vec!["Add a format check on email"]);
        assert_eq!(summary.risk_level.as_deref(), Some("medium"));
    }

    #[test]
    fn normalize_unwraps_fenced_json_and_prose() {
        let fenced = json!("```json\n{\"summary\": \"ok\", \"recommendations\": \"one\"}\n```");
        let summary = AiSummary::normalize(&fenced).unwrap();
        assert_eq!(summary.summary, "ok");
        assert_eq!(summary.recommendations, vec!["one"]);

        let prose = AiSummary::normalize(&json!("The rules look reasonable.")).unwrap();
        assert_eq!(prose.summary, "The rules look reasonable.");
        assert!(prose.recommendations.is_empty());
    }

    #[test]
    fn normalize_rejects_empty_and_odd_shapes() {
        assert!(matches!(AiSummary::normalize(&json!({})), Err(StudioError::SummaryUnavailable(_))));
        assert!(matches!(AiSummary::normalize(&json!("   ")), Err(StudioError::SummaryUnavailable(_))));
        assert!(matches!(AiSummary::normalize(&json!(42)), Err(StudioError::SummaryUnavailable(_))));
    }

    #[test]
    fn strip_code_fences_variants() {
        assert_eq!(strip_code_fences("[1, 2, 3]"), "[1, 2, 3]");
        assert_eq!(strip_code_fences("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fences("```\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fences("```\n{\"a\": 1}"), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn summarized_reply_is_normalized() {
        let relay = relay(Reply::Value(json!({"summary": "fine", "risk_level": "LOW"})));
        let outcome = relay.summarize(&SummaryRequest::new("main.s.t", rules()), &ctx()).await;
        assert_eq!(outcome.summary().unwrap().risk_level.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn endpoint_failure_degrades() {
        let relay = relay(Reply::Fail(StudioError::SummaryUnavailable("503".into())));
        let outcome = relay.summarize(&SummaryRequest::new("main.s.t", rules()), &ctx()).await;
        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn timeout_degrades() {
        let relay = relay(Reply::Hang).with_timeout(Duration::from_millis(50));
        let outcome = relay.summarize(&SummaryRequest::new("main.s.t", rules()), &ctx()).await;
        assert!(matches!(outcome, RelayOutcome::Degraded { reason } if reason.contains("50ms")));
    }

    #[tokio::test]
    async fn missing_credential_or_endpoint_degrades() {
        let relay = relay(Reply::Value(json!({"summary": "unreachable"})));
        let outcome = relay
            .summarize(&SummaryRequest::new("main.s.t", rules()), &RequestContext::anonymous())
            .await;
        assert!(matches!(outcome, RelayOutcome::Degraded { reason } if reason.contains("no credential")));

        let disabled = AnalysisRelay::disabled(Arc::new(CredentialSelector::new(None, None, Environment::Local)));
        assert!(!disabled.is_enabled());
        assert!(disabled.summarize(&SummaryRequest::new("t", rules()), &ctx()).await.is_degraded());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = RelayOutcome::degraded("timeout");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"status": "degraded", "reason": "timeout"})
        );
    }
}
