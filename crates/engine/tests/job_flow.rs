//! End-to-end request flows through `RuleStudio` with scripted collaborators.
//!
//! 1. Generation: submit, poll to Succeeded, read the rules, poll again
//! 2. Validation: failed notebook output surfaces as JobFailed
//! 3. Jobs always run under the service credential
//! 4. Confirm: summary stored when available, persistence unaffected when not

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dqstudio_core::{
    Credential, CredentialOrigin, CredentialSelector, Environment, RequestContext, RuleSet,
    StudioError,
};
use dqstudio_engine::gateway::{Column, PageToken, ResultPage, TabularEngine, TabularQueryGateway};
use dqstudio_engine::jobs::{JobId, JobOrchestrator, JobPlatform, JobRequest, JobState, RemoteStatus};
use dqstudio_engine::ledger::RuleVersionLedger;
use dqstudio_engine::relay::{AnalysisRelay, SummaryEndpoint, SummaryRequest};
use dqstudio_engine::{ConfirmRequest, RuleStudio};
use dqstudio_storage::MemoryLedgerStorage;
use serde_json::{json, Value};

// ──────────────────────────────────────────────
// Scripted collaborators
// ──────────────────────────────────────────────

/// Replays a fixed status sequence per job; the last status repeats.
#[derive(Default)]
struct ScriptedPlatform {
    scripts: Mutex<HashMap<String, VecDeque<RemoteStatus>>>,
    next_id: Mutex<u64>,
    pending: Mutex<VecDeque<Vec<RemoteStatus>>>,
    submitted: Mutex<Vec<(JobRequest, Credential)>>,
    status_calls: Mutex<u32>,
}

impl ScriptedPlatform {
    fn enqueue(&self, statuses: Vec<RemoteStatus>) {
        self.pending.lock().unwrap().push_back(statuses);
    }
}

#[async_trait]
impl JobPlatform for ScriptedPlatform {
    async fn submit(&self, request: &JobRequest, credential: &Credential) -> Result<JobId, StudioError> {
        let script = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| StudioError::SubmissionRejected("no script".into()))?;
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("run-{next}")
        };
        self.scripts.lock().unwrap().insert(id.clone(), script.into());
        self.submitted.lock().unwrap().push((request.clone(), credential.clone()));
        Ok(JobId::new(id))
    }

    async fn status(&self, job_id: &JobId, _credential: &Credential) -> Result<RemoteStatus, StudioError> {
        *self.status_calls.lock().unwrap() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(job_id.as_str())
            .ok_or_else(|| StudioError::JobFailed(format!("run {job_id} not found")))?;
        let status = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        status.ok_or_else(|| StudioError::JobFailed("empty script".into()))
    }
}

/// A warehouse with one small table.
struct OneTable;

#[async_trait]
impl TabularEngine for OneTable {
    async fn execute(&self, _sql: &str, _c: &Credential) -> Result<ResultPage, StudioError> {
        Ok(ResultPage {
            columns: vec![Column::new("id", "BIGINT"), Column::new("email", "STRING")],
            rows: vec![vec![json!("1"), json!("a@example.com")], vec![json!("2"), json!(null)]],
            next: None,
        })
    }

    async fn fetch_page(&self, _t: &PageToken, _c: &Credential) -> Result<ResultPage, StudioError> {
        Ok(ResultPage::default())
    }
}

struct FixedSummary(Result<Value, StudioError>);

#[async_trait]
impl SummaryEndpoint for FixedSummary {
    async fn summarize(&self, request: &SummaryRequest, _c: &Credential) -> Result<Value, StudioError> {
        assert!(request.sample.is_some(), "analysis should carry a sample");
        self.0.clone()
    }
}

struct Harness {
    platform: Arc<ScriptedPlatform>,
    studio: RuleStudio<MemoryLedgerStorage>,
}

fn harness(summary: Option<Result<Value, StudioError>>) -> Harness {
    let selector = Arc::new(CredentialSelector::new(
        Some("service-token".into()),
        None,
        Environment::Deployed,
    ));
    let platform = Arc::new(ScriptedPlatform::default());
    let relay = match summary {
        Some(reply) => AnalysisRelay::new(Arc::new(FixedSummary(reply)), Arc::clone(&selector)),
        None => AnalysisRelay::disabled(Arc::clone(&selector)),
    };
    let studio = RuleStudio::new(
        Arc::clone(&selector),
        TabularQueryGateway::new(Arc::new(OneTable)),
        Arc::new(JobOrchestrator::new(platform.clone(), Arc::clone(&selector))),
        RuleVersionLedger::new(MemoryLedgerStorage::new()),
        relay,
    );
    Harness { platform, studio }
}

fn user() -> RequestContext {
    RequestContext::new(Some("user-token".into()), Some("ana@example.com".into()))
}

fn status(state: JobState, result: Option<Value>, error: Option<&str>) -> RemoteStatus {
    RemoteStatus {
        state,
        progress: None,
        result,
        error: error.map(str::to_string),
    }
}

fn generated_payload() -> Value {
    json!({
        "rules": [
            {"check": {"function": "is_not_null", "arguments": {"column": "id"}}, "name": "id_present", "criticality": "error"},
            {"check": {"function": "regex_match", "arguments": {"column": "email", "regex": ".+@.+"}}, "criticality": "warn"}
        ]
    })
}

// ──────────────────────────────────────────────
// Generation
// ──────────────────────────────────────────────

#[tokio::test]
async fn generation_job_runs_to_success_and_stays_there() {
    let h = harness(None);
    h.platform.enqueue(vec![
        status(JobState::Submitted, None, None),
        status(JobState::Running, None, None),
        status(JobState::Running, None, None),
        status(JobState::Succeeded, Some(generated_payload()), None),
    ]);

    let job = h
        .studio
        .request_rules("main.crm.customers", "ids required, emails well formed", &user())
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Submitted);

    let first = h.studio.poll(&job.id).await.unwrap();
    assert!(matches!(first.state, JobState::Submitted | JobState::Running));
    assert!(matches!(
        h.studio.generated_rules(&job.id),
        Err(StudioError::JobNotTerminal { .. })
    ));

    let mut last = first;
    for _ in 0..10 {
        if last.is_terminal() {
            break;
        }
        last = h.studio.poll(&job.id).await.unwrap();
    }
    assert_eq!(last.state, JobState::Succeeded);
    assert_eq!(last.result, Some(generated_payload()));

    let rules = h.studio.generated_rules(&job.id).unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules.rules()[1].name, "regex_match");

    let calls_before = *h.platform.status_calls.lock().unwrap();
    let again = h.studio.poll(&job.id).await.unwrap();
    let once_more = h.studio.poll(&job.id).await.unwrap();
    assert_eq!(again, last);
    assert_eq!(
        serde_json::to_vec(&again).unwrap(),
        serde_json::to_vec(&once_more).unwrap()
    );
    assert_eq!(*h.platform.status_calls.lock().unwrap(), calls_before);
}

#[tokio::test]
async fn jobs_are_triggered_with_the_service_credential() {
    let h = harness(None);
    h.platform.enqueue(vec![status(JobState::Running, None, None)]);
    let rules = RuleSet::from_json(&generated_payload()).unwrap();
    h.studio
        .request_validation("main.crm.customers", &rules, &user())
        .await
        .unwrap();

    let submitted = h.platform.submitted.lock().unwrap();
    let (request, credential) = &submitted[0];
    assert_eq!(credential.token(), "service-token");
    assert_eq!(credential.origin(), CredentialOrigin::ServicePrincipal);
    assert_eq!(request.input_ref.table_name, "main.crm.customers");
    let sent = RuleSet::from_json(&json!(request.input_ref.parameters["rules"])).unwrap();
    assert_eq!(sent, rules);
}

// ──────────────────────────────────────────────
// Validation
// ──────────────────────────────────────────────

#[tokio::test]
async fn validation_report_is_read_from_job_output() {
    let h = harness(None);
    let output = json!({
        "success": true,
        "table_name": "main.crm.customers",
        "validated_at": "2026-10-19T09:00:00Z",
        "total_rules": 1, "passed": 0, "failed": 1, "warnings": 0,
        "total_rows": 10, "valid_rows": 8, "invalid_rows": 2, "pass_rate": 80.0,
        "rule_results": [
            {"rule_name": "id_present", "column": "id", "criticality": "error", "status": "fail", "violation_count": 2}
        ]
    });
    h.platform
        .enqueue(vec![status(JobState::Succeeded, Some(output), None)]);
    let rules = RuleSet::from_json(&generated_payload()).unwrap();
    let job = h
        .studio
        .request_validation("main.crm.customers", &rules, &user())
        .await
        .unwrap();
    assert!(h.studio.poll(&job.id).await.unwrap().is_terminal());

    let report = h.studio.validation_report(&job.id).unwrap();
    assert_eq!(report.invalid_rows, 2);
    assert_eq!(report.pass_rate, 80.0);
    assert_eq!(report.rule_results[0].violation_count, 2);
}

#[tokio::test]
async fn failed_validation_surfaces_remote_reason() {
    let h = harness(None);
    h.platform.enqueue(vec![
        status(JobState::Running, None, None),
        status(JobState::Failed, None, Some("AnalysisException: column email_x not found")),
    ]);
    let rules = RuleSet::from_json(&generated_payload()).unwrap();
    let job = h
        .studio
        .request_validation("main.crm.customers", &rules, &user())
        .await
        .unwrap();

    h.studio.poll(&job.id).await.unwrap();
    let terminal = h.studio.poll(&job.id).await.unwrap();
    assert_eq!(terminal.state, JobState::Failed);

    match h.studio.validation_report(&job.id) {
        Err(StudioError::JobFailed(reason)) => assert!(reason.contains("email_x")),
        other => panic!("expected JobFailed, got {other:?}"),
    }
}

// ──────────────────────────────────────────────
// Confirm
// ──────────────────────────────────────────────

#[tokio::test]
async fn confirm_stores_summary_when_available() {
    let h = harness(Some(Ok(json!({
        "summary": "Identity and contact columns are covered.",
        "recommendations": ["Check created_at is not in the future"],
        "risk_level": "low"
    }))));
    let rules = RuleSet::from_json(&generated_payload()).unwrap();

    let confirmation = h
        .studio
        .confirm(
            ConfirmRequest::new("main.crm.customers", rules)
                .with_prompt("ids required")
                .with_summary(),
            &user(),
        )
        .await
        .unwrap();

    let stored = confirmation.record.ai_summary.clone().unwrap();
    assert_eq!(stored["risk_level"], json!("low"));
    assert_eq!(stored["recommendations"][0], json!("Check created_at is not in the future"));
    assert!(!confirmation.summary.unwrap().is_degraded());

    let active = h.studio.active("main.crm.customers").await.unwrap().unwrap();
    assert_eq!(active.prompt.as_deref(), Some("ids required"));
    assert_eq!(active.created_by, "ana@example.com");
}

#[tokio::test]
async fn confirm_persists_when_summary_fails() {
    let h = harness(Some(Err(StudioError::SummaryUnavailable("endpoint scaled to zero".into()))));
    let rules = RuleSet::from_json(&generated_payload()).unwrap();

    for expected in 1..=2 {
        let confirmation = h
            .studio
            .confirm(
                ConfirmRequest::new("main.crm.customers", rules.clone()).with_summary(),
                &user(),
            )
            .await
            .unwrap();
        assert_eq!(confirmation.record.version, expected);
        assert_eq!(confirmation.record.ai_summary, None);
        assert!(confirmation.summary.unwrap().is_degraded());
    }

    let history = h.studio.history("main.crm.customers").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_active && !history[1].is_active);
}
