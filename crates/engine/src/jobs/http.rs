//! Jobs API client: `run-now`, `runs/get`, `runs/get-output`.
//!
//! Each [`JobKind`] maps to a pre-defined remote job; submitting triggers a
//! run of that job with the input as notebook parameters. The run id is the
//! [`JobId`].

use std::time::Duration;

use async_trait::async_trait;
use dqstudio_core::validation::remote_failure;
use dqstudio_core::{Credential, StudioConfig, StudioError};
use serde_json::{json, Value};

use super::{JobId, JobKind, JobPlatform, JobRequest, JobState, RemoteStatus};
use crate::http::{HttpClient, HttpError};

const RUN_NOW_PATH: &str = "/api/2.1/jobs/run-now";
const RUNS_GET_PATH: &str = "/api/2.1/jobs/runs/get";
const RUNS_GET_OUTPUT_PATH: &str = "/api/2.1/jobs/runs/get-output";

pub struct JobsClient {
    http: HttpClient,
    generation_job_id: Option<u64>,
    validation_job_id: Option<u64>,
}

impl JobsClient {
    pub fn new(http: HttpClient, generation_job_id: Option<u64>, validation_job_id: Option<u64>) -> Self {
        JobsClient {
            http,
            generation_job_id,
            validation_job_id,
        }
    }

    pub fn from_config(config: &StudioConfig) -> Result<Self, StudioError> {
        if config.host().is_empty() {
            return Err(StudioError::InvalidInput(
                "workspace.host is required for jobs".to_string(),
            ));
        }
        let http = HttpClient::new(
            config.host(),
            Duration::from_secs(config.jobs.request_timeout_secs),
        );
        Ok(JobsClient::new(
            http,
            config.jobs.generation_job_id,
            config.jobs.validation_job_id,
        ))
    }

    fn job_id_for(&self, kind: JobKind) -> Option<u64> {
        match kind {
            JobKind::Generation => self.generation_job_id,
            JobKind::Validation => self.validation_job_id,
        }
    }

    async fn fetch_output(&self, run: &Value, job_id: &JobId, credential: &Credential) -> Result<Value, StudioError> {
        let output_id = match output_run_id(run) {
            Some(id) => id,
            None => run_id(job_id)?,
        };
        let path = format!("{RUNS_GET_OUTPUT_PATH}?run_id={output_id}");
        let output = self
            .http
            .get_json(&path, credential)
            .await
            .map_err(|e| map_poll_error(e, job_id))?;
        Ok(notebook_result(&output))
    }
}

#[async_trait]
impl JobPlatform for JobsClient {
    async fn submit(&self, request: &JobRequest, credential: &Credential) -> Result<JobId, StudioError> {
        let remote_job = self.job_id_for(request.kind).ok_or_else(|| {
            StudioError::SubmissionRejected(format!("no {} job is configured", request.kind))
        })?;

        let mut params = request.input_ref.parameters.clone();
        params.insert("table_name".to_string(), request.input_ref.table_name.clone());
        let body = json!({ "job_id": remote_job, "notebook_params": params });

        let response = self
            .http
            .post_json(RUN_NOW_PATH, body, credential)
            .await
            .map_err(map_submit_error)?;
        response
            .get("run_id")
            .and_then(|id| id.as_u64().map(|n| n.to_string()).or_else(|| id.as_str().map(str::to_string)))
            .map(JobId::new)
            .ok_or_else(|| StudioError::PlatformUnavailable("run-now response has no run_id".to_string()))
    }

    async fn status(&self, job_id: &JobId, credential: &Credential) -> Result<RemoteStatus, StudioError> {
        let path = format!("{RUNS_GET_PATH}?run_id={}", run_id(job_id)?);
        let run = self
            .http
            .get_json(&path, credential)
            .await
            .map_err(|e| map_poll_error(e, job_id))?;

        let mut status = map_run_state(&run);
        if status.state == JobState::Succeeded {
            let payload = self.fetch_output(&run, job_id, credential).await?;
            apply_output(&mut status, payload);
        }
        Ok(status)
    }
}

/// Run ids are numeric; anything else never reaches a query string.
fn run_id(job_id: &JobId) -> Result<u64, StudioError> {
    job_id
        .as_str()
        .parse()
        .map_err(|_| StudioError::InvalidInput(format!("'{job_id}' is not a run id")))
}

/// Fold a successful run's output into its status. The notebook may finish
/// "successfully" while reporting failure, or without any output at all.
fn apply_output(status: &mut RemoteStatus, payload: Value) {
    let failure = if payload.is_null() {
        Some("run produced no output".to_string())
    } else {
        remote_failure(&payload)
    };
    match failure {
        Some(message) => {
            status.state = JobState::Failed;
            status.error = Some(message);
            status.result = None;
        }
        None => status.result = Some(payload),
    }
}

fn map_submit_error(err: HttpError) -> StudioError {
    match &err {
        HttpError::Status { status: 401 | 403, message } => StudioError::Unauthorized(message.clone()),
        e if e.is_transient() => StudioError::PlatformUnavailable(err.to_string()),
        HttpError::Status { message, .. } => StudioError::SubmissionRejected(message.clone()),
        HttpError::Decode(_) | HttpError::Transport(_) => StudioError::PlatformUnavailable(err.to_string()),
    }
}

fn map_poll_error(err: HttpError, job_id: &JobId) -> StudioError {
    match &err {
        HttpError::Status { status: 401 | 403, message } => StudioError::Unauthorized(message.clone()),
        HttpError::Status { status: 400 | 404, message } => {
            StudioError::JobFailed(format!("run {job_id} not found: {message}"))
        }
        _ => StudioError::PlatformUnavailable(err.to_string()),
    }
}

/// Map a `runs/get` body onto the job state machine.
pub(crate) fn map_run_state(run: &Value) -> RemoteStatus {
    let life_cycle = run
        .pointer("/state/life_cycle_state")
        .and_then(Value::as_str)
        .unwrap_or("PENDING");
    let result_state = run.pointer("/state/result_state").and_then(Value::as_str);
    let message = run
        .pointer("/state/state_message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let state = match (life_cycle, result_state) {
        ("PENDING" | "QUEUED" | "BLOCKED" | "WAITING_FOR_RETRY", _) => JobState::Submitted,
        ("RUNNING" | "TERMINATING", _) => JobState::Running,
        ("TERMINATED", Some("SUCCESS")) => JobState::Succeeded,
        ("TERMINATED", Some("CANCELED")) => JobState::Cancelled,
        ("TERMINATED", Some(_)) | ("INTERNAL_ERROR" | "SKIPPED", _) => JobState::Failed,
        // Includes TERMINATED without a result state yet.
        _ => JobState::Running,
    };

    let error = (state == JobState::Failed).then(|| {
        message.unwrap_or_else(|| format!("run ended in {}", result_state.unwrap_or(life_cycle)))
    });

    RemoteStatus {
        state,
        progress: Some(life_cycle.to_string()),
        result: None,
        error,
    }
}

/// Multi-task runs keep their output on the task run, not the parent.
fn output_run_id(run: &Value) -> Option<u64> {
    run.get("tasks")
        .and_then(Value::as_array)
        .and_then(|tasks| tasks.first())
        .and_then(|task| task.get("run_id"))
        .and_then(|id| id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok())))
}

/// The notebook's exit value, parsed as JSON when it is JSON text.
pub(crate) fn notebook_result(output: &Value) -> Value {
    match output.pointer("/notebook_output/result") {
        Some(Value::String(text)) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        Some(other) => other.clone(),
        None => match output.get("error").and_then(Value::as_str) {
            Some(error) => json!({ "success": false, "error": error }),
            None => Value::Null,
        },
    }
}
