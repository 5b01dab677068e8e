//! JobOrchestrator: fire-and-poll lifecycle for remote generation and
//! validation jobs.
//!
//! ## State machine
//!
//! `Submitted -> Running -> {Succeeded, Failed, Cancelled}`. Terminal states
//! are absorbing: the first terminal observation of a job is cached and every
//! later `poll` returns that cached value without asking the platform again.
//!
//! ## Polling
//!
//! The orchestrator never sleeps and has no "wait until done" call. Callers
//! own the poll loop and its schedule; [`Backoff`] provides one.
//!
//! ## Credentials
//!
//! Submitting and polling always use the `PrivilegedJobTrigger` credential
//! resolved from the service identity, whatever the caller presents.
//!
//! ## Retention
//!
//! The orchestrator remembers at most [`DEFAULT_MAX_TRACKED_JOBS`] jobs unless
//! configured otherwise. Finished jobs are dropped before running ones.

mod backoff;
mod http;

pub use backoff::Backoff;
pub use http::JobsClient;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dqstudio_core::{
    Credential, CredentialSelector, OperationClass, RequestContext, RuleSet, StudioError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use dqstudio_core::config::DEFAULT_MAX_TRACKED_JOBS;

/// What a job computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Natural-language prompt to candidate rule set.
    Generation,
    /// Rule set run against a table.
    Validation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Generation => "generation",
            JobKind::Validation => "validation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque job identifier issued by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The table a job works on plus its string parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub table_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl InputRef {
    pub fn new(table_name: impl Into<String>) -> Self {
        InputRef {
            table_name: table_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Input for a generation job: the table and the user's request.
    pub fn generation(table_name: &str, prompt: &str) -> Self {
        InputRef::new(table_name).with_parameter("prompt", prompt)
    }

    /// Input for a validation job: the table and the rules as JSON text.
    pub fn validation(table_name: &str, rules: &RuleSet) -> Self {
        InputRef::new(table_name).with_parameter("rules", rules.to_json_string())
    }
}

/// What the orchestrator hands to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub kind: JobKind,
    pub input_ref: InputRef,
}

/// A submitted job as tracked by this process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// RFC 3339 timestamp.
    pub submitted_at: String,
    pub state: JobState,
    pub input_ref: InputRef,
    pub result: Option<Value>,
}

/// The platform's answer to one status check.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub state: JobState,
    /// Free-form progress hint, e.g. the platform's life-cycle state.
    pub progress: Option<String>,
    /// Output payload, present once `state` is `Succeeded`.
    pub result: Option<Value>,
    /// Failure reason, present once `state` is `Failed`.
    pub error: Option<String>,
}

impl RemoteStatus {
    pub fn pending(state: JobState) -> Self {
        RemoteStatus {
            state,
            progress: None,
            result: None,
            error: None,
        }
    }
}

/// Result of one `poll`. Not stored except when terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPollResult {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobPollResult {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// The remote job-execution platform.
#[async_trait]
pub trait JobPlatform: Send + Sync {
    /// Start a job. Returns as soon as the platform has accepted it.
    async fn submit(&self, request: &JobRequest, credential: &Credential)
        -> Result<JobId, StudioError>;

    /// One status check. Never blocks waiting for completion.
    async fn status(&self, job_id: &JobId, credential: &Credential)
        -> Result<RemoteStatus, StudioError>;
}

#[derive(Debug, Clone)]
struct Tracked {
    job: Option<Job>,
    /// Highest non-terminal state reported so far.
    last_state: JobState,
    terminal: Option<JobPollResult>,
}

impl Tracked {
    fn untracked() -> Self {
        Tracked {
            job: None,
            last_state: JobState::Submitted,
            terminal: None,
        }
    }
}

/// Tracked jobs plus their recency order, least recently touched first.
#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<JobId, Tracked>,
    order: VecDeque<JobId>,
}

impl Registry {
    fn touch(&mut self, job_id: &JobId) {
        self.order.retain(|id| id != job_id);
        self.order.push_back(job_id.clone());
    }

    fn insert(&mut self, job_id: JobId, tracked: Tracked) {
        self.touch(&job_id);
        self.entries.insert(job_id, tracked);
    }

    fn remove(&mut self, job_id: &JobId) -> Option<Tracked> {
        self.order.retain(|id| id != job_id);
        self.entries.remove(job_id)
    }

    /// Drop entries until at most `capacity` remain, never `keep`.
    /// Terminal entries go first, least recently touched first.
    fn evict(&mut self, capacity: usize, keep: &JobId) -> Vec<JobId> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let candidate = self
                .order
                .iter()
                .filter(|id| *id != keep)
                .find(|id| self.entries.get(*id).is_some_and(|t| t.terminal.is_some()))
                .or_else(|| self.order.iter().find(|id| *id != keep))
                .cloned();
            let Some(job_id) = candidate else {
                break;
            };
            self.remove(&job_id);
            evicted.push(job_id);
        }
        evicted
    }
}

/// Submits jobs and exposes a non-blocking polling contract.
///
/// At most `capacity` jobs are remembered. Past that, the least recently
/// finished jobs are dropped first; a dropped job can still be polled, which
/// asks the platform again.
pub struct JobOrchestrator {
    platform: Arc<dyn JobPlatform>,
    selector: Arc<CredentialSelector>,
    capacity: usize,
    tracked: RwLock<Registry>,
}

impl JobOrchestrator {
    pub fn new(platform: Arc<dyn JobPlatform>, selector: Arc<CredentialSelector>) -> Self {
        JobOrchestrator {
            platform,
            selector,
            capacity: DEFAULT_MAX_TRACKED_JOBS,
            tracked: RwLock::new(Registry::default()),
        }
    }

    /// Remember at most `capacity` jobs (at least one).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn service_credential(&self, ctx: &RequestContext) -> Result<Credential, StudioError> {
        Ok(self
            .selector
            .resolve(OperationClass::PrivilegedJobTrigger, ctx)?)
    }

    /// Submit a job. The caller context only attributes the request; the
    /// platform always sees the service-principal credential.
    pub async fn submit(
        &self,
        kind: JobKind,
        input_ref: InputRef,
        ctx: &RequestContext,
    ) -> Result<Job, StudioError> {
        if input_ref.table_name.trim().is_empty() {
            return Err(StudioError::SubmissionRejected(
                "input table name is empty".to_string(),
            ));
        }
        let credential = self.service_credential(ctx)?;
        let request = JobRequest { kind, input_ref };
        let id = self.platform.submit(&request, &credential).await.map_err(|e| {
            tracing::warn!(kind = %kind, table = %request.input_ref.table_name, error = %e, "job submission failed");
            e
        })?;

        let job = Job {
            id: id.clone(),
            kind,
            submitted_at: dqstudio_core::now_rfc3339(),
            state: JobState::Submitted,
            input_ref: request.input_ref,
            result: None,
        };
        tracing::info!(
            job_id = %id,
            kind = %kind,
            table = %job.input_ref.table_name,
            caller = ctx.caller_or_anonymous(),
            "job submitted"
        );
        let mut tracked = self.write();
        tracked.insert(
            id.clone(),
            Tracked {
                job: Some(job.clone()),
                ..Tracked::untracked()
            },
        );
        self.evict(&mut tracked, &id);
        Ok(job)
    }

    /// One status check. Once a terminal state has been observed for
    /// `job_id`, returns the cached observation without a remote call.
    pub async fn poll(&self, job_id: &JobId) -> Result<JobPollResult, StudioError> {
        if let Some(cached) = self.cached_terminal(job_id) {
            return Ok(cached);
        }

        let credential = self.service_credential(&RequestContext::anonymous())?;
        let status = self.platform.status(job_id, &credential).await?;

        let mut tracked = self.write();
        if !tracked.entries.contains_key(job_id) {
            tracked.insert(job_id.clone(), Tracked::untracked());
        }
        let Some(entry) = tracked.entries.get_mut(job_id) else {
            return Err(StudioError::JobFailed(format!("job {job_id} is not tracked")));
        };

        // A concurrent poll may have finalized the job while we were waiting.
        if let Some(terminal) = &entry.terminal {
            return Ok(terminal.clone());
        }

        let previous = entry.last_state;
        let state = if status.state.is_terminal() || status.state == JobState::Running {
            status.state
        } else {
            previous
        };
        let result = JobPollResult {
            job_id: job_id.clone(),
            state,
            progress: status.progress,
            result: if state == JobState::Succeeded {
                status.result
            } else {
                None
            },
            error: if state == JobState::Failed {
                Some(
                    status
                        .error
                        .unwrap_or_else(|| "job failed without details".to_string()),
                )
            } else {
                None
            },
        };

        if state != previous {
            tracing::info!(job_id = %job_id, from = %previous, to = %state, "job state changed");
        }
        entry.last_state = state;
        if let Some(job) = entry.job.as_mut() {
            job.state = state;
            job.result = result.result.clone();
        }
        if state.is_terminal() {
            entry.terminal = Some(result.clone());
            tracked.touch(job_id);
        }
        self.evict(&mut tracked, job_id);
        Ok(result)
    }

    /// The output of a finished job.
    ///
    /// `JobNotTerminal` until a terminal state has been observed by `poll`;
    /// `JobFailed` for failed and cancelled jobs.
    pub fn result(&self, job_id: &JobId) -> Result<Value, StudioError> {
        let terminal = self
            .cached_terminal(job_id)
            .ok_or_else(|| StudioError::JobNotTerminal {
                job_id: job_id.to_string(),
            })?;
        match terminal.state {
            JobState::Succeeded => Ok(terminal.result.unwrap_or(Value::Null)),
            JobState::Failed => Err(StudioError::JobFailed(
                terminal
                    .error
                    .unwrap_or_else(|| "job failed without details".to_string()),
            )),
            _ => Err(StudioError::JobFailed("job was cancelled".to_string())),
        }
    }

    /// The tracked record of a job submitted through this orchestrator.
    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.read().entries.get(job_id).and_then(|t| t.job.clone())
    }

    /// All jobs submitted through this orchestrator, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read()
            .entries
            .values()
            .filter_map(|t| t.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Number of jobs currently remembered, including polled-only ones.
    pub fn tracked_len(&self) -> usize {
        self.read().entries.len()
    }

    /// Drop a finished job. Returns false (and keeps it) if the job is
    /// unknown or not yet terminal.
    pub fn forget(&self, job_id: &JobId) -> bool {
        let mut tracked = self.write();
        match tracked.entries.get(job_id) {
            Some(t) if t.terminal.is_some() => {
                tracked.remove(job_id);
                true
            }
            _ => false,
        }
    }

    fn evict(&self, tracked: &mut Registry, keep: &JobId) {
        for job_id in tracked.evict(self.capacity, keep) {
            tracing::debug!(job_id = %job_id, capacity = self.capacity, "job dropped from tracking");
        }
    }

    fn cached_terminal(&self, job_id: &JobId) -> Option<JobPollResult> {
        self.read().entries.get(job_id).and_then(|t| t.terminal.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.tracked.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.tracked.write().unwrap_or_else(|e| e.into_inner())
    }
}
