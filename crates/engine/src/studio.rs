//! RuleStudio: the request-level flows over the core components.
//!
//! Each method takes the caller's [`RequestContext`] explicitly and resolves
//! the credential its downstream call needs. Nothing about the caller is
//! stored between calls.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dqstudio_core::{
    CredentialSelector, OperationClass, RequestContext, RuleSet, StudioConfig, StudioError,
    ValidationReport,
};
use dqstudio_storage::{LedgerStorage, SqliteLedgerStorage, VersionRecord};
use serde::Serialize;

use crate::gateway::{ColumnDescription, TableName, TableSample, TabularQueryGateway, WarehouseClient};
use crate::jobs::{InputRef, Job, JobId, JobKind, JobOrchestrator, JobPollResult, JobsClient};
use crate::ledger::{Proposal, RuleVersionLedger};
use crate::relay::{AnalysisRelay, RelayOutcome, ServingEndpointClient, SummaryRequest};

/// Rows fetched to give the summarizer some context.
pub const ANALYSIS_SAMPLE_ROWS: usize = 20;

/// A candidate rule set the caller wants to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmRequest {
    pub table_name: String,
    pub rules: RuleSet,
    /// The natural-language request the rules came from, if any.
    pub prompt: Option<String>,
    /// Ask for an AI summary to store with the version.
    pub summarize: bool,
}

impl ConfirmRequest {
    pub fn new(table_name: impl Into<String>, rules: RuleSet) -> Self {
        ConfirmRequest {
            table_name: table_name.into(),
            rules,
            prompt: None,
            summarize: false,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_summary(mut self) -> Self {
        self.summarize = true;
        self
    }
}

/// The stored version and, when one was requested, how summarizing went.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub record: VersionRecord,
    pub summary: Option<RelayOutcome>,
}

pub struct RuleStudio<S: LedgerStorage> {
    selector: Arc<CredentialSelector>,
    gateway: TabularQueryGateway,
    orchestrator: Arc<JobOrchestrator>,
    ledger: RuleVersionLedger<S>,
    relay: AnalysisRelay,
}

impl<S: LedgerStorage> RuleStudio<S> {
    pub fn new(
        selector: Arc<CredentialSelector>,
        gateway: TabularQueryGateway,
        orchestrator: Arc<JobOrchestrator>,
        ledger: RuleVersionLedger<S>,
        relay: AnalysisRelay,
    ) -> Self {
        RuleStudio {
            selector,
            gateway,
            orchestrator,
            ledger,
            relay,
        }
    }

    /// Wire every component from configuration over the given ledger storage.
    ///
    /// The summary endpoint is optional; without one, `analyze` always
    /// degrades.
    pub fn from_config(config: &StudioConfig, storage: S) -> Result<Self, StudioError> {
        config.validate().map_err(|errors| {
            StudioError::InvalidInput(format!("invalid configuration: {}", errors.join("; ")))
        })?;

        let selector = Arc::new(CredentialSelector::from_config(config));
        let gateway = TabularQueryGateway::new(Arc::new(WarehouseClient::from_config(config)?));
        let orchestrator = Arc::new(
            JobOrchestrator::new(
                Arc::new(JobsClient::from_config(config)?),
                Arc::clone(&selector),
            )
            .with_capacity(config.jobs.max_tracked_jobs),
        );
        let ledger = RuleVersionLedger::from_settings(storage, &config.ledger);
        let relay = match ServingEndpointClient::from_config(config) {
            Some(client) => AnalysisRelay::new(Arc::new(client), Arc::clone(&selector))
                .with_timeout(Duration::from_secs(config.summary.timeout_secs)),
            None => {
                tracing::info!("no summary endpoint configured; analysis will be skipped");
                AnalysisRelay::disabled(Arc::clone(&selector))
            }
        };

        tracing::info!(
            host = config.host(),
            environment = ?config.workspace.environment,
            max_propose_attempts = ledger.max_attempts(),
            "rule studio configured"
        );
        Ok(RuleStudio::new(selector, gateway, orchestrator, ledger, relay))
    }

    pub fn ledger(&self) -> &RuleVersionLedger<S> {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn relay(&self) -> &AnalysisRelay {
        &self.relay
    }

    // ── Catalog ──────────────────────────────────────────────────────────────

    /// List the children of a catalog path: `""` lists catalogs, `"c"`
    /// lists schemas of `c`, `"c.s"` lists tables of `c.s`.
    pub async fn browse(&self, path: &str, ctx: &RequestContext) -> Result<Vec<String>, StudioError> {
        let credential = self.selector.resolve(OperationClass::UserDataAccess, ctx)?;
        let path = path.trim();
        let parts: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').collect()
        };
        match parts.as_slice() {
            [] => self.gateway.list_catalogs(&credential).await,
            [catalog] => self.gateway.list_schemas(catalog, &credential).await,
            [catalog, schema] => self.gateway.list_tables(catalog, schema, &credential).await,
            _ => Err(StudioError::MalformedQuery(format!(
                "cannot browse below a schema: '{path}'"
            ))),
        }
    }

    pub async fn describe(
        &self,
        table_name: &str,
        ctx: &RequestContext,
    ) -> Result<Vec<ColumnDescription>, StudioError> {
        let table = TableName::parse(table_name)?;
        let credential = self.selector.resolve(OperationClass::UserDataAccess, ctx)?;
        self.gateway.describe_table(&table, &credential).await
    }

    pub async fn sample(
        &self,
        table_name: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<TableSample, StudioError> {
        let table = TableName::parse(table_name)?;
        let credential = self.selector.resolve(OperationClass::UserDataAccess, ctx)?;
        self.gateway.sample_table(&table, limit, &credential).await
    }

    // ── Jobs ─────────────────────────────────────────────────────────────────

    /// Start a generation job turning `prompt` into rules for `table_name`.
    pub async fn request_rules(
        &self,
        table_name: &str,
        prompt: &str,
        ctx: &RequestContext,
    ) -> Result<Job, StudioError> {
        let table = job_table(table_name)?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(StudioError::SubmissionRejected(
                "generation prompt is empty".to_string(),
            ));
        }
        self.orchestrator
            .submit(
                JobKind::Generation,
                InputRef::generation(&table.to_string(), prompt),
                ctx,
            )
            .await
    }

    /// Start a validation job running `rules` against `table_name`.
    pub async fn request_validation(
        &self,
        table_name: &str,
        rules: &RuleSet,
        ctx: &RequestContext,
    ) -> Result<Job, StudioError> {
        let table = job_table(table_name)?;
        self.orchestrator
            .submit(
                JobKind::Validation,
                InputRef::validation(&table.to_string(), rules),
                ctx,
            )
            .await
    }

    pub async fn poll(&self, job_id: &JobId) -> Result<JobPollResult, StudioError> {
        self.orchestrator.poll(job_id).await
    }

    /// The rule set a finished generation job produced.
    pub fn generated_rules(&self, job_id: &JobId) -> Result<RuleSet, StudioError> {
        let payload = self.orchestrator.result(job_id)?;
        RuleSet::from_json(&payload).map_err(|e| {
            StudioError::JobFailed(format!("generation output is not a rule set: {e}"))
        })
    }

    /// The report a finished validation job produced.
    pub fn validation_report(&self, job_id: &JobId) -> Result<ValidationReport, StudioError> {
        let payload = self.orchestrator.result(job_id)?;
        ValidationReport::from_job_output(&payload).map_err(|e| StudioError::JobFailed(e.to_string()))
    }

    // ── Analysis ─────────────────────────────────────────────────────────────

    /// AI commentary on `rules`. Never fails: a missing sample only narrows
    /// the context, and a failed summary comes back degraded.
    pub async fn analyze(
        &self,
        table_name: &str,
        rules: &RuleSet,
        validation: Option<ValidationReport>,
        ctx: &RequestContext,
    ) -> RelayOutcome {
        let mut request = SummaryRequest::new(table_name.trim(), rules.clone());
        if let Some(report) = validation {
            request = request.with_validation(report);
        }
        if self.relay.is_enabled() {
            match self.sample(table_name, ANALYSIS_SAMPLE_ROWS, ctx).await {
                Ok(sample) => request = request.with_sample(sample),
                Err(err) => {
                    tracing::debug!(table = table_name, error = %err, "analyzing without a sample")
                }
            }
        }
        self.relay.summarize(&request, ctx).await
    }

    // ── Ledger ───────────────────────────────────────────────────────────────

    /// Persist a confirmed rule set as the table's new active version.
    ///
    /// Requires the caller's own credential. When a summary is requested it
    /// is attempted first and stored if it succeeds; a degraded summary is
    /// reported back but never blocks the write.
    pub async fn confirm(
        &self,
        request: ConfirmRequest,
        ctx: &RequestContext,
    ) -> Result<Confirmation, StudioError> {
        let table = TableName::parse(&request.table_name)
            .map_err(|e| StudioError::InvalidInput(e.to_string()))?;
        self.selector.resolve(OperationClass::UserStoragePersist, ctx)?;

        let table_name = table.to_string();
        let summary = if request.summarize {
            Some(self.analyze(&table_name, &request.rules, None, ctx).await)
        } else {
            None
        };
        let ai_summary = summary
            .as_ref()
            .and_then(RelayOutcome::summary)
            .and_then(|s| serde_json::to_value(s).ok());

        let proposal = Proposal {
            prompt: request.prompt.filter(|p| !p.trim().is_empty()),
            ai_summary,
        };
        let record = self
            .ledger
            .propose_with(&table_name, request.rules, proposal, ctx.caller_or_anonymous())
            .await?;
        Ok(Confirmation { record, summary })
    }

    pub async fn history(&self, table_name: &str) -> Result<Vec<VersionRecord>, StudioError> {
        self.ledger.history(table_name).await
    }

    pub async fn active(&self, table_name: &str) -> Result<Option<VersionRecord>, StudioError> {
        self.ledger.active(table_name).await
    }

    pub async fn version(
        &self,
        table_name: &str,
        version: i64,
    ) -> Result<Option<VersionRecord>, StudioError> {
        self.ledger.version(table_name, version).await
    }
}

fn job_table(table_name: &str) -> Result<TableName, StudioError> {
    TableName::parse(table_name).map_err(|e| StudioError::SubmissionRejected(e.to_string()))
}

/// The SQLite ledger named by `[ledger] database_path`, or an in-memory
/// SQLite ledger when none is set.
pub fn open_ledger_storage(config: &StudioConfig) -> Result<SqliteLedgerStorage, StudioError> {
    let storage = match config.ledger.database_path.as_deref() {
        Some(path) => open_file(path)?,
        None => {
            tracing::warn!("no ledger database_path configured; versions will not survive a restart");
            SqliteLedgerStorage::open_in_memory()?
        }
    };
    Ok(storage)
}

fn open_file(path: &Path) -> Result<SqliteLedgerStorage, StudioError> {
    let storage = SqliteLedgerStorage::open(path)?;
    tracing::info!(path = %path.display(), "ledger database opened");
    Ok(storage)
}
