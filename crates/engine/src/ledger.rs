//! RuleVersionLedger: append-only, per-table rule-set versions.
//!
//! Version allocation is a single storage commit conditional on the head the
//! proposer read. A proposer that loses a race gets `VersionConflict` from
//! storage, re-reads the head, and tries again with the next free number.
//! After `max_attempts` losses the conflict is surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use dqstudio_core::config::{LedgerSettings, DEFAULT_MAX_PROPOSE_ATTEMPTS};
use dqstudio_core::{RuleSet, StudioError};
use dqstudio_storage::{LedgerStorage, StorageError, VersionRecord};
use rand::Rng;

/// Fewest attempts `propose` will make; one retry is always allowed.
pub const MIN_PROPOSE_ATTEMPTS: u32 = 2;

/// What a new version records besides its rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub prompt: Option<String>,
    pub ai_summary: Option<serde_json::Value>,
}

pub struct RuleVersionLedger<S: LedgerStorage> {
    storage: Arc<S>,
    max_attempts: u32,
}

impl<S: LedgerStorage> Clone for RuleVersionLedger<S> {
    fn clone(&self) -> Self {
        RuleVersionLedger {
            storage: Arc::clone(&self.storage),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S: LedgerStorage> RuleVersionLedger<S> {
    pub fn new(storage: S) -> Self {
        Self::with_shared(Arc::new(storage))
    }

    pub fn with_shared(storage: Arc<S>) -> Self {
        RuleVersionLedger {
            storage,
            max_attempts: DEFAULT_MAX_PROPOSE_ATTEMPTS,
        }
    }

    pub fn from_settings(storage: S, settings: &LedgerSettings) -> Self {
        Self::new(storage).with_max_attempts(settings.max_propose_attempts)
    }

    /// Values below [`MIN_PROPOSE_ATTEMPTS`] are raised to it.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(MIN_PROPOSE_ATTEMPTS);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Store `rules` as the new active version of `table_name`.
    pub async fn propose(
        &self,
        table_name: &str,
        rules: RuleSet,
        prompt: Option<String>,
        created_by: &str,
    ) -> Result<VersionRecord, StudioError> {
        let proposal = Proposal {
            prompt,
            ai_summary: None,
        };
        self.propose_with(table_name, rules, proposal, created_by).await
    }

    /// [`propose`](Self::propose) with every optional field.
    pub async fn propose_with(
        &self,
        table_name: &str,
        rules: RuleSet,
        proposal: Proposal,
        created_by: &str,
    ) -> Result<VersionRecord, StudioError> {
        let table_name = table_name.trim();
        if table_name.is_empty() {
            return Err(StudioError::InvalidInput("table name must not be empty".to_string()));
        }

        let mut attempt = 1;
        loop {
            match self.try_propose(table_name, &rules, &proposal, created_by).await {
                Ok(record) => {
                    tracing::info!(
                        table = table_name,
                        version = record.version,
                        attempt,
                        created_by,
                        digest = %record.rules_digest,
                        "rule set version committed"
                    );
                    return Ok(record);
                }
                Err(StorageError::VersionConflict { version, .. }) if attempt < self.max_attempts => {
                    tracing::warn!(
                        table = table_name,
                        version,
                        attempt,
                        "version allocation conflict; retrying with a fresh head"
                    );
                    tokio::time::sleep(retry_pause(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    if let StorageError::VersionConflict { version, .. } = &err {
                        tracing::warn!(
                            table = table_name,
                            version,
                            attempts = attempt,
                            "giving up on version allocation"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
    }

    async fn try_propose(
        &self,
        table_name: &str,
        rules: &RuleSet,
        proposal: &Proposal,
        created_by: &str,
    ) -> Result<VersionRecord, StorageError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let staged = async {
            let head = self.storage.read_head(&mut snap, table_name).await?;
            let record = VersionRecord::new_active(
                table_name,
                head.next_version(),
                rules.clone(),
                proposal.prompt.clone(),
                proposal.ai_summary.clone(),
                created_by,
            );
            self.storage
                .stage_version(&mut snap, record.clone(), head)
                .await?;
            Ok::<_, StorageError>(record)
        }
        .await;

        match staged {
            Ok(record) => {
                self.storage.commit_snapshot(snap).await?;
                Ok(record)
            }
            Err(err) => {
                if let Err(abort_err) = self.storage.abort_snapshot(snap).await {
                    tracing::warn!(
                        table = table_name,
                        error = %abort_err,
                        cause = %err,
                        "failed to abort snapshot after staging error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Every version of `table_name`, newest first.
    pub async fn history(&self, table_name: &str) -> Result<Vec<VersionRecord>, StudioError> {
        Ok(self.storage.list_versions(table_name.trim()).await?)
    }

    pub async fn active(&self, table_name: &str) -> Result<Option<VersionRecord>, StudioError> {
        Ok(self.storage.get_active(table_name.trim()).await?)
    }

    pub async fn version(
        &self,
        table_name: &str,
        version: i64,
    ) -> Result<Option<VersionRecord>, StudioError> {
        Ok(self.storage.get_version(table_name.trim(), version).await?)
    }

    /// Tables with at least one version, sorted.
    pub async fn tables(&self) -> Result<Vec<String>, StudioError> {
        Ok(self.storage.list_tables().await?)
    }
}

/// A few milliseconds, growing with the attempt, so racing writers spread out.
fn retry_pause(attempt: u32) -> Duration {
    let ceiling = 5 * u64::from(attempt.min(8));
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
}
