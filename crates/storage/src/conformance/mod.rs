//! Conformance test suite for `LedgerStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `LedgerStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Version allocation**: sequential numbering, activation hand-off
//! - **Atomic commit**: aborted or conflicting snapshots write nothing
//! - **Error handling**: correct error variants for invalid records
//! - **Concurrency**: racing proposers, exactly one winner per version
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use dqstudio_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         SqliteLedgerStorage::open_in_memory().unwrap()
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod error;
mod version;

use std::fmt;
use std::future::Future;

use dqstudio_core::{Criticality, Rule, RuleSet};

use crate::record::{LedgerHead, VersionRecord};
use crate::{LedgerStorage, StorageError};

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "version", "commit", "concurrent").
    pub category: String,
    /// Test name (e.g. "first_version_is_one").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(version::run_version_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn make_rules(tag: &str) -> Result<RuleSet, StorageError> {
    let mut arguments = std::collections::BTreeMap::new();
    arguments.insert("column".to_string(), serde_json::json!(tag));
    let rule = Rule::new(
        format!("{tag}_not_null"),
        "is_not_null",
        arguments,
        Criticality::Error,
    );
    RuleSet::new(vec![rule]).map_err(|e| StorageError::InvalidRecord(e.to_string()))
}

fn make_record(table_name: &str, version: i64, author: &str) -> Result<VersionRecord, StorageError> {
    Ok(VersionRecord::new_active(
        table_name,
        version,
        make_rules(author)?,
        Some(format!("rules from {author}")),
        None,
        author,
    ))
}

/// Read the head, stage the next version and commit. Returns the version.
async fn propose<S: LedgerStorage>(
    storage: &S,
    table_name: &str,
    author: &str,
) -> Result<i64, StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    let head = storage.read_head(&mut snap, table_name).await?;
    let version = head.next_version();
    storage
        .stage_version(&mut snap, make_record(table_name, version, author)?, head)
        .await?;
    storage.commit_snapshot(snap).await?;
    Ok(version)
}

/// Stage against a head captured earlier, then commit.
async fn commit_against<S: LedgerStorage>(
    storage: &S,
    table_name: &str,
    head: LedgerHead,
    author: &str,
) -> Result<(), StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    storage
        .stage_version(
            &mut snap,
            make_record(table_name, head.next_version(), author)?,
            head,
        )
        .await?;
    storage.commit_snapshot(snap).await
}

/// Check that a table's stored history is consistent: unique positive
/// versions, at most one active, and the active one is the highest.
async fn check_history<S: LedgerStorage>(storage: &S, table_name: &str) -> Result<(), String> {
    let history = storage
        .list_versions(table_name)
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    crate::invariants::check_table(table_name, history.iter().map(|r| (r.version, r.is_active)))
        .map_err(|e| format!("{e}"))?;
    if history.windows(2).any(|w| w[0].version <= w[1].version) {
        return Err("history not ordered newest first".to_string());
    }
    let active = history.iter().filter(|r| r.is_active).count();
    if !history.is_empty() && (active != 1 || !history[0].is_active) {
        return Err(format!(
            "expected only the newest version active, found {active} active"
        ));
    }
    Ok(())
}
