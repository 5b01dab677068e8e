use std::future::Future;

use super::{check_history, commit_against, make_record, propose, TestResult};
use crate::{LedgerStorage, StorageError};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    // Visibility
    results.push(TestResult::from_result(
        "commit",
        "staged_version_invisible_before_commit",
        staged_version_invisible_before_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "aborted_snapshot_writes_nothing",
        aborted_snapshot_writes_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "empty_snapshot_commit_is_noop",
        empty_snapshot_commit_is_noop(factory).await,
    ));

    // Stale heads
    results.push(TestResult::from_result(
        "commit",
        "stale_head_returns_conflict",
        stale_head_returns_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "conflicting_commit_writes_nothing",
        conflicting_commit_writes_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "retry_after_conflict_takes_next_version",
        retry_after_conflict_takes_next_version(factory).await,
    ));

    results
}

async fn staged_version_invisible_before_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let head = storage
        .read_head(&mut snap, "orders")
        .await
        .map_err(|e| format!("read_head: {e}"))?;
    let record = make_record("orders", head.next_version(), "ana").map_err(|e| e.to_string())?;
    storage
        .stage_version(&mut snap, record, head)
        .await
        .map_err(|e| format!("stage: {e}"))?;

    let before = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?;
    if before.is_some() {
        return Err("staged version visible before commit".to_string());
    }

    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let after = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?;
    if after.map(|r| r.version) != Some(1) {
        return Err("committed version not visible".to_string());
    }
    Ok(())
}

async fn aborted_snapshot_writes_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose v1: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let head = storage
        .read_head(&mut snap, "orders")
        .await
        .map_err(|e| format!("read_head: {e}"))?;
    let record = make_record("orders", head.next_version(), "bo").map_err(|e| e.to_string())?;
    storage
        .stage_version(&mut snap, record, head)
        .await
        .map_err(|e| format!("stage: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let history = storage
        .list_versions("orders")
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    if history.len() != 1 || !history[0].is_active || history[0].version != 1 {
        return Err(format!(
            "abort changed history: {:?}",
            history
                .iter()
                .map(|r| (r.version, r.is_active))
                .collect::<Vec<_>>()
        ));
    }
    // The aborted version number is still free.
    let next = propose(&storage, "orders", "bo")
        .await
        .map_err(|e| format!("propose after abort: {e}"))?;
    if next != 2 {
        return Err(format!("expected version 2 after abort, got {next}"));
    }
    Ok(())
}

async fn empty_snapshot_commit_is_noop<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let tables = storage
        .list_tables()
        .await
        .map_err(|e| format!("list_tables: {e}"))?;
    if !tables.is_empty() {
        return Err(format!("empty commit created tables: {tables:?}"));
    }
    Ok(())
}

async fn stale_head_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let stale = storage
        .read_head(&mut snap, "orders")
        .await
        .map_err(|e| format!("read_head: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose: {e}"))?;

    match commit_against(&storage, "orders", stale, "bo").await {
        Err(StorageError::VersionConflict {
            table_name,
            version,
        }) => {
            if table_name != "orders" || version != 1 {
                return Err(format!(
                    "conflict names wrong version: {table_name} v{version}"
                ));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected VersionConflict, got {e}")),
        Ok(()) => Err("commit against stale head succeeded".to_string()),
    }
}

async fn conflicting_commit_writes_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose v1: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let stale = storage
        .read_head(&mut snap, "orders")
        .await
        .map_err(|e| format!("read_head: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    propose(&storage, "orders", "carl")
        .await
        .map_err(|e| format!("propose v2: {e}"))?;
    let before = storage
        .list_versions("orders")
        .await
        .map_err(|e| format!("list before: {e}"))?;

    if commit_against(&storage, "orders", stale, "bo").await.is_ok() {
        return Err("stale commit succeeded".to_string());
    }

    let after = storage
        .list_versions("orders")
        .await
        .map_err(|e| format!("list after: {e}"))?;
    if before != after {
        return Err("failed commit modified history".to_string());
    }
    check_history(&storage, "orders").await
}

async fn retry_after_conflict_takes_next_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let stale = storage
        .read_head(&mut snap, "orders")
        .await
        .map_err(|e| format!("read_head: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose: {e}"))?;
    if commit_against(&storage, "orders", stale, "bo").await.is_ok() {
        return Err("stale commit succeeded".to_string());
    }
    let retried = propose(&storage, "orders", "bo")
        .await
        .map_err(|e| format!("retry: {e}"))?;
    if retried != 2 {
        return Err(format!("retry should take version 2, got {retried}"));
    }
    let active = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?
        .ok_or("no active version")?;
    if active.created_by != "bo" {
        return Err(format!("expected bo's version active, got {}", active.created_by));
    }
    check_history(&storage, "orders").await
}
