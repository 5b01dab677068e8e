use std::future::Future;
use std::sync::Arc;

use super::{check_history, commit_against, propose, TestResult};
use crate::{LedgerStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_commits_same_head_exactly_one_wins",
        concurrent_commits_same_head_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_retrying_proposers_get_distinct_versions",
        concurrent_retrying_proposers_get_distinct_versions(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_commits_different_tables_all_succeed",
        concurrent_commits_different_tables_all_succeed(factory).await,
    ));

    results
}

// ── Same head: exactly one wins ─────────────────────────────────────────────

/// N tasks stage version 2 against the same head and commit in parallel.
/// Exactly one commit succeeds; the rest must get VersionConflict.
async fn concurrent_commits_same_head_exactly_one_wins<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    propose(&*storage, "orders", "seed")
        .await
        .map_err(|e| format!("propose v1: {e}"))?;

    let head = {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let head = storage
            .read_head(&mut snap, "orders")
            .await
            .map_err(|e| format!("read_head: {e}"))?;
        storage
            .abort_snapshot(snap)
            .await
            .map_err(|e| format!("abort: {e}"))?;
        head
    };

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match commit_against(&*s, "orders", head, &format!("user{i}")).await {
                Ok(()) => Ok(true), // won the race
                Err(StorageError::VersionConflict { .. }) => Ok(false), // lost the race
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }

    let versions: Vec<i64> = storage
        .list_versions("orders")
        .await
        .map_err(|e| format!("list_versions: {e}"))?
        .iter()
        .map(|r| r.version)
        .collect();
    if versions != vec![2, 1] {
        return Err(format!("expected [2, 1], got {versions:?}"));
    }
    check_history(&*storage, "orders").await
}

// ── Retrying proposers: N distinct versions ─────────────────────────────────

/// N tasks each propose, re-reading the head after every conflict, until
/// they land. The table must end with versions 1..=N and one active record.
async fn concurrent_retrying_proposers_get_distinct_versions<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let author = format!("user{i}");
            let mut attempts = 0usize;
            loop {
                attempts += 1;
                match propose(&*s, "orders", &author).await {
                    Ok(version) => return Ok(version),
                    Err(StorageError::VersionConflict { .. }) if attempts < N * 4 => {
                        tokio::task::yield_now().await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        let version = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        versions.push(version);
    }
    versions.sort_unstable();
    let expected: Vec<i64> = (1..=N as i64).collect();
    if versions != expected {
        return Err(format!("expected versions {expected:?}, got {versions:?}"));
    }

    let active = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?
        .ok_or("no active version")?;
    if active.version != N as i64 {
        return Err(format!("expected v{N} active, got v{}", active.version));
    }
    check_history(&*storage, "orders").await
}

// ── Different tables: all succeed ───────────────────────────────────────────

async fn concurrent_commits_different_tables_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            propose(&*s, &format!("table_{i}"), "ana").await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let version = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("table_{i}: {e}"))?;
        if version != 1 {
            return Err(format!("table_{i} expected version 1, got {version}"));
        }
    }

    let tables = storage
        .list_tables()
        .await
        .map_err(|e| format!("list_tables: {e}"))?;
    if tables.len() != N {
        return Err(format!("expected {N} tables, got {}", tables.len()));
    }
    Ok(())
}
