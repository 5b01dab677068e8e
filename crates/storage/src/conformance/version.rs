use std::future::Future;

use super::{check_history, propose, TestResult};
use crate::LedgerStorage;

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "version",
        "empty_table_has_zero_head",
        empty_table_has_zero_head(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "first_version_is_one",
        first_version_is_one(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "versions_increment_sequentially",
        versions_increment_sequentially(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "new_version_deactivates_previous",
        new_version_deactivates_previous(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "tables_are_versioned_independently",
        tables_are_versioned_independently(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "record_fields_round_trip",
        record_fields_round_trip(factory).await,
    ));

    results
}

async fn empty_table_has_zero_head<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    if head.max_version != 0 || head.active_version.is_some() {
        return Err(format!("expected empty head, got {head:?}"));
    }
    if head.next_version() != 1 {
        return Err(format!("expected next version 1, got {}", head.next_version()));
    }
    Ok(())
}

async fn first_version_is_one<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let version = propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose: {e}"))?;
    if version != 1 {
        return Err(format!("expected version 1, got {version}"));
    }
    let active = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?
        .ok_or("no active version after first commit")?;
    if active.version != 1 || !active.is_active {
        return Err(format!("unexpected active record: v{}", active.version));
    }
    Ok(())
}

async fn versions_increment_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for expected in 1..=5 {
        let version = propose(&storage, "orders", &format!("user{expected}"))
            .await
            .map_err(|e| format!("propose #{expected}: {e}"))?;
        if version != expected {
            return Err(format!("expected version {expected}, got {version}"));
        }
    }
    let versions: Vec<i64> = storage
        .list_versions("orders")
        .await
        .map_err(|e| format!("list_versions: {e}"))?
        .iter()
        .map(|r| r.version)
        .collect();
    if versions != vec![5, 4, 3, 2, 1] {
        return Err(format!("expected [5, 4, 3, 2, 1], got {versions:?}"));
    }
    check_history(&storage, "orders").await
}

async fn new_version_deactivates_previous<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose v1: {e}"))?;
    propose(&storage, "orders", "bo")
        .await
        .map_err(|e| format!("propose v2: {e}"))?;

    let v1 = storage
        .get_version("orders", 1)
        .await
        .map_err(|e| format!("get v1: {e}"))?
        .ok_or("v1 missing")?;
    let v2 = storage
        .get_version("orders", 2)
        .await
        .map_err(|e| format!("get v2: {e}"))?
        .ok_or("v2 missing")?;
    if v1.is_active {
        return Err("v1 still active after v2 committed".to_string());
    }
    if !v2.is_active {
        return Err("v2 not active".to_string());
    }
    if v1.rules == v2.rules {
        return Err("v1 rules were overwritten by v2".to_string());
    }
    check_history(&storage, "orders").await
}

async fn tables_are_versioned_independently<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("orders v1: {e}"))?;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("orders v2: {e}"))?;
    let customers = propose(&storage, "customers", "ana")
        .await
        .map_err(|e| format!("customers v1: {e}"))?;
    if customers != 1 {
        return Err(format!("customers should start at 1, got {customers}"));
    }
    let tables = storage
        .list_tables()
        .await
        .map_err(|e| format!("list_tables: {e}"))?;
    if tables != vec!["customers".to_string(), "orders".to_string()] {
        return Err(format!("unexpected tables: {tables:?}"));
    }
    let active = storage
        .get_active("orders")
        .await
        .map_err(|e| format!("get_active: {e}"))?
        .ok_or("orders lost its active version")?;
    if active.version != 2 {
        return Err(format!("orders active should be 2, got {}", active.version));
    }
    Ok(())
}

async fn record_fields_round_trip<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let mut record = super::make_record("orders", head.next_version(), "ana")
        .map_err(|e| format!("make_record: {e}"))?;
    record.ai_summary = Some(serde_json::json!({"summary": "ids present", "risk_level": "low"}));
    let written = record.clone();
    storage
        .stage_version(&mut snap, record, head)
        .await
        .map_err(|e| format!("stage: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let read = storage
        .get_version("orders", 1)
        .await
        .map_err(|e| format!("get_version: {e}"))?
        .ok_or("committed version missing")?;
    if read != written {
        return Err(format!("stored record differs: {read:?} vs {written:?}"));
    }
    Ok(())
}
