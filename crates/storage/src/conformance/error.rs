use std::future::Future;

use super::{make_record, propose, TestResult};
use crate::record::LedgerHead;
use crate::{LedgerStorage, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_version_missing_returns_none",
        get_version_missing_returns_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "list_versions_empty_for_unknown_table",
        list_versions_empty_for_unknown_table(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "stage_skipped_version_is_invalid",
        stage_skipped_version_is_invalid(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "stage_inactive_record_is_invalid",
        stage_inactive_record_is_invalid(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "stage_empty_table_name_is_invalid",
        stage_empty_table_name_is_invalid(factory).await,
    ));

    results
}

async fn get_version_missing_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    propose(&storage, "orders", "ana")
        .await
        .map_err(|e| format!("propose: {e}"))?;
    for (table, version) in [("orders", 2), ("orders", 0), ("customers", 1)] {
        let found = storage
            .get_version(table, version)
            .await
            .map_err(|e| format!("get_version {table} v{version}: {e}"))?;
        if found.is_some() {
            return Err(format!("{table} v{version} should not exist"));
        }
    }
    Ok(())
}

async fn list_versions_empty_for_unknown_table<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LedgerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let history = storage
        .list_versions("nope")
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    if !history.is_empty() {
        return Err(format!("expected empty history, got {} records", history.len()));
    }
    let active = storage
        .get_active("nope")
        .await
        .map_err(|e| format!("get_active: {e}"))?;
    if active.is_some() {
        return Err("unknown table has an active version".to_string());
    }
    Ok(())
}

async fn stage_skipped_version_is_invalid<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let record = make_record("orders", 3, "ana").map_err(|e| e.to_string())?;
    let result = storage
        .stage_version(&mut snap, record, LedgerHead::default())
        .await;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::InvalidRecord(_)) => Ok(()),
        Err(e) => Err(format!("expected InvalidRecord, got {e}")),
        Ok(()) => Err("staging version 3 on an empty table succeeded".to_string()),
    }
}

async fn stage_inactive_record_is_invalid<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let mut record = make_record("orders", 1, "ana").map_err(|e| e.to_string())?;
    record.is_active = false;
    let result = storage
        .stage_version(&mut snap, record, LedgerHead::default())
        .await;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::InvalidRecord(_)) => Ok(()),
        Err(e) => Err(format!("expected InvalidRecord, got {e}")),
        Ok(()) => Err("staging an inactive record succeeded".to_string()),
    }
}

async fn stage_empty_table_name_is_invalid<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let record = make_record("  ", 1, "ana").map_err(|e| e.to_string())?;
    let result = storage
        .stage_version(&mut snap, record, LedgerHead::default())
        .await;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::InvalidRecord(_)) => Ok(()),
        Err(e) => Err(format!("expected InvalidRecord, got {e}")),
        Ok(()) => Err("staging a blank table name succeeded".to_string()),
    }
}
