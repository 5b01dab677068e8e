//! In-process `LedgerStorage` backend.
//!
//! Staged versions are buffered in the snapshot and applied under a single
//! lock at commit time, after the expected heads are re-checked. Suitable
//! for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::invariants::check_table;
use crate::record::{LedgerHead, StagedVersion, VersionRecord};
use crate::traits::LedgerStorage;

type Tables = HashMap<String, Vec<VersionRecord>>;

/// Ledger storage held in memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryLedgerStorage {
    tables: Arc<Mutex<Tables>>,
}

/// Buffered writes of one memory transaction.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    staged: Vec<StagedVersion>,
}

impl MemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // Recover data even if mutex was poisoned by a panic in another thread
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn head_of(records: Option<&Vec<VersionRecord>>) -> LedgerHead {
    match records {
        None => LedgerHead::default(),
        Some(records) => LedgerHead {
            max_version: records.iter().map(|r| r.version).max().unwrap_or(0),
            active_version: records.iter().find(|r| r.is_active).map(|r| r.version),
        },
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedgerStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.lock();

        // Apply to working copies first so a failure leaves nothing behind.
        let mut working: BTreeMap<String, Vec<VersionRecord>> = BTreeMap::new();
        for staged in &snapshot.staged {
            let table_name = staged.record.table_name.clone();
            let records = working
                .entry(table_name.clone())
                .or_insert_with(|| tables.get(&table_name).cloned().unwrap_or_default());

            let current = head_of(Some(records));
            if current != staged.expected {
                return Err(StorageError::VersionConflict {
                    table_name,
                    version: staged.record.version,
                });
            }
            if records.iter().any(|r| r.version == staged.record.version) {
                return Err(StorageError::VersionConflict {
                    table_name,
                    version: staged.record.version,
                });
            }
            for record in records.iter_mut() {
                record.is_active = false;
            }
            records.push(staged.record.clone());
        }

        for (table_name, records) in &working {
            check_table(table_name, records.iter().map(|r| (r.version, r.is_active)))?;
        }

        tables.extend(working);
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn read_head(
        &self,
        _snapshot: &mut MemorySnapshot,
        table_name: &str,
    ) -> Result<LedgerHead, StorageError> {
        Ok(head_of(self.lock().get(table_name)))
    }

    async fn stage_version(
        &self,
        snapshot: &mut MemorySnapshot,
        record: VersionRecord,
        expected: LedgerHead,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(StagedVersion::new(record, expected)?);
        Ok(())
    }

    async fn get_version(
        &self,
        table_name: &str,
        version: i64,
    ) -> Result<Option<VersionRecord>, StorageError> {
        Ok(self
            .lock()
            .get(table_name)
            .and_then(|records| records.iter().find(|r| r.version == version))
            .cloned())
    }

    async fn list_versions(&self, table_name: &str) -> Result<Vec<VersionRecord>, StorageError> {
        let mut records = self.lock().get(table_name).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(records)
    }

    async fn get_active(&self, table_name: &str) -> Result<Option<VersionRecord>, StorageError> {
        Ok(self
            .lock()
            .get(table_name)
            .and_then(|records| records.iter().find(|r| r.is_active))
            .cloned())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqstudio_core::RuleSet;

    fn rules() -> RuleSet {
        RuleSet::from_json(&serde_json::json!([{"check": {"function": "is_not_null"}}])).unwrap()
    }

    #[tokio::test]
    async fn dropped_snapshot_writes_nothing() {
        let storage = MemoryLedgerStorage::new();
        {
            let mut snap = storage.begin_snapshot().await.unwrap();
            let head = storage.read_head(&mut snap, "orders").await.unwrap();
            let record = VersionRecord::new_active("orders", 1, rules(), None, None, "u");
            storage.stage_version(&mut snap, record, head).await.unwrap();
        }
        assert!(storage.list_versions("orders").await.unwrap().is_empty());
        assert!(storage.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryLedgerStorage::new();
        let b = a.clone();
        let mut snap = a.begin_snapshot().await.unwrap();
        let head = a.read_head(&mut snap, "orders").await.unwrap();
        a.stage_version(
            &mut snap,
            VersionRecord::new_active("orders", 1, rules(), None, None, "u"),
            head,
        )
        .await
        .unwrap();
        a.commit_snapshot(snap).await.unwrap();
        assert_eq!(b.get_active("orders").await.unwrap().unwrap().version, 1);
    }
}
