use dqstudio_core::RuleSet;
use serde::{Deserialize, Serialize};

/// One persisted version of a table's rule set.
///
/// `(table_name, version)` is unique across all time and at most one record
/// per table has `is_active = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub table_name: String,
    /// Positive, strictly increasing per table.
    pub version: i64,
    pub rules: RuleSet,
    /// Hex SHA-256 of the canonical rule-set JSON.
    pub rules_digest: String,
    pub prompt: Option<String>,
    pub ai_summary: Option<serde_json::Value>,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub created_at: String,
    pub created_by: String,
    pub is_active: bool,
}

impl VersionRecord {
    /// Build the record for a new active version with a fresh id.
    pub fn new_active(
        table_name: &str,
        version: i64,
        rules: RuleSet,
        prompt: Option<String>,
        ai_summary: Option<serde_json::Value>,
        created_by: &str,
    ) -> Self {
        VersionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            table_name: table_name.to_string(),
            version,
            rules_digest: rules.digest(),
            rules,
            prompt,
            ai_summary,
            created_at: dqstudio_core::now_rfc3339(),
            created_by: created_by.to_string(),
            is_active: true,
        }
    }
}

/// The version head of one table as read inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerHead {
    /// Highest version ever allocated; 0 when the table has no history.
    pub max_version: i64,
    /// Version of the active record, if any.
    pub active_version: Option<i64>,
}

impl LedgerHead {
    pub fn next_version(&self) -> i64 {
        self.max_version + 1
    }
}

/// A version staged in a snapshot together with the head it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedVersion {
    pub record: VersionRecord,
    pub expected: LedgerHead,
}

impl StagedVersion {
    /// Check that `record` is the next active version after `expected`.
    pub fn new(record: VersionRecord, expected: LedgerHead) -> Result<Self, crate::StorageError> {
        if record.table_name.trim().is_empty() {
            return Err(crate::StorageError::InvalidRecord(
                "table_name must not be empty".to_string(),
            ));
        }
        if record.version != expected.next_version() {
            return Err(crate::StorageError::InvalidRecord(format!(
                "version {} does not follow head {} for table {}",
                record.version, expected.max_version, record.table_name
            )));
        }
        if !record.is_active {
            return Err(crate::StorageError::InvalidRecord(
                "a new version must be staged as active".to_string(),
            ));
        }
        Ok(StagedVersion { record, expected })
    }
}
