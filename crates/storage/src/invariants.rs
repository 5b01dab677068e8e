use std::collections::HashSet;

use crate::error::StorageError;

/// Check one table's `(version, is_active)` pairs: versions are positive and
/// unique, and at most one is active.
pub fn check_table<I>(table_name: &str, rows: I) -> Result<(), StorageError>
where
    I: IntoIterator<Item = (i64, bool)>,
{
    let mut seen = HashSet::new();
    let mut active = 0usize;
    for (version, is_active) in rows {
        if version < 1 {
            return Err(violation(table_name, format!("non-positive version {version}")));
        }
        if !seen.insert(version) {
            return Err(violation(table_name, format!("duplicate version {version}")));
        }
        if is_active {
            active += 1;
        }
    }
    if active > 1 {
        return Err(violation(table_name, format!("{active} active versions")));
    }
    Ok(())
}

fn violation(table_name: &str, message: String) -> StorageError {
    tracing::error!(table = table_name, %message, "ledger invariant violated");
    StorageError::InvariantViolation {
        table_name: table_name.to_string(),
        message,
    }
}
