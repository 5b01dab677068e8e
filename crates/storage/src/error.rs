use dqstudio_core::StudioError;

/// All errors that can be returned by a `LedgerStorage` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency conflict: another writer committed a version
    /// for this table after the snapshot read its head.
    #[error("version conflict on table {table_name}: version {version} is no longer available")]
    VersionConflict { table_name: String, version: i64 },

    /// A staged record does not follow from the head it was staged against.
    #[error("invalid version record: {0}")]
    InvalidRecord(String),

    /// A commit would have left more than one active version or a duplicate
    /// version number. The commit is rolled back.
    #[error("ledger invariant violated for table {table_name}: {message}")]
    InvariantViolation { table_name: String, message: String },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for StudioError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                table_name,
                version,
            } => StudioError::VersionConflict {
                table_name,
                version,
            },
            StorageError::InvalidRecord(message) => StudioError::InvalidInput(message),
            other => StudioError::Storage(other.to_string()),
        }
    }
}
