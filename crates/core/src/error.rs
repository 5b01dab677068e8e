//! Caller-facing error taxonomy.
//!
//! Every component error converts into [`StudioError`] so callers see one
//! enum regardless of which collaborator failed.

use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::rules::RuleSetError;

/// All errors surfaced by the dqstudio core to its callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    /// No credential could be resolved for the requested operation class.
    #[error("no credential available for {operation}")]
    NoCredentialAvailable { operation: String },

    /// The downstream system rejected the presented credential.
    /// Never retried: the same credential cannot succeed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The tabular engine is temporarily unreachable or overloaded.
    #[error("warehouse unavailable: {0}")]
    WarehouseUnavailable(String),

    /// The query text was rejected by the tabular engine.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// The job platform refused the submission payload.
    #[error("job submission rejected: {0}")]
    SubmissionRejected(String),

    /// The job platform or a serving endpoint is temporarily unreachable.
    #[error("platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// A result was requested before a terminal state was observed.
    #[error("job {job_id} has not reached a terminal state")]
    JobNotTerminal { job_id: String },

    /// The remote job ended in failure; details are passed through as-is.
    #[error("job failed: {0}")]
    JobFailed(String),

    /// Another writer allocated the same version for this table.
    #[error("version conflict on table {table_name} at version {version}")]
    VersionConflict { table_name: String, version: i64 },

    /// The summarization endpoint could not produce a summary.
    #[error("summary unavailable: {0}")]
    SummaryUnavailable(String),

    /// A persistence backend error (connection, serialization, ...).
    #[error("storage error: {0}")]
    Storage(String),

    /// Caller input failed validation before any remote call was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StudioError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StudioError::WarehouseUnavailable(_)
                | StudioError::PlatformUnavailable(_)
                | StudioError::VersionConflict { .. }
                | StudioError::Storage(_)
        )
    }
}

impl From<CredentialError> for StudioError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NoCredentialAvailable(class) => StudioError::NoCredentialAvailable {
                operation: class.to_string(),
            },
        }
    }
}

impl From<RuleSetError> for StudioError {
    fn from(err: RuleSetError) -> Self {
        StudioError::InvalidInput(err.to_string())
    }
}

impl From<ConfigError> for StudioError {
    fn from(err: ConfigError) -> Self {
        StudioError::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::OperationClass;

    #[test]
    fn retryable_classification() {
        assert!(StudioError::WarehouseUnavailable("503".into()).is_retryable());
        assert!(StudioError::VersionConflict {
            table_name: "orders".into(),
            version: 2
        }
        .is_retryable());
        assert!(StudioError::Storage("locked".into()).is_retryable());
        assert!(StudioError::PlatformUnavailable("429".into()).is_retryable());

        assert!(!StudioError::Unauthorized("expired".into()).is_retryable());
        assert!(!StudioError::MalformedQuery("syntax".into()).is_retryable());
        assert!(!StudioError::JobFailed("oom".into()).is_retryable());
        assert!(!StudioError::NoCredentialAvailable {
            operation: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn credential_error_converts() {
        let err: StudioError =
            CredentialError::NoCredentialAvailable(OperationClass::PrivilegedJobTrigger).into();
        assert_eq!(
            err,
            StudioError::NoCredentialAvailable {
                operation: "privileged_job_trigger".into()
            }
        );
    }

    #[test]
    fn display_includes_details() {
        let err = StudioError::VersionConflict {
            table_name: "main.sales.orders".into(),
            version: 4,
        };
        assert_eq!(
            err.to_string(),
            "version conflict on table main.sales.orders at version 4"
        );
    }
}
