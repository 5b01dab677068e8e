use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{LedgerHead, VersionRecord};

/// The storage trait for rule-version ledger backends.
///
/// A `LedgerStorage` implementation provides durable, transactional storage
/// for per-table rule-set versions.
///
/// ## Snapshot Semantics
///
/// Writes go through `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. `read_head()` to learn the table's current max/active version
/// 3. `stage_version()` with the record for `max_version + 1`
/// 4. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, nothing it staged may
/// become visible.
///
/// ## OCC Conflict Detection
///
/// `commit_snapshot` inserts the staged record and deactivates the prior
/// active record as one atomic unit, conditional on the table's head still
/// matching the head the record was staged against. If another writer got
/// there first, the commit fails with `StorageError::VersionConflict` and
/// nothing is written. Backends must rely on their own atomicity (a
/// transaction, a uniqueness constraint) rather than in-process locks alone,
/// since several processes may share one store.
///
/// ## Invariants
///
/// After every commit, for each table: version numbers are unique and at
/// most one record is active. A commit that would break either is rolled
/// back with `StorageError::InvariantViolation`.
#[async_trait]
pub trait LedgerStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    ///
    /// Must be `Send` to allow passing across async task boundaries.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all staged versions durable atomically.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all staged versions.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Version operations (within snapshot) ─────────────────────────────────

    /// Read the table's current head: highest version and active version.
    async fn read_head(
        &self,
        snapshot: &mut Self::Snapshot,
        table_name: &str,
    ) -> Result<LedgerHead, StorageError>;

    /// Stage `record` as the new active version of its table.
    ///
    /// `record.version` must equal `expected.max_version + 1`, otherwise
    /// `StorageError::InvalidRecord` is returned immediately.
    async fn stage_version(
        &self,
        snapshot: &mut Self::Snapshot,
        record: VersionRecord,
        expected: LedgerHead,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot) ──────────────────────────────────

    /// Read one version of a table, if it exists.
    async fn get_version(
        &self,
        table_name: &str,
        version: i64,
    ) -> Result<Option<VersionRecord>, StorageError>;

    /// All versions of a table, newest first.
    async fn list_versions(&self, table_name: &str) -> Result<Vec<VersionRecord>, StorageError>;

    /// The active version of a table, if any.
    async fn get_active(&self, table_name: &str) -> Result<Option<VersionRecord>, StorageError>;

    /// Names of all tables with at least one version, sorted.
    async fn list_tables(&self) -> Result<Vec<String>, StorageError>;
}
