//! SQLite `LedgerStorage` backend.
//!
//! Atomicity rests on SQLite itself, not on the in-process mutex: each
//! commit runs in one `BEGIN IMMEDIATE` transaction, `(table_name, version)`
//! is a `UNIQUE` constraint, and a partial unique index allows only one
//! active row per table. Several processes may open the same file.
//!
//! rusqlite is synchronous, so every call runs under
//! `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::error::StorageError;
use crate::invariants::check_table;
use crate::record::{LedgerHead, StagedVersion, VersionRecord};
use crate::traits::LedgerStorage;

/// Schema version recorded in `ledger_meta`.
const SCHEMA_VERSION: i64 = 1;

/// Default busy timeout (ms) while waiting for another writer's lock.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const SELECT_COLUMNS: &str = "id, table_name, version, rules_json, rules_digest, prompt, \
     ai_summary_json, created_at, created_by, is_active";

/// Ledger storage in a SQLite database file.
#[derive(Clone)]
pub struct SqliteLedgerStorage {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Buffered writes of one SQLite transaction.
#[derive(Debug, Default)]
pub struct SqliteSnapshot {
    staged: Vec<StagedVersion>,
}

impl SqliteLedgerStorage {
    /// Open (or create) a ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Backend(format!("could not create {}: {e}", parent.display()))
            })?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags).map_err(db_error)?;
        connection
            .execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_error)?;
        Self::from_connection(connection, Some(path.to_path_buf()))
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let connection = Connection::open_in_memory().map_err(db_error)?;
        Self::from_connection(connection, None)
    }

    fn from_connection(
        mut connection: Connection,
        path: Option<PathBuf>,
    ) -> Result<Self, StorageError> {
        connection
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .map_err(db_error)?;
        initialize_schema(&mut connection)?;
        tracing::debug!(path = ?path, "opened sqlite ledger");
        Ok(SqliteLedgerStorage {
            connection: Arc::new(Mutex::new(connection)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl LedgerStorage for SqliteLedgerStorage {
    type Snapshot = SqliteSnapshot;

    async fn begin_snapshot(&self) -> Result<SqliteSnapshot, StorageError> {
        Ok(SqliteSnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        if snapshot.staged.is_empty() {
            return Ok(());
        }
        self.with_connection(move |conn| commit_staged(conn, &snapshot.staged))
            .await
    }

    async fn abort_snapshot(&self, _snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn read_head(
        &self,
        _snapshot: &mut SqliteSnapshot,
        table_name: &str,
    ) -> Result<LedgerHead, StorageError> {
        let table_name = table_name.to_string();
        self.with_connection(move |conn| read_head(conn, &table_name))
            .await
    }

    async fn stage_version(
        &self,
        snapshot: &mut SqliteSnapshot,
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
        let table_name = table_name.to_string();
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM rule_versions WHERE table_name = ?1 AND version = ?2"
            );
            let row = conn
                .query_row(&sql, params![table_name, version], map_row)
                .optional()
                .map_err(db_error)?;
            row.map(VersionRow::into_record).transpose()
        })
        .await
    }

    async fn list_versions(&self, table_name: &str) -> Result<Vec<VersionRecord>, StorageError> {
        let table_name = table_name.to_string();
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM rule_versions WHERE table_name = ?1 \
                 ORDER BY version DESC"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_error)?;
            let rows = stmt
                .query_map(params![table_name], map_row)
                .map_err(db_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_error)?;
            rows.into_iter().map(VersionRow::into_record).collect()
        })
        .await
    }

    async fn get_active(&self, table_name: &str) -> Result<Option<VersionRecord>, StorageError> {
        let table_name = table_name.to_string();
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM rule_versions WHERE table_name = ?1 AND is_active = 1"
            );
            let row = conn
                .query_row(&sql, params![table_name], map_row)
                .optional()
                .map_err(db_error)?;
            row.map(VersionRow::into_record).transpose()
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT table_name FROM rule_versions ORDER BY table_name")
                .map_err(db_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_error)?;
            Ok(names)
        })
        .await
    }
}

// ── Transaction body ─────────────────────────────────────────────────────────

fn commit_staged(conn: &mut Connection, staged: &[StagedVersion]) -> Result<(), StorageError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_error)?;

    for item in staged {
        let record = &item.record;
        let conflict = || StorageError::VersionConflict {
            table_name: record.table_name.clone(),
            version: record.version,
        };

        let current = read_head(&tx, &record.table_name)?;
        if current != item.expected {
            return Err(conflict());
        }

        if let Some(active) = item.expected.active_version {
            let changed = tx
                .execute(
                    "UPDATE rule_versions SET is_active = 0 \
                     WHERE table_name = ?1 AND version = ?2 AND is_active = 1",
                    params![record.table_name, active],
                )
                .map_err(db_error)?;
            if changed != 1 {
                return Err(conflict());
            }
        }

        let rules_json = serde_json::to_string(&record.rules)
            .map_err(|e| StorageError::Backend(format!("serialize rules: {e}")))?;
        let summary_json = record
            .ai_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Backend(format!("serialize ai_summary: {e}")))?;

        let inserted = tx.execute(
            "INSERT INTO rule_versions (
                id, table_name, version, rules_json, rules_digest, prompt,
                ai_summary_json, created_at, created_by, is_active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                record.id,
                record.table_name,
                record.version,
                rules_json,
                record.rules_digest,
                record.prompt,
                summary_json,
                record.created_at,
                record.created_by,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(conflict());
            }
            Err(err) => return Err(db_error(err)),
        }

        let mut stmt = tx
            .prepare("SELECT version, is_active FROM rule_versions WHERE table_name = ?1")
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![record.table_name], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        check_table(&record.table_name, rows)?;
    }

    tx.commit().map_err(db_error)
}

fn read_head(conn: &Connection, table_name: &str) -> Result<LedgerHead, StorageError> {
    let max_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM rule_versions WHERE table_name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .map_err(db_error)?;
    let active_version: Option<i64> = conn
        .query_row(
            "SELECT version FROM rule_versions WHERE table_name = ?1 AND is_active = 1",
            params![table_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)?;
    Ok(LedgerHead {
        max_version,
        active_version,
    })
}

// ── Schema ───────────────────────────────────────────────────────────────────

fn initialize_schema(connection: &mut Connection) -> Result<(), StorageError> {
    let tx = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_error)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS ledger_meta (version INTEGER NOT NULL);")
        .map_err(db_error)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM ledger_meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(db_error)?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO ledger_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(db_error)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS rule_versions (
                    id TEXT PRIMARY KEY,
                    table_name TEXT NOT NULL,
                    version INTEGER NOT NULL CHECK (version > 0),
                    rules_json TEXT NOT NULL,
                    rules_digest TEXT NOT NULL,
                    prompt TEXT,
                    ai_summary_json TEXT,
                    created_at TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (table_name, version)
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_rule_versions_one_active
                    ON rule_versions (table_name) WHERE is_active = 1;",
            )
            .map_err(db_error)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(StorageError::Backend(format!(
                "unsupported ledger schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(db_error)
}

// ── Row mapping ──────────────────────────────────────────────────────────────

struct VersionRow {
    id: String,
    table_name: String,
    version: i64,
    rules_json: String,
    rules_digest: String,
    prompt: Option<String>,
    ai_summary_json: Option<String>,
    created_at: String,
    created_by: String,
    is_active: bool,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        table_name: row.get(1)?,
        version: row.get(2)?,
        rules_json: row.get(3)?,
        rules_digest: row.get(4)?,
        prompt: row.get(5)?,
        ai_summary_json: row.get(6)?,
        created_at: row.get(7)?,
        created_by: row.get(8)?,
        is_active: row.get(9)?,
    })
}

impl VersionRow {
    fn into_record(self) -> Result<VersionRecord, StorageError> {
        let rules = serde_json::from_str(&self.rules_json).map_err(|e| {
            StorageError::Backend(format!(
                "corrupt rules for {} v{}: {e}",
                self.table_name, self.version
            ))
        })?;
        let ai_summary = self
            .ai_summary_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StorageError::Backend(format!("corrupt ai_summary: {e}")))?;
        Ok(VersionRecord {
            id: self.id,
            table_name: self.table_name,
            version: self.version,
            rules,
            rules_digest: self.rules_digest,
            prompt: self.prompt,
            ai_summary,
            created_at: self.created_at,
            created_by: self.created_by,
            is_active: self.is_active,
        })
    }
}

fn db_error(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}
