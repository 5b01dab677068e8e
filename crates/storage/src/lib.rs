//! Durable storage for the rule-version ledger.
//!
//! [`LedgerStorage`] is the backend seam. Two backends ship here:
//! [`MemoryLedgerStorage`] for tests and single-process use, and
//! [`SqliteLedgerStorage`] for a database file that several processes may
//! share. Every backend is expected to pass [`conformance::run_conformance_suite`].

pub mod conformance;
mod error;
mod invariants;
mod memory;
mod record;
mod sqlite;
mod traits;

pub use error::StorageError;
pub use memory::{MemoryLedgerStorage, MemorySnapshot};
pub use record::{LedgerHead, StagedVersion, VersionRecord};
pub use sqlite::{SqliteLedgerStorage, SqliteSnapshot};
pub use traits::LedgerStorage;
