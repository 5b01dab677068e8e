//! Runs the ledger conformance suite against every bundled backend.

use dqstudio_storage::conformance::run_conformance_suite;
use dqstudio_storage::{MemoryLedgerStorage, SqliteLedgerStorage};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_backend_conformance() {
    let report = run_conformance_suite(|| async { MemoryLedgerStorage::new() }).await;
    assert!(report.total > 0);
    assert!(report.failed == 0, "{report}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_in_memory_backend_conformance() {
    let report =
        run_conformance_suite(|| async { SqliteLedgerStorage::open_in_memory().unwrap() }).await;
    assert!(report.failed == 0, "{report}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_file_backend_conformance() {
    let dir = tempfile::tempdir().unwrap();
    let counter = std::sync::atomic::AtomicUsize::new(0);
    let report = run_conformance_suite(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.path().join(format!("ledger-{n}.db"));
        async move { SqliteLedgerStorage::open(&path).unwrap() }
    })
    .await;
    assert!(report.failed == 0, "{report}");
}
