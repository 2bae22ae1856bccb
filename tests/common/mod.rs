#![allow(dead_code)]

use durasql::providers::sqlite::{SqliteOptions, SqliteProvider};
use durasql::providers::Provider;
use durasql::{Event, EventKind, RuntimeOptions};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Runtime options tuned for tests: fast polling, short leases.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions::default()
        .with_dispatcher_poll_interval(Duration::from_millis(5))
        .with_orchestrator_lock_timeout(Duration::from_secs(2))
        .with_worker_lock_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub async fn create_sqlite_store_memory() -> StdArc<dyn Provider> {
    StdArc::new(SqliteProvider::new_in_memory().await.unwrap()) as StdArc<dyn Provider>
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let (store, td, _) = create_sqlite_store_disk_with(None).await;
    (store, td)
}

/// On-disk store plus its URL, so a test can open a second provider on the
/// same database.
pub async fn create_sqlite_store_disk_with(
    options: Option<SqliteOptions>,
) -> (StdArc<dyn Provider>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite:{}", td.path().join("test.db").display());
    let store = StdArc::new(SqliteProvider::new(&db_url, options).await.unwrap()) as StdArc<dyn Provider>;
    (store, td, db_url)
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read_history(instance, None).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the current execution has recorded a scheduled activity with
/// this name.
pub async fn wait_for_activity_scheduled(
    store: StdArc<dyn Provider>,
    instance: &str,
    activity: &str,
    timeout_ms: u64,
) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(&e.kind, EventKind::TaskScheduled { name, .. } if name == activity))
        },
        timeout_ms,
    )
    .await
}

/// Event ids within one execution must be 1..=n with no gaps.
pub fn assert_contiguous(history: &[Event]) {
    for (idx, event) in history.iter().enumerate() {
        assert_eq!(event.event_id, idx as u64 + 1, "gap or reorder in history: {history:?}");
    }
}
