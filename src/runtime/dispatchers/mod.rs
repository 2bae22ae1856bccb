//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: fetches instance batches and runs orchestration turns
//! - `worker`: fetches activity work items and executes them
//!
//! Both keep their lease alive with a background renewal task for as long as
//! the work runs.

mod orchestration;
mod worker;

use crate::providers::lock::backoff_with_jitter;
use crate::providers::{Provider, ProviderError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Renewal cadence for a lease.
///
/// - timeout ≥ 15s: renew at (timeout - buffer)
/// - timeout < 15s: renew at half the timeout (buffer ignored)
pub(crate) fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        lock_timeout
            .saturating_sub(buffer.min(lock_timeout))
            .max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseKind {
    Orchestration,
    WorkItem,
}

impl LeaseKind {
    fn as_str(self) -> &'static str {
        match self {
            LeaseKind::Orchestration => "orchestration",
            LeaseKind::WorkItem => "work_item",
        }
    }
}

/// Spawn a task that keeps renewing `token` until it is aborted, renewal
/// fails, or the runtime shuts down.
pub(crate) fn spawn_lease_renewal(
    provider: Arc<dyn Provider>,
    kind: LeaseKind,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tracing::debug!(
        target: "durasql::runtime::dispatchers",
        lease = kind.as_str(),
        lock_token = %token,
        lock_timeout_ms = lock_timeout.as_millis() as u64,
        renewal_interval_ms = renewal_interval.as_millis() as u64,
        "Spawning lease renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let renewed = match kind {
                LeaseKind::Orchestration => provider.renew_orchestration_item_lock(&token, lock_timeout).await,
                LeaseKind::WorkItem => provider.renew_work_item_lock(&token, lock_timeout).await,
            };
            match renewed {
                Ok(()) => {
                    tracing::trace!(
                        target: "durasql::runtime::dispatchers",
                        lease = kind.as_str(),
                        lock_token = %token,
                        "Lease renewed"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        target: "durasql::runtime::dispatchers",
                        lease = kind.as_str(),
                        lock_token = %token,
                        error = %e,
                        "Lease renewal failed, will retry"
                    );
                }
                Err(e) => {
                    // Acked, abandoned, or expired and taken over.
                    tracing::debug!(
                        target: "durasql::runtime::dispatchers",
                        lease = kind.as_str(),
                        lock_token = %token,
                        error = %e,
                        "Lease renewal stopped"
                    );
                    break;
                }
            }
        }
    })
}

/// Backoff used when retrying a commit: 10ms · 2^attempt plus jitter, so
/// runtimes contending for the same database do not retry in lockstep.
pub(crate) fn commit_backoff(attempt: u32) -> Duration {
    backoff_with_jitter(attempt)
}

pub(crate) const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Run `commit` until it succeeds, retrying retryable errors up to
/// [`MAX_COMMIT_ATTEMPTS`] times. The last error is returned once retries
/// run out or the error is permanent.
pub(crate) async fn retry_commit<F, Fut>(
    operation: &'static str,
    instance: &str,
    mut commit: F,
) -> Result<(), ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match commit().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < MAX_COMMIT_ATTEMPTS => {
                let backoff = commit_backoff(attempt);
                tracing::warn!(
                    target: "durasql::runtime",
                    instance_id = %instance,
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Commit failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
