//! Worker dispatcher implementation for Runtime
//!
//! Fetches activity work items, runs the registered handler, and acks the
//! item together with its completion message for the owning instance.

use super::{retry_commit, spawn_lease_renewal, LeaseKind};
use crate::providers::lock::backoff_with_jitter;
use crate::providers::WorkItem;
use crate::runtime::registry::ActivityContext;
use crate::runtime::replay_engine::panic_message;
use crate::runtime::Runtime;
use crate::FailureDetails;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Delay before an item whose completion could not be acked is retried.
const ABANDON_DELAY: Duration = Duration::from_millis(50);

/// Items that are not activity executions are parked this long.
const UNEXPECTED_ITEM_DELAY: Duration = Duration::from_secs(60);

impl Runtime {
    /// Start the work dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for worker_idx in 0..self.options.worker_concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(rt.run_activity_worker(worker_id));
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(target: "durasql::runtime", error = %e, "Activity worker ended abnormally");
                }
            }
            debug!(target: "durasql::runtime", "Work dispatcher exited");
        })
    }

    async fn run_activity_worker(self: Arc<Self>, worker_id: String) {
        debug!(target: "durasql::runtime", worker_id = %worker_id, "Activity worker started");
        let mut fetch_failures: u32 = 0;
        while !self.is_shutting_down() {
            match self.provider.fetch_work_item(self.options.worker_lock_timeout).await {
                Ok(Some((item, lock_token, attempt_count))) => {
                    fetch_failures = 0;
                    let renewal = spawn_lease_renewal(
                        Arc::clone(&self.provider),
                        LeaseKind::WorkItem,
                        lock_token.clone(),
                        self.options.worker_lock_timeout,
                        self.options.lock_renewal_buffer,
                        Arc::clone(&self.shutdown_flag),
                    );
                    self.process_work_item(item, &lock_token, attempt_count, &worker_id)
                        .await;
                    renewal.abort();
                }
                Ok(None) => {
                    fetch_failures = 0;
                    tokio::time::sleep(self.options.dispatcher_poll_interval).await;
                }
                Err(e) => {
                    let backoff = backoff_with_jitter(fetch_failures);
                    fetch_failures = fetch_failures.saturating_add(1);
                    warn!(
                        target: "durasql::runtime",
                        worker_id = %worker_id,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Error fetching work item"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        debug!(target: "durasql::runtime", worker_id = %worker_id, "Activity worker exiting");
    }

    async fn process_work_item(&self, item: WorkItem, lock_token: &str, attempt_count: u32, worker_id: &str) {
        let (instance, execution_id, id, name, input) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
            } => (instance, execution_id, id, name, input),
            other => {
                error!(
                    target: "durasql::runtime",
                    worker_id = %worker_id,
                    kind = other.kind_name(),
                    instance_id = %other.instance(),
                    "Unexpected item on the worker queue"
                );
                if let Err(e) = self
                    .provider
                    .abandon_work_item(lock_token, Some(UNEXPECTED_ITEM_DELAY))
                    .await
                {
                    warn!(target: "durasql::runtime", worker_id = %worker_id, error = %e, "Failed to abandon work item");
                }
                return;
            }
        };

        let failed = |details: FailureDetails| WorkItem::ActivityFailed {
            instance: instance.clone(),
            execution_id,
            id,
            details,
        };

        let completion = if attempt_count > self.options.max_attempts {
            warn!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                activity_name = %name,
                activity_id = id,
                attempt_count,
                max_attempts = self.options.max_attempts,
                "Activity exceeded max attempts, failing as poison"
            );
            failed(FailureDetails::poison(format!(
                "activity '{name}' fetched {attempt_count} times (max {})",
                self.options.max_attempts
            )))
        } else if let Some(handler) = self.activity_registry.get(&name) {
            debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                attempt_count,
                "Activity started"
            );
            let ctx = ActivityContext::new(instance.as_str(), execution_id, name.as_str(), id, worker_id);
            match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
                Ok(Ok(result)) => {
                    debug!(
                        target: "durasql::runtime",
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        "Activity completed"
                    );
                    WorkItem::ActivityCompleted {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        result,
                    }
                }
                Ok(Err(message)) => {
                    warn!(
                        target: "durasql::runtime",
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        error = %message,
                        "Activity failed (application error)"
                    );
                    failed(FailureDetails::application(message))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        target: "durasql::runtime",
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        error = %message,
                        "Activity panicked"
                    );
                    failed(FailureDetails::panic(message))
                }
            }
        } else {
            error!(
                target: "durasql::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                "Activity is not registered"
            );
            failed(FailureDetails::unregistered("activity", &name))
        };

        let provider = &self.provider;
        let completion = &completion;
        let acked = retry_commit("ack_work_item", &instance, move || {
            provider.ack_work_item(lock_token, completion.clone())
        })
        .await;
        if let Err(e) = acked {
            // Either the lease was lost mid-run or the store stayed busy. The
            // item is redelivered and the activity runs again.
            warn!(
                target: "durasql::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                error = %e,
                "Failed to ack work item, abandoning"
            );
            if let Err(abandon_err) = self.provider.abandon_work_item(lock_token, Some(ABANDON_DELAY)).await {
                debug!(
                    target: "durasql::runtime",
                    instance_id = %instance,
                    error = %abandon_err,
                    "Abandon failed; the lease will expire on its own"
                );
            }
        }
    }
}
