//! Orchestration dispatcher implementation for Runtime
//!
//! Each worker loops: fetch an instance batch (which leases the instance),
//! run one turn through the replay engine, commit the turn atomically. The
//! lease is renewed in the background while the turn runs.

use super::{retry_commit, spawn_lease_renewal, LeaseKind};
use crate::providers::lock::backoff_with_jitter;
use crate::providers::{ExecutionMetadata, OrchestrationItem, TurnCommit};
use crate::runtime::execution::{build_commit, plan_execution, rejected_child_starts};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::Runtime;
use crate::{now_ms, FailureDetails, OrchestrationStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Delay before an abandoned batch becomes visible again.
const ABANDON_DELAY: Duration = Duration::from_millis(50);

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers.
    ///
    /// Workers live in a `JoinSet` owned by the dispatcher task, so aborting
    /// the dispatcher aborts every worker with it.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for worker_idx in 0..self.options.orchestration_concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(rt.run_orchestration_worker(worker_id));
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(target: "durasql::runtime", error = %e, "Orchestration worker ended abnormally");
                }
            }
            debug!(target: "durasql::runtime", "Orchestration dispatcher exited");
        })
    }

    async fn run_orchestration_worker(self: Arc<Self>, worker_id: String) {
        debug!(target: "durasql::runtime", worker_id = %worker_id, "Orchestration worker started");
        let mut fetch_failures: u32 = 0;
        while !self.is_shutting_down() {
            match self
                .provider
                .fetch_orchestration_item(
                    self.options.orchestrator_lock_timeout,
                    self.options.orchestration_batch_size,
                )
                .await
            {
                Ok(Some((item, lock_token, attempt_count))) => {
                    fetch_failures = 0;
                    let renewal = spawn_lease_renewal(
                        Arc::clone(&self.provider),
                        LeaseKind::Orchestration,
                        lock_token.clone(),
                        self.options.orchestrator_lock_timeout,
                        self.options.lock_renewal_buffer,
                        Arc::clone(&self.shutdown_flag),
                    );
                    self.process_orchestration_item(item, &lock_token, attempt_count, &worker_id)
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
                        "Error fetching orchestration item"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        debug!(target: "durasql::runtime", worker_id = %worker_id, "Orchestration worker exiting");
    }

    /// Run one turn for a fetched batch and commit it.
    pub(in crate::runtime) async fn process_orchestration_item(
        self: &Arc<Self>,
        item: OrchestrationItem,
        lock_token: &str,
        attempt_count: u32,
        worker_id: &str,
    ) {
        let instance = item.instance.clone();

        if let Some(reason) = &item.history_error {
            self.fail_unreadable_history(&item, lock_token, reason).await;
            return;
        }

        let plan = plan_execution(&item);
        let rejected = rejected_child_starts(&item, plan.as_ref());
        let Some(plan) = plan else {
            debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                messages = item.messages.len(),
                "No runnable execution for batch, consuming messages"
            );
            let commit = TurnCommit {
                execution_id: item.execution_id,
                orchestrator_items: rejected,
                ..Default::default()
            };
            self.commit_turn(&instance, lock_token, commit).await;
            return;
        };

        let execution_id = plan.execution_id;
        let orchestration_name = plan.orchestration_name().map(str::to_string);
        let is_new_execution = plan.start.is_some();

        let mut engine = ReplayEngine::new(instance.clone(), execution_id, plan.baseline, now_ms());
        if let Some(start) = plan.start {
            engine.start_execution(&start.orchestration, &start.input, start.parent);
            debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                orchestration_name = %start.orchestration,
                worker_id = %worker_id,
                "Orchestration started"
            );
        }
        engine.prep_messages(&item.messages);

        let outcome = if attempt_count > self.options.max_attempts {
            warn!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                attempt_count,
                max_attempts = self.options.max_attempts,
                "Orchestration messages exceeded max attempts, failing as poison"
            );
            engine.fail(FailureDetails::poison(format!(
                "orchestration batch for '{instance}' fetched {attempt_count} times (max {})",
                self.options.max_attempts
            )))
        } else {
            let handler = orchestration_name
                .as_deref()
                .and_then(|name| self.orchestration_registry.get(name));
            match handler {
                Some(handler) => engine.execute(handler.as_ref()),
                None => {
                    let name = orchestration_name.clone().unwrap_or_default();
                    error!(
                        target: "durasql::runtime",
                        instance_id = %instance,
                        execution_id,
                        orchestration_name = %name,
                        "Orchestration is not registered"
                    );
                    engine.fail(FailureDetails::unregistered("orchestration", &name))
                }
            }
        };

        let history_events = outcome.history_delta.len();
        match &outcome.result {
            TurnResult::Continue => {}
            TurnResult::Completed(_) => debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                worker_id = %worker_id,
                "Orchestration completed"
            ),
            TurnResult::Failed(details) if details.error_type == FailureDetails::APPLICATION => warn!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                worker_id = %worker_id,
                error = %details,
                "Orchestration failed (application error)"
            ),
            TurnResult::Failed(details) => error!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                worker_id = %worker_id,
                error = %details,
                "Orchestration failed"
            ),
            TurnResult::ContinueAsNew(_) => debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                worker_id = %worker_id,
                "Orchestration continued as new"
            ),
            TurnResult::Terminated(reason) => debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                execution_id,
                reason = %reason,
                "Orchestration terminated"
            ),
        }

        let mut commit = build_commit(&instance, execution_id, outcome);
        commit.orchestrator_items.extend(rejected);
        debug!(
            target: "durasql::runtime",
            instance_id = %instance,
            execution_id,
            new_execution = is_new_execution,
            history_events,
            worker_items = commit.worker_items.len(),
            orchestrator_items = commit.orchestrator_items.len(),
            "Committing orchestration turn"
        );
        self.commit_turn(&instance, lock_token, commit).await;
    }

    /// Ack with retry on retryable errors. On a permanent error, or once
    /// retries are exhausted, the batch is abandoned so it is redelivered.
    async fn commit_turn(&self, instance: &str, lock_token: &str, commit: TurnCommit) -> bool {
        let provider = &self.provider;
        let commit = &commit;
        let committed = retry_commit("ack_orchestration_item", instance, move || {
            provider.ack_orchestration_item(lock_token, commit.clone())
        })
        .await;
        let Err(e) = committed else {
            return true;
        };

        warn!(
            target: "durasql::runtime",
            instance_id = %instance,
            error = %e,
            "Failed to commit orchestration turn, abandoning batch"
        );
        if let Err(abandon_err) = self
            .provider
            .abandon_orchestration_item(lock_token, Some(ABANDON_DELAY))
            .await
        {
            debug!(
                target: "durasql::runtime",
                instance_id = %instance,
                error = %abandon_err,
                "Abandon failed; the lease will expire on its own"
            );
        }
        false
    }

    /// History that cannot be decoded cannot be replayed or appended to. The
    /// execution is marked failed through metadata alone.
    async fn fail_unreadable_history(&self, item: &OrchestrationItem, lock_token: &str, reason: &str) {
        error!(
            target: "durasql::runtime",
            instance_id = %item.instance,
            execution_id = item.execution_id,
            error = %reason,
            "History is unreadable, failing execution"
        );
        let details = FailureDetails::poison(format!("history could not be decoded: {reason}"));
        let commit = TurnCommit {
            execution_id: item.execution_id,
            metadata: ExecutionMetadata {
                status: Some(OrchestrationStatus::Failed),
                output: Some(details.to_json()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.commit_turn(&item.instance, lock_token, commit).await;
    }
}
