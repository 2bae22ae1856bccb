//! In-process runtime: orchestration and worker dispatchers driving the
//! provider queues.
//!
//! Workers are stateless. Each orchestration turn rehydrates from history,
//! replays user code, and commits the result in one provider transaction.
//! The only state shared between tasks is the shutdown flag and the join
//! handles.

use crate::client::Client;
use crate::providers::{Provider, ProviderError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod dispatchers;
pub(crate) mod execution;
pub mod registry;
pub(crate) mod replay_engine;

pub use registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent orchestration turns. 0 disables orchestration dispatch.
    /// Default: 2
    pub orchestration_concurrency: usize,
    /// Concurrent activity executions. 0 disables activity dispatch, for
    /// nodes that only run orchestrations. Default: 2
    pub worker_concurrency: usize,
    /// Lease length for an instance while its turn runs. Renewed in the
    /// background for long turns. Default: 5s
    pub orchestrator_lock_timeout: Duration,
    /// Lease length for an activity work item. Renewed while the activity
    /// runs. Default: 30s
    pub worker_lock_timeout: Duration,
    /// How long before expiry a lease is renewed (leases of 15s or more;
    /// shorter ones renew at half their length). Default: 5s
    pub lock_renewal_buffer: Duration,
    /// Upper bound on messages handed to one orchestration turn. Default: 100
    pub orchestration_batch_size: usize,
    /// Sleep between polls of an empty queue. Default: 10ms
    pub dispatcher_poll_interval: Duration,
    /// A message fetched more times than this is poison. Default: 10
    pub max_attempts: u32,
    /// How long `shutdown` waits for in-flight work before aborting. Default: 10s
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            orchestrator_lock_timeout: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(30),
            lock_renewal_buffer: Duration::from_secs(5),
            orchestration_batch_size: 100,
            dispatcher_poll_interval: Duration::from_millis(10),
            max_attempts: 10,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeOptions {
    pub fn with_orchestration_concurrency(mut self, n: usize) -> Self {
        self.orchestration_concurrency = n;
        self
    }

    pub fn with_worker_concurrency(mut self, n: usize) -> Self {
        self.worker_concurrency = n;
        self
    }

    pub fn with_orchestrator_lock_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator_lock_timeout = timeout;
        self
    }

    pub fn with_worker_lock_timeout(mut self, timeout: Duration) -> Self {
        self.worker_lock_timeout = timeout;
        self
    }

    pub fn with_lock_renewal_buffer(mut self, buffer: Duration) -> Self {
        self.lock_renewal_buffer = buffer;
        self
    }

    pub fn with_orchestration_batch_size(mut self, n: usize) -> Self {
        self.orchestration_batch_size = n;
        self
    }

    pub fn with_dispatcher_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatcher_poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The store's schema is missing or from another version. Fatal.
    #[error("schema validation failed: {0}")]
    Schema(ProviderError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Running set of dispatchers bound to one provider.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    provider: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    options: RuntimeOptions,
    runtime_id: String,
    shutdown_flag: Arc<AtomicBool>,
}

impl Runtime {
    /// Validate the store and start the dispatchers.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Schema`] if the store's schema version does not match
    /// this build. Nothing is dispatched in that case.
    pub async fn start(
        provider: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, RuntimeError> {
        provider.validate_schema().await.map_err(RuntimeError::Schema)?;

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let rt = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            provider,
            orchestration_registry: orchestrations,
            activity_registry: activities,
            options,
            runtime_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        });

        let orchestration = Arc::clone(&rt).start_orchestration_dispatcher();
        let worker = Arc::clone(&rt).start_work_dispatcher();
        rt.joins.lock().await.extend([orchestration, worker]);

        info!(
            target: "durasql::runtime",
            runtime_id = %rt.runtime_id,
            provider = rt.provider.name(),
            task_hub = rt.provider.task_hub(),
            orchestrations = rt.orchestration_registry.count(),
            activities = rt.activity_registry.count(),
            orchestration_concurrency = rt.options.orchestration_concurrency,
            worker_concurrency = rt.options.worker_concurrency,
            "Runtime started"
        );
        Ok(rt)
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Client bound to the same provider.
    pub fn client(&self) -> Client {
        Client::new(Arc::clone(&self.provider))
    }

    /// Stop polling, let in-flight turns and activities finish, and wait for
    /// the dispatchers to exit. Work still running after
    /// `shutdown_timeout` is aborted; its leases expire and the work is
    /// redelivered to another runtime.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let joins: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        let aborts: Vec<_> = joins.iter().map(|j| j.abort_handle()).collect();

        let drained = tokio::time::timeout(self.options.shutdown_timeout, futures::future::join_all(joins)).await;
        if drained.is_err() {
            warn!(
                target: "durasql::runtime",
                runtime_id = %self.runtime_id,
                timeout_ms = self.options.shutdown_timeout.as_millis() as u64,
                "Dispatchers did not stop in time, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
        }
        info!(target: "durasql::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }
}
