use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::providers::{
    CreateOutcome, ExecutionInfo, InstanceInfo, NewInstance, Provider, ProviderError, PurgeFilter, PurgeResult,
    WorkItem,
};
use crate::Event;
use tracing::{debug, info};

/// First and maximum sleep between status polls in `wait_for_completion`.
const WAIT_POLL_START: Duration = Duration::from_millis(5);
const WAIT_POLL_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A non-terminal instance with this id already exists.
    #[error("instance '{0}' already exists and is not terminal")]
    InstanceExists(String),
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Thin client for control-plane operations.
///
/// The client never talks to a runtime directly. It writes to and reads from
/// the shared provider; runtimes pick the messages up from the queues.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.store
    }

    /// Start an orchestration instance and return its execution id.
    ///
    /// An id whose instance is terminal is started again with the next
    /// execution id. An id that is still pending or running is rejected with
    /// [`ClientError::InstanceExists`].
    pub async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<u64, ClientError> {
        let request = NewInstance {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
        };
        match self.store.create_instance(request).await? {
            CreateOutcome::Created { execution_id } => {
                info!(
                    target: "durasql::client",
                    instance_id = %instance,
                    orchestration_name = %orchestration,
                    execution_id,
                    "Instance created"
                );
                Ok(execution_id)
            }
            CreateOutcome::AlreadyRunning => Err(ClientError::InstanceExists(instance.to_string())),
        }
    }

    /// Raise an external event into an instance.
    ///
    /// Delivered at the instance's next turn. Events nobody waits for are
    /// recorded in history and otherwise ignored.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        let name = event_name.into();
        debug!(target: "durasql::client", instance_id = %instance, event_name = %name, "Raising event");
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name,
            data: data.into(),
        };
        self.store.enqueue_for_orchestrator(item, None).await?;
        Ok(())
    }

    /// Request termination. Applied at the instance's next turn; already
    /// terminal instances are left alone.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let info = self
            .store
            .get_instance_info(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))?;
        if info.status.is_terminal() {
            debug!(
                target: "durasql::client",
                instance_id = %instance,
                status = %info.status,
                "Instance already terminal, ignoring terminate"
            );
            return Ok(());
        }
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_for_orchestrator(item, None).await?;
        info!(target: "durasql::client", instance_id = %instance, "Termination requested");
        Ok(())
    }

    /// Snapshot of the instance row, `None` if it does not exist.
    pub async fn get_status(&self, instance: &str) -> Result<Option<InstanceInfo>, ClientError> {
        Ok(self.store.get_instance_info(instance).await?)
    }

    /// Poll until the instance is Completed, Failed or Terminated.
    ///
    /// An instance that does not exist yet is polled like a running one, so
    /// this also works for sub-orchestrations whose start is still queued.
    pub async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<InstanceInfo, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut delay = WAIT_POLL_START;
        loop {
            if let Some(info) = self.store.get_instance_info(instance).await? {
                if info.status.is_terminal() {
                    return Ok(info);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout(timeout));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(WAIT_POLL_MAX);
        }
    }

    /// History of one execution, the current one when `execution_id` is `None`.
    pub async fn read_history(&self, instance: &str, execution_id: Option<u64>) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_history(instance, execution_id).await?)
    }

    pub async fn list_executions(&self, instance: &str) -> Result<Vec<ExecutionInfo>, ClientError> {
        Ok(self.store.list_executions(instance).await?)
    }

    /// Delete a terminal instance with all of its executions, history and
    /// queued messages. Instances that are missing or not terminal are left
    /// untouched and yield zero counts.
    pub async fn purge_instance(&self, instance: &str) -> Result<PurgeResult, ClientError> {
        let result = self.store.purge_instance(instance).await?;
        info!(
            target: "durasql::client",
            instance_id = %instance,
            events_deleted = result.events_deleted,
            "Instance purged"
        );
        Ok(result)
    }

    /// Retention sweep over terminal instances.
    pub async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ClientError> {
        let result = self.store.purge_instances(filter).await?;
        info!(
            target: "durasql::client",
            instances_deleted = result.instances_deleted,
            events_deleted = result.events_deleted,
            "Purge sweep finished"
        );
        Ok(result)
    }
}
