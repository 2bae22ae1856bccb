//! Storage abstraction: history store, work queues and leases.
//!
//! A provider owns all durable state. The runtime never talks to the database
//! directly; it fetches work under a lease, computes a turn, and commits the
//! turn back through [`Provider::ack_orchestration_item`].
//!
//! # Lease contract
//!
//! - `fetch_orchestration_item` claims the instance for `lock_timeout`. While
//!   the lease is live no other fetch may return the same instance.
//! - `ack_orchestration_item` appends history, enqueues outbound messages,
//!   deletes the consumed messages and releases the lease in one transaction.
//!   It fails without side effects if the lease is no longer held.
//! - `abandon_orchestration_item` releases the lease and leaves the messages
//!   for redelivery, optionally delayed.
//! - An expired lease is reclaimable by any dispatcher. This is how work held
//!   by a crashed process is recovered.

use crate::{Event, FailureDetails, OrchestrationStatus, ParentLink};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod lock;
pub mod sqlite;

pub use error::ProviderError;
pub use lock::{ExclusiveScope, LockError, LockHandle};

/// Message routed through the orchestrator or worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        execution_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },
    /// Worker queue only.
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: FailureDetails,
    },
    /// Enqueued when the timer is created, invisible until `fire_at_ms`.
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: FailureDetails,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance whose queue partition this message belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
        }
    }

    /// Earliest time the message may be delivered, if it is delayed.
    pub(crate) fn visible_at_ms(&self) -> Option<u64> {
        match self {
            WorkItem::TimerFired { fire_at_ms, .. } => Some(*fire_at_ms),
            _ => None,
        }
    }
}

/// Batch of messages for one instance, plus the current execution's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationItem {
    pub instance: String,
    /// `None` when the instance row does not exist yet (first message is a start).
    pub orchestration_name: Option<String>,
    pub execution_id: u64,
    pub history: Vec<Event>,
    /// Ordered by visibility time, then enqueue order.
    pub messages: Vec<WorkItem>,
    /// Set when stored history could not be decoded. `history` is empty then.
    pub history_error: Option<String>,
}

/// Instance and execution row updates committed with a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub orchestration_name: Option<String>,
    /// Input of an execution started in this turn.
    pub input: Option<String>,
    /// `None` leaves instance and execution rows untouched.
    pub status: Option<OrchestrationStatus>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub parent_instance: Option<String>,
}

/// Everything one orchestration turn commits atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnCommit {
    pub execution_id: u64,
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    pub orchestrator_items: Vec<WorkItem>,
    pub metadata: ExecutionMetadata,
}

/// Client-visible instance status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub execution_id: u64,
    pub status: OrchestrationStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub parent_instance: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl InstanceInfo {
    /// Failure details of a failed instance.
    pub fn failure(&self) -> Option<FailureDetails> {
        match self.status {
            OrchestrationStatus::Failed => self.output.as_deref().and_then(FailureDetails::from_json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionInfo {
    pub execution_id: u64,
    pub status: OrchestrationStatus,
    pub output: Option<String>,
    pub event_count: u64,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

/// A new instance (or a new execution of a finished one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstance {
    pub instance: String,
    pub orchestration: String,
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { execution_id: u64 },
    /// A non-terminal instance with that id already exists.
    AlreadyRunning,
}

/// Selection for retention sweeps. Only terminal instances are ever purged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeFilter {
    /// Completed strictly before this time (ms since epoch).
    pub completed_before_ms: Option<u64>,
    /// Restrict to these statuses. Empty means every terminal status.
    pub statuses: Vec<OrchestrationStatus>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeResult {
    pub instances_deleted: u64,
    pub executions_deleted: u64,
    pub events_deleted: u64,
    pub messages_deleted: u64,
}

impl std::ops::AddAssign for PurgeResult {
    fn add_assign(&mut self, rhs: Self) {
        self.instances_deleted += rhs.instances_deleted;
        self.executions_deleted += rhs.executions_deleted;
        self.events_deleted += rhs.events_deleted;
        self.messages_deleted += rhs.messages_deleted;
    }
}

/// Durable store used by the runtime and the client.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Namespace isolating this store's rows from other applications sharing the database.
    fn task_hub(&self) -> &str;

    /// Fails permanently if the stored schema version is not the one this build expects.
    async fn validate_schema(&self) -> Result<(), ProviderError>;

    // Orchestrator queue

    /// Claim the next instance with visible messages.
    ///
    /// Returns the item, its lease token, and the highest delivery attempt
    /// count among the batch.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
        max_batch: usize,
    ) -> Result<Option<(OrchestrationItem, String, u32)>, ProviderError>;

    async fn ack_orchestration_item(&self, lock_token: &str, commit: TurnCommit) -> Result<(), ProviderError>;

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;

    // Worker queue

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String, u32)>, ProviderError>;

    /// Delete the leased work item and enqueue its completion in one transaction.
    async fn ack_work_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    // Management

    /// Create the instance row, its first execution and the start message atomically.
    async fn create_instance(&self, request: NewInstance) -> Result<CreateOutcome, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// History of one execution; the current one when `execution_id` is `None`.
    async fn read_history(&self, instance: &str, execution_id: Option<u64>) -> Result<Vec<Event>, ProviderError>;

    async fn list_executions(&self, instance: &str) -> Result<Vec<ExecutionInfo>, ProviderError>;

    /// Delete a terminal instance with all of its executions, history and queued messages.
    /// Non-terminal or unknown instances are left alone and report zero deletions.
    async fn purge_instance(&self, instance: &str) -> Result<PurgeResult, ProviderError>;

    async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ProviderError>;
}
