//! # durasql
//!
//! Durable orchestrations on top of a relational store.
//!
//! An orchestration is ordinary `async` Rust code that schedules activities,
//! timers, sub-orchestrations and waits for external events through an
//! [`OrchestrationContext`]. Every decision it makes is recorded as an
//! append-only history of [`Event`]s. When a new message arrives the
//! orchestration is re-run from the start against that history (replay):
//! completed work is answered from history, only genuinely new decisions turn
//! into new work.
//!
//! The store is shared by any number of runtime processes. Work is claimed
//! through time-limited leases so at most one dispatcher owns an instance at a
//! time, and each turn commits its history, outbound messages and lease release
//! in a single transaction.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use durasql::providers::sqlite::SqliteProvider;
//! use durasql::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
//! use durasql::runtime::{Runtime, RuntimeOptions};
//! use durasql::{Client, OrchestrationContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteProvider::new("sqlite:./app.db", None).await?);
//!
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//!
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.schedule_activity("Greet", name).await
//!     })
//!     .build();
//!
//! let rt = Runtime::start(store.clone(), activities, orchestrations, RuntimeOptions::default()).await?;
//!
//! let client = Client::new(store);
//! client.create_instance("greeting-1", "HelloWorld", "World").await?;
//! let info = client.wait_for_completion("greeting-1", Duration::from_secs(10)).await?;
//! println!("{:?} {:?}", info.status, info.output);
//!
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! Orchestration code must make the same decisions every time it sees the same
//! history. Use [`OrchestrationContext::current_time_ms`] instead of the system
//! clock, push I/O into activities, and use the `durable_*!` logging macros so
//! replays stay quiet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod client;
pub mod context;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError};
pub use context::{
    Action, ActivityFuture, ExternalEventFuture, OrchestrationContext, SubOrchestrationFuture, TimerFuture,
};
pub use providers::{ExecutionInfo, InstanceInfo, Provider, ProviderError, PurgeFilter, PurgeResult, WorkItem};
pub use runtime::registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};
pub use runtime::{Runtime, RuntimeError, RuntimeOptions};

/// First execution of every instance. Each continue-as-new increments it.
pub const INITIAL_EXECUTION_ID: u64 = 1;

/// Event ids start at 1 within each execution and are strictly sequential.
pub const INITIAL_EVENT_ID: u64 = 1;

/// Lifecycle status of an instance or a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    /// Created by a client, first turn not yet committed.
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    /// The execution ended by continuing as new. The instance keeps going.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::Failed => "Failed",
            OrchestrationStatus::Terminated => "Terminated",
            OrchestrationStatus::ContinuedAsNew => "ContinuedAsNew",
        }
    }

    /// Terminal for the instance: nothing will run again unless the instance
    /// id is re-created.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed | OrchestrationStatus::Terminated
        )
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrchestrationStatus::Pending),
            "Running" => Ok(OrchestrationStatus::Running),
            "Completed" => Ok(OrchestrationStatus::Completed),
            "Failed" => Ok(OrchestrationStatus::Failed),
            "Terminated" => Ok(OrchestrationStatus::Terminated),
            "ContinuedAsNew" => Ok(OrchestrationStatus::ContinuedAsNew),
            other => Err(format!("unknown orchestration status '{other}'")),
        }
    }
}

/// Structured failure carried by failed activities, sub-orchestrations and executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub error_type: String,
    pub message: String,
}

impl FailureDetails {
    /// Error returned by user code.
    pub const APPLICATION: &'static str = "ApplicationError";
    /// User code panicked.
    pub const PANIC: &'static str = "Panic";
    /// No handler registered under the requested name.
    pub const UNREGISTERED: &'static str = "Unregistered";
    /// Code and history disagree.
    pub const NONDETERMINISM: &'static str = "Nondeterminism";
    /// Message exceeded the delivery attempt budget.
    pub const POISON: &'static str = "PoisonMessage";
    pub const TERMINATED: &'static str = "Terminated";

    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Self::APPLICATION, message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(Self::PANIC, message)
    }

    pub fn unregistered(kind: &str, name: &str) -> Self {
        Self::new(Self::UNREGISTERED, format!("{kind} '{name}' is not registered"))
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self::new(Self::NONDETERMINISM, message)
    }

    pub fn poison(message: impl Into<String>) -> Self {
        Self::new(Self::POISON, message)
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::new(Self::TERMINATED, reason)
    }

    /// Serialized form stored as the output of a failed execution.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{}: {}", self.error_type, self.message))
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

impl fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Link from a child instance back to the parent's scheduling event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    /// Event id of the parent's `SubOrchestrationScheduled`.
    pub event_id: u64,
}

/// What happened. Completions point back at their scheduling event through
/// [`Event::source_event_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ExecutionStarted {
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },
    /// Marks the start of a turn. Its timestamp is the logical clock for the turn.
    OrchestratorStarted,
    TaskScheduled {
        name: String,
        input: String,
    },
    TaskCompleted {
        result: String,
    },
    TaskFailed {
        details: FailureDetails,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    EventRaised {
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: FailureDetails,
    },
    /// `status` is `Completed` or `Failed`. A failed result holds serialized [`FailureDetails`].
    ExecutionCompleted {
        status: OrchestrationStatus,
        result: String,
    },
    ExecutionTerminated {
        reason: String,
    },
    ContinuedAsNew {
        input: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::OrchestratorStarted => "OrchestratorStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::ContinuedAsNew { .. } => "ContinuedAsNew",
        }
    }

    /// Closes the execution. Nothing may be appended after it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted { .. } | EventKind::ExecutionTerminated { .. } | EventKind::ContinuedAsNew { .. }
        )
    }
}

/// One entry of an execution's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<u64>,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, source_event_id: Option<u64>, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            source_event_id,
            timestamp_ms,
            kind,
        }
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
