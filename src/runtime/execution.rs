//! Turn planning and commit assembly.
//!
//! `plan_execution` decides which execution a fetched batch belongs to (new,
//! continued-as-new, or the current one). `build_commit` turns a replay
//! outcome into the atomic write handed to the provider.

use super::replay_engine::{ScheduledAction, TurnOutcome, TurnResult};
use crate::context::Action;
use crate::providers::{ExecutionMetadata, OrchestrationItem, TurnCommit, WorkItem};
use crate::{Event, EventKind, FailureDetails, ParentLink, INITIAL_EXECUTION_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StartRequest {
    pub orchestration: String,
    pub input: String,
    pub parent: Option<ParentLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutionPlan {
    pub execution_id: u64,
    pub baseline: Vec<Event>,
    /// Present when this turn begins a new execution.
    pub start: Option<StartRequest>,
}

impl ExecutionPlan {
    /// Orchestration this execution runs: the start request's, or the one
    /// recorded in the baseline's `ExecutionStarted`.
    pub fn orchestration_name(&self) -> Option<&str> {
        if let Some(start) = &self.start {
            return Some(&start.orchestration);
        }
        self.baseline.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Pick the execution this batch applies to. `None` means the batch has
/// nothing to run against (terminal history, or no start for an empty one)
/// and should be consumed without changes.
pub(crate) fn plan_execution(item: &OrchestrationItem) -> Option<ExecutionPlan> {
    let last = item.history.last();

    if last.is_none() {
        let start = item.messages.iter().find_map(|m| match m {
            WorkItem::StartOrchestration {
                orchestration,
                input,
                parent,
                ..
            } => Some(StartRequest {
                orchestration: orchestration.clone(),
                input: input.clone(),
                parent: parent.clone(),
            }),
            _ => None,
        })?;
        return Some(ExecutionPlan {
            execution_id: item.execution_id,
            baseline: Vec::new(),
            start: Some(start),
        });
    }

    match last.map(|e| &e.kind) {
        Some(EventKind::ContinuedAsNew { .. }) => {
            let start = item.messages.iter().find_map(|m| match m {
                WorkItem::ContinueAsNew {
                    orchestration,
                    input,
                    parent,
                    ..
                } => Some(StartRequest {
                    orchestration: orchestration.clone(),
                    input: input.clone(),
                    parent: parent.clone(),
                }),
                _ => None,
            })?;
            Some(ExecutionPlan {
                execution_id: item.execution_id + 1,
                baseline: Vec::new(),
                start: Some(start),
            })
        }
        Some(kind) if kind.is_terminal() => None,
        _ => Some(ExecutionPlan {
            execution_id: item.execution_id,
            baseline: item.history.clone(),
            start: None,
        }),
    }
}

/// Sub-orchestration starts that did not begin an execution. Each one gets a
/// failure sent back to its parent so the parent does not wait forever.
pub(crate) fn rejected_child_starts(item: &OrchestrationItem, plan: Option<&ExecutionPlan>) -> Vec<WorkItem> {
    let mut consumed_start = item.history.is_empty() && plan.is_some_and(|p| p.start.is_some());
    item.messages
        .iter()
        .filter_map(|m| match m {
            WorkItem::StartOrchestration { parent, .. } => {
                if consumed_start {
                    consumed_start = false;
                    return None;
                }
                parent.as_ref().map(|p| WorkItem::SubOrchFailed {
                    parent_instance: p.instance.clone(),
                    parent_execution_id: p.execution_id,
                    parent_id: p.event_id,
                    details: FailureDetails::application(format!(
                        "sub-orchestration instance '{}' already exists",
                        item.instance
                    )),
                })
            }
            _ => None,
        })
        .collect()
}

/// Assemble the provider write for one turn.
pub(crate) fn build_commit(instance: &str, execution_id: u64, outcome: TurnOutcome) -> TurnCommit {
    if outcome.history_delta.is_empty() {
        return TurnCommit {
            execution_id,
            ..Default::default()
        };
    }

    let mut worker_items = Vec::new();
    let mut orchestrator_items = Vec::new();

    for ScheduledAction { id, action } in outcome.actions {
        match action {
            Action::CallActivity { name, input } => worker_items.push(WorkItem::ActivityExecute {
                instance: instance.to_string(),
                execution_id,
                id,
                name,
                input,
            }),
            Action::CreateTimer { fire_at_ms } => orchestrator_items.push(WorkItem::TimerFired {
                instance: instance.to_string(),
                execution_id,
                id,
                fire_at_ms,
            }),
            Action::StartSubOrchestration {
                name,
                instance: child,
                input,
            } => orchestrator_items.push(WorkItem::StartOrchestration {
                instance: child,
                orchestration: name,
                input,
                execution_id: INITIAL_EXECUTION_ID,
                parent: Some(ParentLink {
                    instance: instance.to_string(),
                    execution_id,
                    event_id: id,
                }),
            }),
        }
    }

    let output = match &outcome.result {
        TurnResult::Continue => None,
        TurnResult::Completed(v) => Some(v.clone()),
        TurnResult::Failed(details) => Some(details.to_json()),
        TurnResult::ContinueAsNew(input) => Some(input.clone()),
        TurnResult::Terminated(reason) => Some(reason.clone()),
    };

    match (&outcome.result, &outcome.parent) {
        (TurnResult::Completed(v), Some(p)) => orchestrator_items.push(WorkItem::SubOrchCompleted {
            parent_instance: p.instance.clone(),
            parent_execution_id: p.execution_id,
            parent_id: p.event_id,
            result: v.clone(),
        }),
        (TurnResult::Failed(details), Some(p)) => orchestrator_items.push(WorkItem::SubOrchFailed {
            parent_instance: p.instance.clone(),
            parent_execution_id: p.execution_id,
            parent_id: p.event_id,
            details: details.clone(),
        }),
        (TurnResult::Terminated(reason), Some(p)) => orchestrator_items.push(WorkItem::SubOrchFailed {
            parent_instance: p.instance.clone(),
            parent_execution_id: p.execution_id,
            parent_id: p.event_id,
            details: FailureDetails::terminated(reason.clone()),
        }),
        _ => {}
    }

    if let TurnResult::ContinueAsNew(input) = &outcome.result {
        orchestrator_items.push(WorkItem::ContinueAsNew {
            instance: instance.to_string(),
            orchestration: outcome.orchestration_name.clone().unwrap_or_default(),
            input: input.clone(),
            parent: outcome.parent.clone(),
        });
    }

    TurnCommit {
        execution_id,
        history_delta: outcome.history_delta,
        worker_items,
        orchestrator_items,
        metadata: ExecutionMetadata {
            orchestration_name: outcome.orchestration_name,
            input: outcome.started_input,
            status: Some(outcome.result.status()),
            output,
            custom_status: outcome.custom_status,
            parent_instance: outcome.parent.map(|p| p.instance),
        },
    }
}
