//! Turn execution by command-vs-history replay.
//!
//! A turn takes the execution's stored history (the baseline) plus the
//! messages fetched with it. Accepted messages become completion events at
//! the end of the history. The orchestration is then re-run from scratch
//! against the combined history:
//!
//! - every scheduling event must match the next action the code emitted
//! - every completion event resolves the future bound to its scheduling event
//! - actions emitted beyond the recorded history become new scheduling events
//!
//! Only newly appended events (the delta) are persisted by the caller.

use crate::context::{Action, Completion};
use crate::runtime::registry::OrchestrationHandler;
use crate::providers::WorkItem;
use crate::{Event, EventKind, FailureDetails, OrchestrationContext, OrchestrationStatus, ParentLink, INITIAL_EVENT_ID};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// New scheduling work produced by a turn. `id` is the event id of the
/// scheduling event and is the correlation key carried by the work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledAction {
    pub id: u64,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TurnResult {
    /// Still waiting on something.
    Continue,
    Completed(String),
    Failed(FailureDetails),
    ContinueAsNew(String),
    Terminated(String),
}

impl TurnResult {
    pub(crate) fn status(&self) -> OrchestrationStatus {
        match self {
            TurnResult::Continue => OrchestrationStatus::Running,
            TurnResult::Completed(_) => OrchestrationStatus::Completed,
            TurnResult::Failed(_) => OrchestrationStatus::Failed,
            TurnResult::ContinueAsNew(_) => OrchestrationStatus::ContinuedAsNew,
            TurnResult::Terminated(_) => OrchestrationStatus::Terminated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TurnOutcome {
    pub history_delta: Vec<Event>,
    pub actions: Vec<ScheduledAction>,
    pub result: TurnResult,
    pub custom_status: Option<String>,
    pub orchestration_name: Option<String>,
    pub parent: Option<ParentLink>,
    /// Input of the execution, set only on the turn that started it.
    pub started_input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Activity,
    Timer,
    SubOrchestration,
}

impl ScheduleKind {
    fn of_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::TaskScheduled { .. } => Some(ScheduleKind::Activity),
            EventKind::TimerCreated { .. } => Some(ScheduleKind::Timer),
            EventKind::SubOrchestrationScheduled { .. } => Some(ScheduleKind::SubOrchestration),
            _ => None,
        }
    }
}

enum Finish {
    Returned(Result<String, String>),
    Panicked(String),
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

pub(crate) struct ReplayEngine {
    instance: String,
    execution_id: u64,
    baseline: Vec<Event>,
    delta: Vec<Event>,
    turn_time_ms: u64,
    turn_started: bool,
    terminate_reason: Option<String>,
}

impl ReplayEngine {
    pub(crate) fn new(instance: impl Into<String>, execution_id: u64, baseline: Vec<Event>, turn_time_ms: u64) -> Self {
        Self {
            instance: instance.into(),
            execution_id,
            baseline,
            delta: Vec::new(),
            turn_time_ms,
            turn_started: false,
            terminate_reason: None,
        }
    }

    fn history(&self) -> impl Iterator<Item = &Event> {
        self.baseline.iter().chain(self.delta.iter())
    }

    fn next_event_id(&self) -> u64 {
        self.history().last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID)
    }

    fn push(&mut self, source_event_id: Option<u64>, kind: EventKind) -> u64 {
        let event_id = self.next_event_id();
        self.delta
            .push(Event::new(event_id, source_event_id, self.turn_time_ms, kind));
        event_id
    }

    fn ensure_turn_started(&mut self) {
        if !self.turn_started {
            self.turn_started = true;
            self.push(None, EventKind::OrchestratorStarted);
        }
    }

    fn is_terminal(&self) -> bool {
        self.history().last().is_some_and(|e| e.kind.is_terminal())
    }

    fn started(&self) -> Option<(&str, &str, Option<&ParentLink>)> {
        self.history().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted { name, input, parent } => Some((name.as_str(), input.as_str(), parent.as_ref())),
            _ => None,
        })
    }

    /// Begin a fresh execution. Only valid on an empty history.
    pub(crate) fn start_execution(&mut self, name: &str, input: &str, parent: Option<ParentLink>) {
        if !self.baseline.is_empty() || !self.delta.is_empty() {
            warn!(
                target: "durasql::runtime::replay",
                instance = %self.instance,
                "Ignoring start for an execution that already has history"
            );
            return;
        }
        self.push(
            None,
            EventKind::ExecutionStarted {
                name: name.to_string(),
                input: input.to_string(),
                parent,
            },
        );
        self.ensure_turn_started();
    }

    /// Convert fetched messages into completion events. Messages for another
    /// execution, duplicates and completions without a matching scheduling
    /// event are dropped.
    pub(crate) fn prep_messages(&mut self, messages: &[WorkItem]) {
        let mut scheduled: HashMap<u64, ScheduleKind> = HashMap::new();
        let mut resolved: HashSet<u64> = HashSet::new();
        for event in self.history() {
            if let Some(kind) = ScheduleKind::of_event(&event.kind) {
                scheduled.insert(event.event_id, kind);
            }
            if let Some(source) = event.source_event_id {
                resolved.insert(source);
            }
        }

        for msg in messages {
            let staged = match msg {
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => continue,
                WorkItem::TerminateInstance { reason, .. } => {
                    if self.terminate_reason.is_none() {
                        self.terminate_reason = Some(reason.clone());
                    }
                    continue;
                }
                WorkItem::ExternalRaised { name, data, .. } => {
                    self.ensure_turn_started();
                    self.push(
                        None,
                        EventKind::EventRaised {
                            name: name.clone(),
                            data: data.clone(),
                        },
                    );
                    continue;
                }
                WorkItem::ActivityCompleted {
                    execution_id, id, result, ..
                } => (
                    *execution_id,
                    *id,
                    ScheduleKind::Activity,
                    EventKind::TaskCompleted { result: result.clone() },
                ),
                WorkItem::ActivityFailed {
                    execution_id, id, details, ..
                } => (
                    *execution_id,
                    *id,
                    ScheduleKind::Activity,
                    EventKind::TaskFailed {
                        details: details.clone(),
                    },
                ),
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => (
                    *execution_id,
                    *id,
                    ScheduleKind::Timer,
                    EventKind::TimerFired { fire_at_ms: *fire_at_ms },
                ),
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } => (
                    *parent_execution_id,
                    *parent_id,
                    ScheduleKind::SubOrchestration,
                    EventKind::SubOrchestrationCompleted { result: result.clone() },
                ),
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    details,
                    ..
                } => (
                    *parent_execution_id,
                    *parent_id,
                    ScheduleKind::SubOrchestration,
                    EventKind::SubOrchestrationFailed {
                        details: details.clone(),
                    },
                ),
                WorkItem::ActivityExecute { .. } => {
                    warn!(target: "durasql::runtime::replay", instance = %self.instance, "ActivityExecute on the orchestrator queue, dropping");
                    continue;
                }
            };

            let (execution_id, source_id, expected, kind) = staged;
            if execution_id != self.execution_id {
                debug!(
                    target: "durasql::runtime::replay",
                    instance = %self.instance,
                    message_execution_id = execution_id,
                    current_execution_id = self.execution_id,
                    kind = msg.kind_name(),
                    "Dropping completion for another execution"
                );
                continue;
            }
            if scheduled.get(&source_id) != Some(&expected) {
                warn!(
                    target: "durasql::runtime::replay",
                    instance = %self.instance,
                    source_event_id = source_id,
                    kind = msg.kind_name(),
                    "Dropping completion with no matching scheduling event"
                );
                continue;
            }
            if !resolved.insert(source_id) {
                debug!(
                    target: "durasql::runtime::replay",
                    instance = %self.instance,
                    source_event_id = source_id,
                    "Dropping duplicate completion"
                );
                continue;
            }

            self.ensure_turn_started();
            self.push(Some(source_id), kind);
        }
    }

    /// Close the execution as failed without running user code.
    pub(crate) fn fail(mut self, details: FailureDetails) -> TurnOutcome {
        if self.is_terminal() {
            return self.into_outcome(Vec::new(), TurnResult::Continue, None);
        }
        self.ensure_turn_started();
        self.push(
            None,
            EventKind::ExecutionCompleted {
                status: OrchestrationStatus::Failed,
                result: details.to_json(),
            },
        );
        self.into_outcome(Vec::new(), TurnResult::Failed(details), None)
    }

    /// Run the orchestration against the combined history and append the
    /// resulting scheduling and terminal events.
    pub(crate) fn execute(mut self, handler: &dyn OrchestrationHandler) -> TurnOutcome {
        if self.is_terminal() {
            return self.into_outcome(Vec::new(), TurnResult::Continue, None);
        }

        if let Some(reason) = self.terminate_reason.take() {
            self.ensure_turn_started();
            self.push(None, EventKind::ExecutionTerminated { reason: reason.clone() });
            return self.into_outcome(Vec::new(), TurnResult::Terminated(reason), None);
        }

        if self.delta.is_empty() {
            return self.into_outcome(Vec::new(), TurnResult::Continue, None);
        }

        let Some((name, input, _)) = self.started() else {
            return self.fail(FailureDetails::nondeterminism(
                "history does not begin with ExecutionStarted",
            ));
        };
        let ctx = OrchestrationContext::new(self.instance.clone(), self.execution_id, name);
        let input = input.to_string();

        let replayed = self.replay(&ctx, handler.invoke(ctx.clone(), input));
        let (finish, leftover) = match replayed {
            Ok(v) => v,
            Err(message) => {
                warn!(
                    target: "durasql::runtime::replay",
                    instance = %self.instance,
                    execution_id = self.execution_id,
                    error = %message,
                    "Nondeterministic replay"
                );
                return self.fail(FailureDetails::nondeterminism(message));
            }
        };

        let custom_status = ctx.custom_status();
        let continue_as_new = ctx.take_continue_as_new();
        let result = match (finish, continue_as_new) {
            (Some(Finish::Panicked(message)), _) => TurnResult::Failed(FailureDetails::panic(message)),
            (Some(Finish::Returned(_)), Some(next_input)) => TurnResult::ContinueAsNew(next_input),
            (Some(Finish::Returned(Ok(output))), None) => TurnResult::Completed(output),
            (Some(Finish::Returned(Err(error))), None) => TurnResult::Failed(FailureDetails::application(error)),
            (None, _) => TurnResult::Continue,
        };

        let mut actions = Vec::new();
        if result == TurnResult::Continue {
            for (_, action) in leftover {
                let kind = match &action {
                    Action::CallActivity { name, input } => EventKind::TaskScheduled {
                        name: name.clone(),
                        input: input.clone(),
                    },
                    Action::CreateTimer { fire_at_ms } => EventKind::TimerCreated { fire_at_ms: *fire_at_ms },
                    Action::StartSubOrchestration { name, instance, input } => EventKind::SubOrchestrationScheduled {
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    },
                };
                let id = self.push(None, kind);
                actions.push(ScheduledAction { id, action });
            }
        } else if !leftover.is_empty() {
            debug!(
                target: "durasql::runtime::replay",
                instance = %self.instance,
                dropped = leftover.len(),
                "Execution finished with unawaited actions; not scheduling them"
            );
        }

        match &result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                self.push(
                    None,
                    EventKind::ExecutionCompleted {
                        status: OrchestrationStatus::Completed,
                        result: output.clone(),
                    },
                );
            }
            TurnResult::Failed(details) => {
                self.push(
                    None,
                    EventKind::ExecutionCompleted {
                        status: OrchestrationStatus::Failed,
                        result: details.to_json(),
                    },
                );
            }
            TurnResult::ContinueAsNew(next_input) => {
                self.push(None, EventKind::ContinuedAsNew { input: next_input.clone() });
            }
            TurnResult::Terminated(reason) => {
                self.push(None, EventKind::ExecutionTerminated { reason: reason.clone() });
            }
        }

        self.into_outcome(actions, result, custom_status)
    }

    fn replay(
        &self,
        ctx: &OrchestrationContext,
        mut fut: HandlerFuture<'_>,
    ) -> Result<(Option<Finish>, VecDeque<(u64, Action)>), String> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let baseline_len = self.baseline.len();
        let mut emitted: VecDeque<(u64, Action)> = VecDeque::new();
        let mut open: HashMap<u64, ScheduleKind> = HashMap::new();
        let mut finish: Option<Finish> = None;
        let mut must_poll = false;
        let mut code_started = false;

        let mut poll = |finish: &mut Option<Finish>, emitted: &mut VecDeque<(u64, Action)>| {
            if finish.is_none() {
                *finish = match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
                    Ok(Poll::Ready(out)) => Some(Finish::Returned(out)),
                    Ok(Poll::Pending) => None,
                    Err(payload) => Some(Finish::Panicked(panic_message(payload.as_ref()))),
                };
            }
            emitted.extend(ctx.drain_emitted());
        };

        for (idx, event) in self.history().enumerate() {
            // A poll resumes code unblocked by the previous event, so it runs
            // before this event can move the logical clock.
            if must_poll {
                ctx.set_replaying(idx <= baseline_len);
                poll(&mut finish, &mut emitted);
                must_poll = false;
            }

            match &event.kind {
                EventKind::ExecutionStarted { .. } => {}
                EventKind::OrchestratorStarted => {
                    ctx.set_current_time(event.timestamp_ms);
                    if !code_started {
                        code_started = true;
                        must_poll = true;
                    }
                }
                EventKind::TaskScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::SubOrchestrationScheduled { .. } => {
                    let (token, action) = emitted.pop_front().ok_or_else(|| {
                        format!(
                            "history has {} at event {} but the orchestration did not schedule it",
                            event.kind.name(),
                            event.event_id
                        )
                    })?;
                    match_schedule(&action, event)?;
                    ctx.bind(token, event.event_id);
                    if let Some(kind) = ScheduleKind::of_event(&event.kind) {
                        open.insert(event.event_id, kind);
                    }
                }
                EventKind::TaskCompleted { .. }
                | EventKind::TaskFailed { .. }
                | EventKind::TimerFired { .. }
                | EventKind::SubOrchestrationCompleted { .. }
                | EventKind::SubOrchestrationFailed { .. } => {
                    let (source_id, expected, completion) = to_completion(event)?;
                    if open.get(&source_id) != Some(&expected) {
                        return Err(format!(
                            "{} at event {} has no matching scheduling event {}",
                            event.kind.name(),
                            event.event_id,
                            source_id
                        ));
                    }
                    ctx.complete(source_id, completion);
                    must_poll = true;
                }
                EventKind::EventRaised { name, data } => {
                    ctx.deliver_event(name, data);
                    must_poll = true;
                }
                EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionTerminated { .. }
                | EventKind::ContinuedAsNew { .. } => {
                    return Err(format!("terminal event {} found mid-history", event.event_id));
                }
            }
        }

        if must_poll {
            ctx.set_replaying(false);
            poll(&mut finish, &mut emitted);
        }
        Ok((finish, emitted))
    }

    fn into_outcome(self, actions: Vec<ScheduledAction>, result: TurnResult, custom_status: Option<String>) -> TurnOutcome {
        let (orchestration_name, parent) = match self.started() {
            Some((name, _, parent)) => (Some(name.to_string()), parent.cloned()),
            None => (None, None),
        };
        let started_input = self.delta.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted { input, .. } => Some(input.clone()),
            _ => None,
        });
        TurnOutcome {
            history_delta: self.delta,
            actions,
            result,
            custom_status,
            orchestration_name,
            parent,
            started_input,
        }
    }
}

fn match_schedule(action: &Action, event: &Event) -> Result<(), String> {
    let matches = match (action, &event.kind) {
        (Action::CallActivity { name, input }, EventKind::TaskScheduled { name: n, input: i }) => name == n && input == i,
        (Action::CreateTimer { fire_at_ms }, EventKind::TimerCreated { fire_at_ms: f }) => fire_at_ms == f,
        (
            Action::StartSubOrchestration { name, instance, input },
            EventKind::SubOrchestrationScheduled {
                name: n,
                instance: inst,
                input: i,
            },
        ) => name == n && instance == inst && input == i,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(format!(
            "schedule mismatch at event {}: code emitted {action:?} but history recorded {:?}",
            event.event_id, event.kind
        ))
    }
}

fn to_completion(event: &Event) -> Result<(u64, ScheduleKind, Completion), String> {
    let source_id = event
        .source_event_id
        .ok_or_else(|| format!("{} at event {} has no source event id", event.kind.name(), event.event_id))?;
    let (kind, completion) = match &event.kind {
        EventKind::TaskCompleted { result } => (ScheduleKind::Activity, Completion::Succeeded(result.clone())),
        EventKind::TaskFailed { details } => (ScheduleKind::Activity, Completion::Failed(details.message.clone())),
        EventKind::TimerFired { .. } => (ScheduleKind::Timer, Completion::TimerFired),
        EventKind::SubOrchestrationCompleted { result } => {
            (ScheduleKind::SubOrchestration, Completion::Succeeded(result.clone()))
        }
        EventKind::SubOrchestrationFailed { details } => {
            (ScheduleKind::SubOrchestration, Completion::Failed(details.message.clone()))
        }
        other => return Err(format!("{} is not a completion", other.name())),
    };
    Ok((source_id, kind, completion))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
