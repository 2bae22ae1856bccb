//! Orchestration-facing API.
//!
//! Scheduling calls record an [`Action`] immediately and hand back a future.
//! The replay engine binds each recorded action to its scheduling event in
//! history (by emission order) and resolves the future once the matching
//! completion has been replayed.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

/// Work requested by orchestration code during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { name: String, input: String },
    CreateTimer { fire_at_ms: u64 },
    StartSubOrchestration { name: String, instance: String, input: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    Succeeded(String),
    Failed(String),
    TimerFired,
}

struct CtxInner {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    is_replaying: bool,
    current_time_ms: u64,

    next_token: u64,
    emitted: VecDeque<(u64, Action)>,
    // token -> scheduling event id, set when the action is matched against history
    bindings: HashMap<u64, u64>,
    // scheduling event id -> completion payload
    results: HashMap<u64, Completion>,
    // external event payloads by name, in history order
    arrivals: HashMap<String, Vec<String>>,
    // next subscription index handed out per event name
    next_wait_index: HashMap<String, usize>,

    continue_as_new: Option<String>,
    custom_status: Option<String>,
}

/// Handle passed to orchestration code. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &inner.instance_id)
            .field("execution_id", &inner.execution_id)
            .field("orchestration_name", &inner.orchestration_name)
            .field("is_replaying", &inner.is_replaying)
            .finish()
    }
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: impl Into<String>, execution_id: u64, orchestration_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance_id: instance_id.into(),
                execution_id,
                orchestration_name: orchestration_name.into(),
                is_replaying: true,
                current_time_ms: 0,
                next_token: 0,
                emitted: VecDeque::new(),
                bindings: HashMap::new(),
                results: HashMap::new(),
                arrivals: HashMap::new(),
                next_wait_index: HashMap::new(),
                continue_as_new: None,
                custom_status: None,
            })),
        }
    }

    // A panic in user code while the lock is held must not wedge the engine.
    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while user code is re-deriving decisions already recorded in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    /// Logical clock: the start time of the turn being replayed or executed.
    /// Deterministic across replays.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().current_time_ms
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    pub fn orchestration_name(&self) -> String {
        self.lock().orchestration_name.clone()
    }

    fn emit(&self, action: Action) -> u64 {
        let mut inner = self.lock();
        inner.next_token += 1;
        let token = inner.next_token;
        inner.emitted.push_back((token, action));
        token
    }

    /// Schedule an activity by registered name.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let token = self.emit(Action::CallActivity {
            name: name.into(),
            input: input.into(),
        });
        ActivityFuture { token, ctx: self.clone() }
    }

    /// Durable timer relative to the logical clock.
    pub fn create_timer(&self, delay: Duration) -> TimerFuture {
        let fire_at_ms = self.current_time_ms().saturating_add(delay.as_millis() as u64);
        self.create_timer_at(fire_at_ms)
    }

    /// Durable timer firing at an absolute time (ms since epoch).
    pub fn create_timer_at(&self, fire_at_ms: u64) -> TimerFuture {
        let token = self.emit(Action::CreateTimer { fire_at_ms });
        TimerFuture { token, ctx: self.clone() }
    }

    /// Wait for the next event raised under `name`.
    ///
    /// Events are buffered: one raised before the wait was created is still
    /// delivered. The n-th wait created for a name receives the n-th event
    /// raised with that name.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> ExternalEventFuture {
        let name = name.into();
        let mut inner = self.lock();
        let slot = inner.next_wait_index.entry(name.clone()).or_insert(0);
        let index = *slot;
        *slot += 1;
        drop(inner);
        ExternalEventFuture {
            name,
            index,
            ctx: self.clone(),
        }
    }

    /// Start a child orchestration and wait for its result.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        instance: impl Into<String>,
        input: impl Into<String>,
    ) -> SubOrchestrationFuture {
        let token = self.emit(Action::StartSubOrchestration {
            name: name.into(),
            instance: instance.into(),
            input: input.into(),
        });
        SubOrchestrationFuture { token, ctx: self.clone() }
    }

    /// End this execution and start a fresh one for the same instance with
    /// `input`. The orchestration should return right after calling this;
    /// its return value is discarded.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().continue_as_new = Some(input.into());
    }

    /// Free-form status visible to clients through the instance info.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().custom_status = Some(status.into());
    }

    // Engine side

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.lock().is_replaying = replaying;
    }

    pub(crate) fn set_current_time(&self, time_ms: u64) {
        self.lock().current_time_ms = time_ms;
    }

    pub(crate) fn drain_emitted(&self) -> VecDeque<(u64, Action)> {
        std::mem::take(&mut self.lock().emitted)
    }

    pub(crate) fn bind(&self, token: u64, schedule_id: u64) {
        self.lock().bindings.insert(token, schedule_id);
    }

    pub(crate) fn complete(&self, schedule_id: u64, completion: Completion) {
        self.lock().results.insert(schedule_id, completion);
    }

    pub(crate) fn deliver_event(&self, name: &str, data: &str) {
        self.lock()
            .arrivals
            .entry(name.to_string())
            .or_default()
            .push(data.to_string());
    }

    pub(crate) fn take_continue_as_new(&self) -> Option<String> {
        self.lock().continue_as_new.take()
    }

    pub(crate) fn custom_status(&self) -> Option<String> {
        self.lock().custom_status.clone()
    }

    fn completion_for(&self, token: u64) -> Option<Completion> {
        let inner = self.lock();
        let schedule_id = inner.bindings.get(&token)?;
        inner.results.get(schedule_id).cloned()
    }
}

/// Resolves with the activity's output or its failure message.
pub struct ActivityFuture {
    token: u64,
    ctx: OrchestrationContext,
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.completion_for(self.token) {
            Some(Completion::Succeeded(v)) => Poll::Ready(Ok(v)),
            Some(Completion::Failed(e)) => Poll::Ready(Err(e)),
            Some(Completion::TimerFired) => Poll::Ready(Err("activity resolved by a timer".to_string())),
            None => Poll::Pending,
        }
    }
}

pub struct TimerFuture {
    token: u64,
    ctx: OrchestrationContext,
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.completion_for(self.token) {
            Some(_) => Poll::Ready(()),
            None => Poll::Pending,
        }
    }
}

pub struct ExternalEventFuture {
    name: String,
    index: usize,
    ctx: OrchestrationContext,
}

impl Future for ExternalEventFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.ctx.lock();
        match inner.arrivals.get(&self.name).and_then(|a| a.get(self.index)) {
            Some(data) => Poll::Ready(data.clone()),
            None => Poll::Pending,
        }
    }
}

pub struct SubOrchestrationFuture {
    token: u64,
    ctx: OrchestrationContext,
}

impl Future for SubOrchestrationFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.completion_for(self.token) {
            Some(Completion::Succeeded(v)) => Poll::Ready(Ok(v)),
            Some(Completion::Failed(e)) => Poll::Ready(Err(e)),
            Some(Completion::TimerFired) => Poll::Ready(Err("sub-orchestration resolved by a timer".to_string())),
            None => Poll::Pending,
        }
    }
}
