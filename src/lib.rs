//! Minimal deterministic orchestration core.
//!
//! This crate exposes a replay-driven programming model that records
//! append-only `Event`s and replays them to make orchestration logic
//! deterministic. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities,
//!   timers, and external-event waits using correlation IDs
//! - A unified `DurableFuture` that can be composed with `join`/`select`
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

// Public orchestration primitives and executor

pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

// Re-export key runtime types for convenience
pub use logging::LogLevel;
pub use runtime::{
    OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus, RetryPolicy,
};

use crate::_typed_codec::Codec;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return raw content to keep plain-string payloads readable
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            // Try parse as JSON first
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Variants use stable correlation IDs (the
/// per-instance call sequence number) to pair scheduling operations with
/// their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration instance was created and started by name with input.
    OrchestrationStarted { name: String, input: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Orchestration was forcibly terminated by an operator.
    OrchestrationTerminated { reason: String },

    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string (retries already exhausted).
    ActivityFailed { id: u64, error: String },

    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Subscription to an external event by name was recorded with a unique ID.
    ExternalSubscribed { id: u64, name: String },
    /// An external event with correlation `id` was raised with some data.
    ExternalEvent { id: u64, name: String, data: String },

    /// Orchestrator published a custom status value visible via status query.
    CustomStatusSet { value: String },
}

impl Event {
    /// Returns true for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The host is
/// responsible for materializing these into corresponding `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer that will fire after the requested delay.
    CreateTimer { id: u64, delay_ms: u64 },
    /// Subscribe to an external event by name.
    WaitExternal { id: u64, name: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    next_correlation_id: u64,

    // Logging and turn metadata
    turn_index: u64,
    logging_enabled_this_poll: bool,
    // Per-turn buffered logs (messages to flush once per progress turn)
    log_buffer: Vec<(LogLevel, String)>,

    // Claimed ids coordinate multiple futures over one history: two futures
    // must never adopt the same scheduling event.
    claimed_activity_ids: std::collections::HashSet<u64>,
    claimed_timer_ids: std::collections::HashSet<u64>,
    claimed_external_ids: std::collections::HashSet<u64>,
    // Number of CustomStatusSet events already re-observed during this replay.
    claimed_status_count: usize,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        // Compute next correlation id based on max id found in history
        let mut max_id = 0u64;
        for ev in &history {
            let id_opt = match ev {
                Event::ActivityScheduled { id, .. }
                | Event::ActivityCompleted { id, .. }
                | Event::ActivityFailed { id, .. }
                | Event::TimerCreated { id, .. }
                | Event::TimerFired { id, .. }
                | Event::ExternalSubscribed { id, .. }
                | Event::ExternalEvent { id, .. } => Some(*id),
                Event::OrchestrationStarted { .. }
                | Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
                | Event::CustomStatusSet { .. } => None,
            };
            if let Some(id) = id_opt {
                max_id = max_id.max(id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            logging_enabled_this_poll: false,
            log_buffer: Vec::new(),
            claimed_activity_ids: Default::default(),
            claimed_timer_ids: Default::default(),
            claimed_external_ids: Default::default(),
            claimed_status_count: 0,
        }
    }

    fn record_action(&mut self, a: Action) {
        // Scheduling a new action means this poll is producing new decisions
        self.logging_enabled_this_poll = true;
        self.actions.push(a);
    }

    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    // Turn metadata
    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    // Replay-safe logging control
    /// Indicates whether logging is enabled for the current poll. This is
    /// flipped on when a decision is recorded to minimize log noise.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }
    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a structured log message for the current turn.
    pub fn push_log(&self, level: LogLevel, msg: String) {
        self.inner.lock().unwrap().log_buffer.push((level, msg));
    }

    /// Buffer a replay-safe trace entry; the host flushes it once per
    /// progress turn, so replays do not duplicate log output.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        self.push_log(level, message.into());
    }

    /// Convenience wrapper for INFO level tracing.
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    /// Convenience wrapper for WARN level tracing.
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    /// Convenience wrapper for ERROR level tracing.
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }
    /// Convenience wrapper for DEBUG level tracing.
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(LogLevel::Debug, message);
    }

    /// Publish a custom status value for this instance. The latest value is
    /// returned by status queries alongside the runtime status. On replay the
    /// recorded event is re-observed instead of re-appended.
    pub fn set_custom_status(&self, value: impl Into<String>) {
        let value: String = value.into();
        let mut inner = self.inner.lock().unwrap();
        let seen = inner
            .history
            .iter()
            .filter(|e| matches!(e, Event::CustomStatusSet { .. }))
            .count();
        if inner.claimed_status_count < seen {
            inner.claimed_status_count += 1;
            return;
        }
        inner.claimed_status_count += 1;
        inner.history.push(Event::CustomStatusSet { value });
        inner.logging_enabled_this_poll = true;
    }

    /// Typed custom status helper.
    pub fn set_custom_status_typed<T: serde::Serialize>(&self, value: &T) {
        let payload = crate::_typed_codec::Json::encode(value).expect("encode");
        self.set_custom_status(payload);
    }
}

// Unified future/output that allows joining different orchestration primitives

/// Output of a `DurableFuture` when awaited via unified composition.
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};

use crate::futures::Kind;

impl DurableFuture {
    /// Converts this unified future into a future that resolves only for
    /// an activity completion or failure, as a raw String result.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_activity used on non-activity future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an activity result decoded to a typed value.
    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        let fut = self.into_activity();
        async move {
            let s = fut.await?;
            crate::_typed_codec::Json::decode::<Out>(&s)
        }
    }

    /// Converts this unified future into a future that resolves when the
    /// corresponding timer fires.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = ();
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
                    Poll::Ready(other) => panic!("into_timer used on non-timer future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Converts this unified future into a future that resolves with the
    /// payload of the correlated external event, as a raw String.
    pub fn into_event(self) -> impl Future<Output = String> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = String;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::External(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_event used on non-external future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an external event decoded to a typed value.
    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        let s = Self::into_event(self).await;
        crate::_typed_codec::Json::decode::<T>(&s)
    }
}

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        // Try to adopt an existing scheduled activity id that matches and isn't claimed yet
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityScheduled {
                    id,
                    name: n,
                    input: inp,
                } if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Activity {
            id: adopted_id,
            name,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes input and later decodes output via `into_activity_typed`.
    pub fn schedule_activity_typed<In: serde::Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let payload = crate::_typed_codec::Json::encode(input).expect("encode");
        self.schedule_activity(name, payload)
    }

    /// Schedule a timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.inner.lock().unwrap();
        // Adopt first unclaimed TimerCreated id if any, else allocate
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::TimerCreated { id, .. } if !inner.claimed_timer_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_timer_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id: adopted_id,
            delay_ms,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Subscribe to an external event by name and return its `DurableFuture`.
    /// Each wait consumes at most one raised event for that name.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.inner.lock().unwrap();
        // Adopt existing subscription id for this name if present and unclaimed, else allocate
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ExternalSubscribed { id, name: n } if n == &name && !inner.claimed_external_ids.contains(id) => {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_external_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::External {
            id: adopted_id,
            name,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }
}

// Aggregate future machinery lives in crate::futures

use crate::futures::AggregateDurableFuture;
use crate::futures::KindTag;

impl OrchestrationContext {
    /// Deterministic select over two futures: returns (winner_index, DurableOutput).
    /// The winner is the future whose completion appears earliest in history.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(vec![a, b]))
    }
    /// Deterministic select over N futures
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(futures))
    }
    /// Deterministic join over N futures (outputs in history completion order)
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new_join(futures))
    }

    pub(crate) fn find_history_index(hist: &[Event], id: u64, kind: KindTag) -> Option<usize> {
        for (idx, e) in hist.iter().enumerate() {
            match (kind, e) {
                (KindTag::Activity, Event::ActivityCompleted { id: cid, .. }) if *cid == id => return Some(idx),
                (KindTag::Activity, Event::ActivityFailed { id: cid, .. }) if *cid == id => return Some(idx),
                (KindTag::Timer, Event::TimerFired { id: cid, .. }) if *cid == id => return Some(idx),
                (KindTag::External, Event::ExternalEvent { id: cid, .. }) if *cid == id => return Some(idx),
                _ => {}
            }
        }
        None
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once with the provided history, producing
/// updated history, requested `Action`s, buffered logs, and an optional output.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    // Reset logging flag at start of poll; it flips to true when a decision is recorded
    ctx.inner.lock().unwrap().logging_enabled_this_poll = false;
    let mut fut = orchestrator(ctx.clone());
    match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            let logs = ctx.take_log_buffer();
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            (hist_after, actions, logs, Some(out))
        }
        Poll::Pending => {
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            let logs = ctx.take_log_buffer();
            (hist_after, actions, logs, None)
        }
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
/// Paired with a closure that materializes actions into completions, it plays
/// the role of a mocked orchestration host.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
