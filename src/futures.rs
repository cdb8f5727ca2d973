//! Unified durable futures used by orchestrations.
//!
//! A `DurableFuture` wraps one orchestration primitive (activity, timer,
//! external-event wait) behind a single poll implementation so primitives of
//! different kinds can be composed with `select`/`join`. Completion is driven
//! purely by history: a future resolves only when its correlated completion
//! event is present, which keeps replay deterministic.
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Output of a resolved `DurableFuture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    /// Activity completion or failure carrying the raw string payload.
    Activity(Result<String, String>),
    /// Timer fired.
    Timer,
    /// External event payload.
    External(String),
}

/// Internal discriminant used to search history for a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindTag {
    Activity,
    Timer,
    External,
}

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        delay_ms: u64,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
}

impl Kind {
    fn id(&self) -> u64 {
        match self {
            Kind::Activity { id, .. } | Kind::Timer { id, .. } | Kind::External { id, .. } => *id,
        }
    }
    fn tag(&self) -> KindTag {
        match self {
            Kind::Activity { .. } => KindTag::Activity,
            Kind::Timer { .. } => KindTag::Timer,
            Kind::External { .. } => KindTag::External,
        }
    }
    fn ctx(&self) -> &OrchestrationContext {
        match self {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::External { ctx, .. } => ctx,
        }
    }

    /// Ensure the scheduling event for this primitive exists in history and
    /// its corresponding `Action` has been recorded exactly once per replay.
    fn ensure_scheduled(&self) {
        match self {
            Kind::Activity {
                id,
                name,
                input,
                scheduled,
                ctx,
            } => {
                if scheduled.get() {
                    return;
                }
                let mut inner = ctx.inner.lock().unwrap();
                let in_history = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ActivityScheduled { id: hid, .. } if hid == id));
                if !in_history {
                    inner.history.push(Event::ActivityScheduled {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                scheduled.set(true);
            }
            Kind::Timer {
                id,
                delay_ms,
                scheduled,
                ctx,
            } => {
                if scheduled.get() {
                    return;
                }
                let mut inner = ctx.inner.lock().unwrap();
                let in_history = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerCreated { id: hid, .. } if hid == id));
                if !in_history {
                    let fire_at_ms = inner.now_ms().saturating_add(*delay_ms);
                    inner.history.push(Event::TimerCreated {
                        id: *id,
                        fire_at_ms,
                    });
                    inner.record_action(Action::CreateTimer {
                        id: *id,
                        delay_ms: *delay_ms,
                    });
                }
                scheduled.set(true);
            }
            Kind::External {
                id,
                name,
                scheduled,
                ctx,
            } => {
                if scheduled.get() {
                    return;
                }
                let mut inner = ctx.inner.lock().unwrap();
                let in_history = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ExternalSubscribed { id: hid, .. } if hid == id));
                if !in_history {
                    inner.history.push(Event::ExternalSubscribed {
                        id: *id,
                        name: name.clone(),
                    });
                    inner.record_action(Action::WaitExternal {
                        id: *id,
                        name: name.clone(),
                    });
                }
                scheduled.set(true);
            }
        }
    }

    /// Look up this primitive's completion in history, returning its index
    /// and decoded output when present.
    fn find_completion(&self) -> Option<(usize, DurableOutput)> {
        let ctx = self.ctx();
        let inner = ctx.inner.lock().unwrap();
        let idx = OrchestrationContext::find_history_index(&inner.history, self.id(), self.tag())?;
        let out = match &inner.history[idx] {
            Event::ActivityCompleted { result, .. } => DurableOutput::Activity(Ok(result.clone())),
            Event::ActivityFailed { error, .. } => DurableOutput::Activity(Err(error.clone())),
            Event::TimerFired { .. } => DurableOutput::Timer,
            Event::ExternalEvent { data, .. } => DurableOutput::External(data.clone()),
            _ => return None,
        };
        Some((idx, out))
    }
}

/// Unified orchestration future. Obtain instances via
/// `OrchestrationContext::schedule_activity`, `schedule_timer`, or
/// `schedule_wait`, then either await directly (yielding `DurableOutput`),
/// convert with `into_activity`/`into_timer`/`into_event`, or compose with
/// `select`/`join`.
pub struct DurableFuture(pub(crate) Kind);

impl Future for DurableFuture {
    type Output = DurableOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.0.ensure_scheduled();
        match this.0.find_completion() {
            Some((_, out)) => Poll::Ready(out),
            None => Poll::Pending,
        }
    }
}

enum AggregateMode {
    Select,
    Join,
}

/// Composes a set of `DurableFuture`s under deterministic history-ordered
/// semantics: for select the winner is the child whose completion appears
/// earliest in history; for join the outputs carry history completion order.
pub(crate) struct AggregateDurableFuture {
    mode: AggregateMode,
    children: Vec<DurableFuture>,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(children: Vec<DurableFuture>) -> Self {
        Self {
            mode: AggregateMode::Select,
            children,
        }
    }
    pub(crate) fn new_join(children: Vec<DurableFuture>) -> Self {
        Self {
            mode: AggregateMode::Join,
            children,
        }
    }

    /// Poll every child once so all scheduling events land in program order,
    /// then gather completions with their history indices.
    fn gather(&mut self, cx: &mut Context<'_>) -> Vec<Option<(usize, DurableOutput)>> {
        let mut resolved = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            // Safe: children are never moved out while the aggregate is alive.
            let pinned = unsafe { Pin::new_unchecked(&mut *child) };
            let _ = pinned.poll(cx);
            resolved.push(child.0.find_completion());
        }
        resolved
    }
}

/// Future returned by `OrchestrationContext::select`/`select2`.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let agg = unsafe { &mut self.get_unchecked_mut().0 };
        debug_assert!(matches!(agg.mode, AggregateMode::Select));
        let resolved = agg.gather(cx);
        let winner = resolved
            .iter()
            .enumerate()
            .filter_map(|(child_idx, r)| r.as_ref().map(|(hist_idx, out)| (*hist_idx, child_idx, out.clone())))
            .min_by_key(|(hist_idx, _, _)| *hist_idx);
        match winner {
            Some((_, child_idx, out)) => Poll::Ready((child_idx, out)),
            None => Poll::Pending,
        }
    }
}

/// Future returned by `OrchestrationContext::join`.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let agg = unsafe { &mut self.get_unchecked_mut().0 };
        debug_assert!(matches!(agg.mode, AggregateMode::Join));
        let resolved = agg.gather(cx);
        if resolved.iter().any(|r| r.is_none()) {
            return Poll::Pending;
        }
        let mut pairs: Vec<(usize, DurableOutput)> = resolved.into_iter().flatten().collect();
        pairs.sort_by_key(|(hist_idx, _)| *hist_idx);
        Poll::Ready(pairs.into_iter().map(|(_, out)| out).collect())
    }
}
