use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Action, Event, LogLevel};

/// Decisions are the same as public Actions; we emit them directly from the replay core.
pub type Decision = Action;

pub trait ReplayEngine: Send + Sync {
    /// Replays one turn and returns updated history, pure decisions, logs,
    /// and an optional output.
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> (
        Vec<Event>,
        Vec<Decision>,
        Vec<(LogLevel, String)>,
        Option<Result<String, String>>,
    );
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> (
        Vec<Event>,
        Vec<Decision>,
        Vec<(LogLevel, String)>,
        Option<Result<String, String>>,
    ) {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_with(history, turn_index, orchestrator)
    }
}

/// Record the kind and correlation id of completions appended at or after
/// `from_index` so the run loop can validate them after the next replay.
pub fn collect_appended_completions(history: &[Event], from_index: usize, out: &mut Vec<(&'static str, u64)>) {
    for e in history.iter().skip(from_index) {
        match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => out.push(("activity", *id)),
            Event::TimerFired { id, .. } => out.push(("timer", *id)),
            Event::ExternalEvent { id, .. } => out.push(("external", *id)),
            _ => {}
        }
    }
}

/// Detect a completion whose correlation id points at a scheduling event of a
/// different kind (or none at all) in the prior history. This is the footprint
/// of orchestrator code that changed between executions: the replayed code
/// allocated the id to a different primitive than the recorded one.
pub fn detect_completion_kind_mismatch(prior: &[Event], appended: &[(&'static str, u64)]) -> Option<String> {
    for (kind, id) in appended {
        let scheduled_kind = prior.iter().find_map(|e| match e {
            Event::ActivityScheduled { id: sid, .. } if sid == id => Some("activity"),
            Event::TimerCreated { id: sid, .. } if sid == id => Some("timer"),
            Event::ExternalSubscribed { id: sid, .. } if sid == id => Some("external"),
            _ => None,
        });
        match scheduled_kind {
            Some(sk) if sk == *kind => {}
            Some(sk) => {
                return Some(format!(
                    "nondeterministic: completion kind {kind} for id {id} does not match scheduled kind {sk}"
                ));
            }
            None => {
                return Some(format!(
                    "nondeterministic: completion kind {kind} for id {id} has no scheduling event"
                ));
            }
        }
    }
    None
}
