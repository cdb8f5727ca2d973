use super::router::OrchestratorMsg;
use crate::Event;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use std::sync::Arc;
use tracing::warn;

/// Outcome of folding one orchestrator message into in-memory history.
pub enum Applied {
    /// A new completion event was appended; persist before acking.
    Appended,
    /// Message was a duplicate or otherwise a no-op; ack immediately.
    Ignored,
    /// External event with no unmatched subscription yet; the caller should
    /// buffer the payload for a future wait instead of dropping it.
    Unmatched { name: String, data: String },
}

/// Fold a completion message into history, returning the ack token and what
/// happened. Completions correlate by id; externals-by-name correlate to the
/// earliest subscription without a delivered event, which gives raised events
/// FIFO semantics across repeated waits on the same name.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, Applied) {
    match msg {
        OrchestratorMsg::ActivityCompleted {
            id, result, ack_token, ..
        } => {
            if !history
                .iter()
                .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id))
            {
                warn!(id, "dropping activity completion with no matching schedule");
                return (ack_token, Applied::Ignored);
            }
            if activity_done(history, id) {
                return (ack_token, Applied::Ignored);
            }
            history.push(Event::ActivityCompleted { id, result });
            (ack_token, Applied::Appended)
        }
        OrchestratorMsg::ActivityFailed { id, error, ack_token, .. } => {
            if activity_done(history, id) {
                return (ack_token, Applied::Ignored);
            }
            history.push(Event::ActivityFailed { id, error });
            (ack_token, Applied::Appended)
        }
        OrchestratorMsg::TimerFired {
            id, fire_at_ms, ack_token, ..
        } => {
            if history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id))
            {
                return (ack_token, Applied::Ignored);
            }
            history.push(Event::TimerFired { id, fire_at_ms });
            (ack_token, Applied::Appended)
        }
        OrchestratorMsg::ExternalByName {
            name, data, ack_token, ..
        } => match unmatched_subscription(history, &name) {
            Some(id) => {
                history.push(Event::ExternalEvent { id, name, data });
                (ack_token, Applied::Appended)
            }
            None => (ack_token, Applied::Unmatched { name, data }),
        },
        OrchestratorMsg::TerminateRequested { .. } => {
            // Terminations are handled by the run loop, not folded as completions
            unreachable!("TerminateRequested must be handled before append_completion")
        }
    }
}

fn activity_done(history: &[Event], id: u64) -> bool {
    history.iter().any(|e| {
        matches!(e, Event::ActivityCompleted { id: cid, .. } if *cid == id)
            || matches!(e, Event::ActivityFailed { id: cid, .. } if *cid == id)
    })
}

/// Earliest `ExternalSubscribed` for `name` that has no delivered `ExternalEvent`.
pub fn unmatched_subscription(history: &[Event], name: &str) -> Option<u64> {
    history.iter().find_map(|e| match e {
        Event::ExternalSubscribed { id, name: n }
            if n == name
                && !history
                    .iter()
                    .any(|d| matches!(d, Event::ExternalEvent { id: cid, .. } if cid == id)) =>
        {
            Some(*id)
        }
        _ => None,
    })
}

/// Number of `ExternalSubscribed` entries for `name` with no delivered event.
pub fn open_subscription_count(history: &[Event], name: &str) -> usize {
    history
        .iter()
        .filter(|e| match e {
            Event::ExternalSubscribed { id, name: n } if n == name => !history
                .iter()
                .any(|d| matches!(d, Event::ExternalEvent { id: cid, .. } if cid == id)),
            _ => false,
        })
        .count()
}

/// Re-enqueue work for scheduled activities and armed timers that have no
/// completion in history yet. Called when an instance rehydrates so that work
/// lost to a crash (acked schedule, no completion) is re-dispatched; provider
/// append dedup keeps any double-delivery harmless.
pub async fn rehydrate_pending(instance: &str, history: &[Event], store: &Arc<dyn HistoryStore>) {
    for e in history {
        match e {
            Event::ActivityScheduled { id, name, input } => {
                if activity_done(history, *id) {
                    continue;
                }
                let _ = store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        },
                    )
                    .await;
            }
            Event::TimerCreated { id, fire_at_ms } => {
                if history
                    .iter()
                    .any(|d| matches!(d, Event::TimerFired { id: cid, .. } if cid == id))
                {
                    continue;
                }
                let _ = store
                    .enqueue_work(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await;
            }
            _ => {}
        }
    }
}
