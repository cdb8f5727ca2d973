//! Materializes replay decisions into provider work items.
use std::sync::Arc;

use super::Runtime;
use crate::Event;
use crate::providers::{QueueKind, WorkItem};
use tracing::{debug, warn};

/// Enqueue an activity invocation unless its completion is already recorded.
pub async fn dispatch_call_activity(rt: &Arc<Runtime>, instance: &str, history: &[Event], id: u64, name: String, input: String) {
    let completed = history.iter().any(|e| {
        matches!(e, Event::ActivityCompleted { id: cid, .. } if *cid == id)
            || matches!(e, Event::ActivityFailed { id: cid, .. } if *cid == id)
    });
    if completed {
        debug!(instance, id, name=%name, "skipping activity dispatch; completion already in history");
        return;
    }
    if let Err(e) = rt
        .history_store
        .enqueue_work(
            QueueKind::Worker,
            WorkItem::ActivityExecute {
                instance: instance.to_string(),
                id,
                name: name.clone(),
                input,
            },
        )
        .await
    {
        warn!(instance, id, name=%name, error=%e, "failed to enqueue activity");
    }
}

/// Enqueue a timer schedule unless the timer already fired.
pub async fn dispatch_create_timer(rt: &Arc<Runtime>, instance: &str, history: &[Event], id: u64, _delay_ms: u64) {
    if history
        .iter()
        .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id))
    {
        return;
    }
    // fire_at_ms was fixed when the TimerCreated event was recorded
    let Some(fire_at_ms) = history.iter().find_map(|e| match e {
        Event::TimerCreated { id: cid, fire_at_ms } if *cid == id => Some(*fire_at_ms),
        _ => None,
    }) else {
        warn!(instance, id, "timer decision without TimerCreated in history");
        return;
    };
    if let Err(e) = rt
        .history_store
        .enqueue_work(
            QueueKind::Timer,
            WorkItem::TimerSchedule {
                instance: instance.to_string(),
                id,
                fire_at_ms,
            },
        )
        .await
    {
        warn!(instance, id, error=%e, "failed to enqueue timer");
    }
}

/// A new external subscription drains at most one buffered payload for its
/// name: events raised before any wait existed are delivered in raise order.
pub async fn dispatch_wait_external(rt: &Arc<Runtime>, instance: &str, history: &[Event], id: u64, name: String) {
    if history
        .iter()
        .any(|e| matches!(e, Event::ExternalEvent { id: cid, .. } if *cid == id))
    {
        return;
    }
    let buffered = {
        let mut buf = rt.buffered_events.lock().await;
        match buf.get_mut(&(instance.to_string(), name.clone())) {
            Some(q) => {
                let v = q.pop_front();
                if q.is_empty() {
                    buf.remove(&(instance.to_string(), name.clone()));
                }
                v
            }
            None => None,
        }
    };
    if let Some(data) = buffered {
        debug!(instance, id, name=%name, "delivering buffered external event to new subscription");
        if let Err(e) = rt
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name,
                    data,
                },
            )
            .await
        {
            warn!(instance, id, error=%e, "failed to enqueue buffered external");
        }
    }
}
