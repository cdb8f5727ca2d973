//! Pluggable persistence for orchestration history and work queues.
//!
//! A provider owns two concerns:
//! - the append-only per-instance history log, and
//! - the peek-lock work queues the runtime's dispatchers poll.
//!
//! Appends are idempotent: a completion that is already present in history
//! (same correlation id and kind) is silently skipped, and nothing is ever
//! appended after a terminal event.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// One persisted history entry. Providers assign `sequence` (monotonically
/// increasing per instance, starting at 1) and `timestamp_ms` at append time;
/// replay consumes only the `event` projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub instance: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub event: Event,
}

/// Which work queue a dispatcher is draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Instance-lifecycle and completion messages consumed by the orchestration dispatcher.
    Orchestrator,
    /// Activity invocations consumed by the activity dispatcher.
    Worker,
    /// Pending timers consumed by the timer dispatcher.
    Timer,
}

/// Durable unit of work flowing through the provider queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// Create and run a new orchestration instance.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    /// Invoke an activity; enqueued to the worker queue by the orchestration dispatcher.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    /// Activity result routed back to the instance.
    ActivityCompleted { instance: String, id: u64, result: String },
    /// Activity failure (retries exhausted) routed back to the instance.
    ActivityFailed { instance: String, id: u64, error: String },
    /// Arm a durable timer; enqueued to the timer queue.
    TimerSchedule { instance: String, id: u64, fire_at_ms: u64 },
    /// Timer elapsed; routed back to the instance.
    TimerFired { instance: String, id: u64, fire_at_ms: u64 },
    /// External event raised against an instance by name.
    ExternalRaised { instance: String, name: String, data: String },
    /// Operator request to forcibly end an instance.
    TerminateInstance { instance: String, reason: String },
}

impl WorkItem {
    /// Instance this work item targets.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }
}

/// Storage abstraction for history and work queues.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the event projection for an instance (empty if unknown).
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Read the full persisted records, including sequence numbers and
    /// timestamps, mainly for inspection and tests.
    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord>;

    /// Append new events for an instance. Duplicate completions are skipped
    /// and post-terminal appends are dropped (see `filter_new_events`).
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;

    /// List known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Remove all state for an instance.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    /// Enqueue a work item to the given queue.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Dequeue under peek-lock: the item becomes invisible until `ack` or
    /// `abandon` is called with the returned lock token.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Acknowledge (delete) a locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Return a locked item to the queue for redelivery.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Dump history as a human-readable list, for debugging.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("== {inst} ==\n"));
            for rec in self.read_records(&inst).await {
                out.push_str(&format!("  [{}] {:?}\n", rec.sequence, rec.event));
            }
        }
        out
    }
}

/// Shared append gate used by providers: enforces terminal-history immutability
/// and drops events that are already present.
///
/// Rules:
/// - If existing history already contains a terminal event, all new events are
///   dropped (late completions after completion/termination are ignored).
/// - A completion (`ActivityCompleted`/`ActivityFailed`/`TimerFired`/
///   `ExternalEvent`) whose correlation id already has a completion of the
///   same class is a duplicate and is skipped.
/// - A second terminal event within one batch is skipped.
pub(crate) fn filter_new_events(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    use std::collections::HashSet;

    if existing.iter().any(|e| e.is_terminal()) {
        return Vec::new();
    }

    // (correlation id, completion class) pairs already recorded
    let mut seen: HashSet<(u64, &'static str)> = HashSet::new();
    let mut terminal_seen = false;
    for e in existing {
        match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => {
                seen.insert((*id, "activity"));
            }
            Event::TimerFired { id, .. } => {
                seen.insert((*id, "timer"));
            }
            Event::ExternalEvent { id, .. } => {
                seen.insert((*id, "external"));
            }
            _ => {}
        }
    }

    let mut accepted = Vec::new();
    for e in new_events {
        if terminal_seen {
            break;
        }
        let key = match &e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((*id, "activity")),
            Event::TimerFired { id, .. } => Some((*id, "timer")),
            Event::ExternalEvent { id, .. } => Some((*id, "external")),
            _ => None,
        };
        if let Some(k) = key {
            if !seen.insert(k) {
                continue;
            }
        }
        if e.is_terminal() {
            terminal_seen = true;
        }
        accepted.push(e);
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_completion_is_skipped() {
        let existing = vec![
            Event::OrchestrationStarted {
                name: "o".into(),
                input: "".into(),
            },
            Event::ActivityScheduled {
                id: 1,
                name: "a".into(),
                input: "".into(),
            },
            Event::ActivityCompleted {
                id: 1,
                result: "x".into(),
            },
        ];
        let accepted = filter_new_events(
            &existing,
            vec![Event::ActivityCompleted {
                id: 1,
                result: "x".into(),
            }],
        );
        assert!(accepted.is_empty());
    }

    #[test]
    fn failure_after_completion_same_id_is_skipped() {
        let existing = vec![Event::ActivityCompleted {
            id: 7,
            result: "ok".into(),
        }];
        let accepted = filter_new_events(
            &existing,
            vec![Event::ActivityFailed {
                id: 7,
                error: "late".into(),
            }],
        );
        assert!(accepted.is_empty());
    }

    #[test]
    fn post_terminal_appends_are_dropped() {
        let existing = vec![Event::OrchestrationTerminated {
            reason: "operator".into(),
        }];
        let accepted = filter_new_events(
            &existing,
            vec![Event::ActivityCompleted {
                id: 1,
                result: "late".into(),
            }],
        );
        assert!(accepted.is_empty());
    }

    #[test]
    fn fresh_events_pass_through_in_order() {
        let accepted = filter_new_events(
            &[],
            vec![
                Event::OrchestrationStarted {
                    name: "o".into(),
                    input: "i".into(),
                },
                Event::ActivityScheduled {
                    id: 1,
                    name: "a".into(),
                    input: "".into(),
                },
            ],
        );
        assert_eq!(accepted.len(), 2);
    }
}
