//! In-memory provider, used by tests and samples.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::{HistoryRecord, HistoryStore, QueueKind, WorkItem, filter_new_events};
use crate::Event;

#[derive(Default)]
struct Queue {
    ready: VecDeque<WorkItem>,
    // token -> item while invisible under peek-lock
    locked: HashMap<String, WorkItem>,
}

/// Volatile `HistoryStore` holding everything in process memory.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    orchestrator: Mutex<Queue>,
    worker: Mutex<Queue>,
    timer: Mutex<Queue>,
    token_counter: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator,
            QueueKind::Worker => &self.worker,
            QueueKind::Timer => &self.timer,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories
            .lock()
            .unwrap()
            .get(instance)
            .map(|recs| recs.iter().map(|r| r.event.clone()).collect())
            .unwrap_or_default()
    }

    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord> {
        self.histories
            .lock()
            .unwrap()
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut map = self.histories.lock().unwrap();
        let records = map.entry(instance.to_string()).or_default();
        let existing: Vec<Event> = records.iter().map(|r| r.event.clone()).collect();
        let accepted = filter_new_events(&existing, new_events);
        let mut seq = records.last().map(|r| r.sequence).unwrap_or(0);
        let ts = Self::now_ms();
        for event in accepted {
            seq += 1;
            records.push(HistoryRecord {
                instance: instance.to_string(),
                sequence: seq,
                timestamp_ms: ts,
                event,
            });
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.histories.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        self.histories.lock().unwrap().remove(instance);
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        self.queue(kind).lock().unwrap().ready.push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut q = self.queue(kind).lock().unwrap();
        let item = q.ready.pop_front()?;
        let token = format!("tok-{}", self.token_counter.fetch_add(1, Ordering::Relaxed));
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().unwrap();
        q.locked
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| format!("unknown lock token {token}"))
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().unwrap();
        let item = q
            .locked
            .remove(token)
            .ok_or_else(|| format!("unknown lock token {token}"))?;
        q.ready.push_front(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_monotonic_from_one() {
        let store = InMemoryHistoryStore::new();
        store
            .append(
                "i1",
                vec![
                    Event::OrchestrationStarted {
                        name: "o".into(),
                        input: "".into(),
                    },
                    Event::ActivityScheduled {
                        id: 1,
                        name: "a".into(),
                        input: "".into(),
                    },
                ],
            )
            .await
            .unwrap();
        store
            .append(
                "i1",
                vec![Event::ActivityCompleted {
                    id: 1,
                    result: "ok".into(),
                }],
            )
            .await
            .unwrap();
        let recs = store.read_records("i1").await;
        let seqs: Vec<u64> = recs.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn peek_lock_hides_until_abandon() {
        let store = InMemoryHistoryStore::new();
        let item = WorkItem::ExternalRaised {
            instance: "i1".into(),
            name: "Approval".into(),
            data: "true".into(),
        };
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();

        let (got, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(got, item);
        // Invisible while locked
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

        store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
        let (again, token2) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, item);
        store.ack(QueueKind::Orchestrator, &token2).await.unwrap();
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    }
}
