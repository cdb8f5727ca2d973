//! Filesystem provider: JSON-lines history files plus durable work queues.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/instances/<instance>.jsonl   one HistoryRecord per line
//! <root>/queues/orchestrator.jsonl    one queue entry per line
//! <root>/queues/worker.jsonl
//! <root>/queues/timer.jsonl
//! ```
//!
//! Peek-lock keeps dequeued entries on disk until acked, so a crashed process
//! redelivers them on restart. Lock tokens live only in process memory.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{HistoryRecord, HistoryStore, QueueKind, WorkItem, filter_new_events};
use crate::Event;

#[derive(Debug, Serialize, Deserialize)]
struct QueueEntry {
    id: u64,
    item: WorkItem,
}

#[derive(Default)]
struct QueueState {
    // Envelope ids currently held under a lock token
    locked: HashSet<u64>,
}

struct Inner {
    orchestrator: QueueState,
    worker: QueueState,
    timer: QueueState,
    next_entry_id: u64,
}

/// Durable `HistoryStore` rooted at a directory.
pub struct FsHistoryStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl FsHistoryStore {
    /// Open (and create if needed) a store rooted at `root`. When `reset` is
    /// true any existing state under the root is removed first.
    pub fn new(root: impl AsRef<Path>, reset: bool) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if reset && root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(root.join("instances"))?;
        fs::create_dir_all(root.join("queues"))?;
        let store = Self {
            root,
            inner: Mutex::new(Inner {
                orchestrator: QueueState::default(),
                worker: QueueState::default(),
                timer: QueueState::default(),
                next_entry_id: 1,
            }),
        };
        store.recover_entry_counter()?;
        Ok(store)
    }

    fn recover_entry_counter(&self) -> std::io::Result<()> {
        let mut max_id = 0u64;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            for entry in self.read_queue(kind) {
                max_id = max_id.max(entry.id);
            }
        }
        self.inner.lock().unwrap().next_entry_id = max_id + 1;
        Ok(())
    }

    fn instance_path(&self, instance: &str) -> PathBuf {
        // Instance ids are caller-supplied; keep file names safe
        let safe: String = instance
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("instances").join(format!("{safe}.jsonl"))
    }

    fn queue_path(&self, kind: QueueKind) -> PathBuf {
        let name = match kind {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
            QueueKind::Timer => "timer",
        };
        self.root.join("queues").join(format!("{name}.jsonl"))
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<QueueEntry> {
        let path = self.queue_path(kind);
        let Ok(text) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<QueueEntry>(l) {
                Ok(e) => Some(e),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping corrupt queue line");
                    None
                }
            })
            .collect()
    }

    fn write_queue(&self, kind: QueueKind, entries: &[QueueEntry]) -> Result<(), String> {
        let mut text = String::new();
        for e in entries {
            text.push_str(&serde_json::to_string(e).map_err(|e| e.to_string())?);
            text.push('\n');
        }
        let path = self.queue_path(kind);
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, text).map_err(|e| e.to_string())?;
        fs::rename(&tmp, &path).map_err(|e| e.to_string())
    }

    fn read_records_sync(&self, instance: &str) -> Vec<HistoryRecord> {
        let path = self.instance_path(instance);
        let Ok(text) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<HistoryRecord>(l) {
                Ok(r) => Some(r),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping corrupt history line");
                    None
                }
            })
            .collect()
    }

    fn locked_for(inner: &mut Inner, kind: QueueKind) -> &mut QueueState {
        match kind {
            QueueKind::Orchestrator => &mut inner.orchestrator,
            QueueKind::Worker => &mut inner.worker,
            QueueKind::Timer => &mut inner.timer,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn parse_token(token: &str) -> Result<u64, String> {
        token.parse::<u64>().map_err(|_| format!("bad lock token {token}"))
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.read_records_sync(instance).into_iter().map(|r| r.event).collect()
    }

    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord> {
        self.read_records_sync(instance)
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        // Serialize appends so sequence assignment stays race-free
        let _guard = self.inner.lock().unwrap();
        let records = self.read_records_sync(instance);
        let existing: Vec<Event> = records.iter().map(|r| r.event.clone()).collect();
        let accepted = filter_new_events(&existing, new_events);
        if accepted.is_empty() {
            return Ok(());
        }
        let mut seq = records.last().map(|r| r.sequence).unwrap_or(0);
        let ts = Self::now_ms();
        let mut text = String::new();
        for event in accepted {
            seq += 1;
            let rec = HistoryRecord {
                instance: instance.to_string(),
                sequence: seq,
                timestamp_ms: ts,
                event,
            };
            text.push_str(&serde_json::to_string(&rec).map_err(|e| e.to_string())?);
            text.push('\n');
        }
        use std::io::Write as _;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.instance_path(instance))
            .map_err(|e| e.to_string())?;
        f.write_all(text.as_bytes()).map_err(|e| e.to_string())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(self.root.join("instances")) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let path = self.instance_path(instance);
        if path.exists() {
            fs::remove_file(path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_entry_id;
            inner.next_entry_id += 1;
            id
        };
        let line = serde_json::to_string(&QueueEntry { id, item }).map_err(|e| e.to_string())?;
        use std::io::Write as _;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.queue_path(kind))
            .map_err(|e| e.to_string())?;
        f.write_all(format!("{line}\n").as_bytes()).map_err(|e| e.to_string())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let entries = self.read_queue(kind);
        let mut inner = self.inner.lock().unwrap();
        let state = Self::locked_for(&mut inner, kind);
        for entry in entries {
            if state.locked.contains(&entry.id) {
                continue;
            }
            state.locked.insert(entry.id);
            return Some((entry.item, entry.id.to_string()));
        }
        None
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let id = Self::parse_token(token)?;
        let mut inner = self.inner.lock().unwrap();
        if !Self::locked_for(&mut inner, kind).locked.remove(&id) {
            return Err(format!("unknown lock token {token}"));
        }
        let remaining: Vec<QueueEntry> = self.read_queue(kind).into_iter().filter(|e| e.id != id).collect();
        self.write_queue(kind, &remaining)
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let id = Self::parse_token(token)?;
        let mut inner = self.inner.lock().unwrap();
        if !Self::locked_for(&mut inner, kind).locked.remove(&id) {
            return Err(format!("unknown lock token {token}"));
        }
        // Entry was never removed from disk; clearing the lock makes it visible again
        Ok(())
    }
}
