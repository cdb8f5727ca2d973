use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Messages delivered back to the orchestrator loop by dispatchers.
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    /// External event matched by subscription name; correlation happens at
    /// append time against the earliest unmatched subscription.
    ExternalByName {
        instance: String,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
    TerminateRequested {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalByName { instance, .. }
            | OrchestratorMsg::TerminateRequested { instance, .. } => instance,
        }
    }
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
        OrchestratorMsg::TimerFired { .. } => "TimerFired",
        OrchestratorMsg::ExternalByName { .. } => "ExternalByName",
        OrchestratorMsg::TerminateRequested { .. } => "TerminateRequested",
    }
}

/// Routes orchestrator messages to per-instance inboxes. An instance registers
/// an inbox while its run loop is hydrated and unregisters on dehydration.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn forward(&self, msg: OrchestratorMsg) {
        let key = msg.instance().to_string();
        let kind = kind_of(&msg);
        if let Some(tx) = self.inboxes.lock().await.get(&key) {
            if tx.send(msg).is_err() {
                warn!(instance=%key, kind=%kind, "router: receiver dropped, dropping message");
            }
        } else {
            warn!(instance=%key, kind=%kind, "router: unknown instance, dropping message");
        }
    }

    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), ()> {
        let key = msg.instance().to_string();
        let kind = kind_of(&msg);
        let mut map = self.inboxes.lock().await;
        if let Some(tx) = map.get(&key) {
            if tx.send(msg).is_err() {
                // Receiver dropped; remove stale sender so dispatchers can rehydrate on redelivery
                map.remove(&key);
                warn!(instance=%key, kind=%kind, "router: receiver dropped, removing inbox");
                return Err(());
            }
            Ok(())
        } else {
            Err(())
        }
    }
}
