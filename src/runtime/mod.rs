use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Event, LogLevel, OrchestrationContext};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;

use async_trait::async_trait;

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, RetryPolicy,
};
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::OrchestrationStatusDetail;

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<(Vec<Event>, Result<String, String>)>>>>,
    orchestration_registry: OrchestrationRegistry,
    /// External events raised before any matching subscription existed, keyed
    /// by (instance, event name), delivered FIFO to future waits.
    pub(crate) buffered_events: Mutex<HashMap<(String, String), VecDeque<String>>>,
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Internal: apply pure decisions by dispatching provider work items.
    async fn apply_decisions(
        self: &Arc<Self>,
        instance: &str,
        history: &[Event],
        decisions: Vec<crate::runtime::replay::Decision>,
    ) {
        debug!("apply_decisions: {instance} {decisions:#?}");
        for d in decisions {
            match d {
                crate::runtime::replay::Decision::CallActivity { id, name, input } => {
                    dispatch::dispatch_call_activity(self, instance, history, id, name, input).await;
                }
                crate::runtime::replay::Decision::CreateTimer { id, delay_ms } => {
                    dispatch::dispatch_create_timer(self, instance, history, id, delay_ms).await;
                }
                crate::runtime::replay::Decision::WaitExternal { id, name } => {
                    dispatch::dispatch_wait_external(self, instance, history, id, name).await;
                }
            }
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let inner = self.clone().spawn_instance_to_completion(instance);
        // Wrap to normalize handle type to JoinHandle<()>
        let wrapper = tokio::spawn(async move {
            let _ = inner.await;
        });
        self.instance_joins.lock().await.push(wrapper);
        true
    }

    async fn start_internal_rx(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<oneshot::Receiver<(Vec<Event>, Result<String, String>)>, String> {
        // Append start marker if the instance has no history yet
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() {
            let started = vec![Event::OrchestrationStarted {
                name: orchestration_name.to_string(),
                input,
            }];
            self.history_store
                .append(instance, started)
                .await
                .map_err(|e| format!("failed to append OrchestrationStarted: {e}"))?;
        } else {
            // At-least-once start semantics: duplicate starts are accepted and deduped
            warn!(instance, "instance already has history; duplicate start accepted (deduped)");
        }
        self.ensure_instance_active(instance).await;
        // Register a oneshot waiter for string result
        let (tx, rx) = oneshot::channel::<(Vec<Event>, Result<String, String>)>();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Common handler for orchestrator-queue items that target a specific instance.
    /// Ensures the instance is active (rehydrates) or forwards the message to
    /// the in-proc router with the provided ack token.
    async fn orchestrator_deliver_or_rehydrate<F>(self: &Arc<Self>, instance: &str, token: String, build_msg: F)
    where
        F: FnOnce(String) -> OrchestratorMsg,
    {
        // Ensure instance is active; if dehydrated, rehydrate and abandon for redelivery
        if !self.router.inboxes.lock().await.contains_key(instance) {
            let hist = self.history_store.read(instance).await;
            if hist.is_empty() {
                error!(instance, "completion targets unknown instance; dropping");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            if hist.iter().any(|e| e.is_terminal()) {
                // Late completion after completion or termination: ignore
                debug!(instance, "dropping completion for terminal instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            self.ensure_instance_active(instance).await;
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }

        // Active: forward with ack token
        let msg = build_msg(token);
        let _ = self.router_tx.send(msg);
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let rx = self.clone().start_internal_rx(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = rx.await.expect("result");
            let res_t: Result<Out, String> = match res_s {
                Ok(s) => Json::decode::<Out>(&s),
                Err(e) => Err(e),
            };
            (hist, res_t)
        }))
    }

    /// Start an orchestration using raw String input/output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, String> {
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, input.into())
            .await?;
        Ok(tokio::spawn(async move { rx.await.expect("result") }))
    }

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (router_tx, mut router_rx) = mpsc::unbounded_channel::<OrchestratorMsg>();
        let router = Arc::new(InstanceRouter {
            inboxes: Mutex::new(HashMap::new()),
        });
        let mut joins: Vec<JoinHandle<()>> = Vec::new();

        // spawn router forwarding task
        let router_clone = router.clone();
        joins.push(tokio::spawn(async move {
            while let Some(msg) = router_rx.recv().await {
                router_clone.forward(msg).await;
            }
        }));

        let runtime = Arc::new(Self {
            router_tx,
            router,
            joins: Mutex::new(joins),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            buffered_events: Mutex::new(HashMap::new()),
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        runtime
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    match item {
                        WorkItem::StartOrchestration {
                            instance,
                            orchestration,
                            input,
                        } => {
                            debug!("StartOrchestration: {instance} {orchestration}");
                            let _ = self.clone().start_orchestration(&instance, &orchestration, input).await;
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                        WorkItem::ActivityCompleted { instance, id, result } => {
                            debug!("ActivityCompleted: {instance} {id}");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::ActivityCompleted {
                                    instance: instance_c,
                                    id,
                                    result,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        WorkItem::ActivityFailed { instance, id, error } => {
                            debug!("ActivityFailed: {instance} {id} {error}");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::ActivityFailed {
                                    instance: instance_c,
                                    id,
                                    error,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        WorkItem::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                        } => {
                            debug!("TimerFired: {instance} {id} {fire_at_ms}");
                            self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                let instance_c = instance.clone();
                                move |t| OrchestratorMsg::TimerFired {
                                    instance: instance_c,
                                    id,
                                    fire_at_ms,
                                    ack_token: Some(t),
                                }
                            })
                            .await;
                        }
                        WorkItem::ExternalRaised { instance, name, data } => {
                            debug!("ExternalRaised: {instance} {name}");
                            let hist = self.history_store.read(&instance).await;
                            if hist.iter().any(|e| e.is_terminal()) {
                                warn!(instance, name=%name, "dropping external event for terminal instance");
                                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                            } else if completions::unmatched_subscription(&hist, &name).is_some() {
                                self.orchestrator_deliver_or_rehydrate(&instance, token, {
                                    let instance_c = instance.clone();
                                    move |t| OrchestratorMsg::ExternalByName {
                                        instance: instance_c,
                                        name,
                                        data,
                                        ack_token: Some(t),
                                    }
                                })
                                .await;
                            } else {
                                // No open subscription yet: buffer for a future wait
                                self.buffer_external(&instance, name, data).await;
                                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                                // The subscription may have landed between the
                                // history read and the buffer insert
                                self.redeliver_buffered(&instance).await;
                            }
                        }
                        WorkItem::TerminateInstance { instance, reason } => {
                            debug!("TerminateInstance: {instance} {reason}");
                            let hist = self.history_store.read(&instance).await;
                            if hist.is_empty() || hist.iter().any(|e| e.is_terminal()) {
                                // Unknown or already-terminal instance: nothing to do
                                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                            } else if self
                                .router
                                .try_send(OrchestratorMsg::TerminateRequested {
                                    instance: instance.clone(),
                                    reason: reason.clone(),
                                    ack_token: Some(token.clone()),
                                })
                                .await
                                .is_err()
                            {
                                self.ensure_instance_active(&instance).await;
                                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                                tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
                            }
                        }
                        other => {
                            error!(
                                ?other,
                                "unexpected WorkItem in Orchestrator dispatcher; state corruption"
                            );
                            panic!("unexpected WorkItem in Orchestrator dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                        } => {
                            let outcome = match activities.get(&name) {
                                Some((handler, retry)) => {
                                    Self::invoke_with_retry(&*handler, &retry, &instance, id, &name, &input).await
                                }
                                None => Err(format!("unregistered:{name}")),
                            };
                            let completion = match outcome {
                                Ok(result) => WorkItem::ActivityCompleted {
                                    instance: instance.clone(),
                                    id,
                                    result,
                                },
                                Err(error) => WorkItem::ActivityFailed {
                                    instance: instance.clone(),
                                    id,
                                    error,
                                },
                            };
                            let _ = self.history_store.enqueue_work(QueueKind::Orchestrator, completion).await;
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Worker dispatcher; state corruption");
                            panic!("unexpected WorkItem in Worker dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    /// Run an activity handler under its retry policy; returns the first
    /// success, or the last error once attempts are exhausted.
    async fn invoke_with_retry(
        handler: &dyn registry::ActivityHandler,
        retry: &RetryPolicy,
        instance: &str,
        id: u64,
        name: &str,
        input: &str,
    ) -> Result<String, String> {
        let mut last_err = String::new();
        for attempt in 1..=retry.max_attempts {
            let delay = retry.delay_before_attempt_ms(attempt);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            match handler.invoke(input.to_string()).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(instance, id, name, attempt, "activity succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if attempt < retry.max_attempts {
                        warn!(instance, id, name, attempt, error=%e, "activity attempt failed; retrying");
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await {
                    match item {
                        WorkItem::TimerSchedule {
                            instance,
                            id,
                            fire_at_ms,
                        } => {
                            // Arm an in-process sleep; an unfired timer is re-armed
                            // from history when the instance rehydrates
                            let store = self.history_store.clone();
                            tokio::spawn(async move {
                                let now = std::time::SystemTime::now()
                                    .duration_since(std::time::UNIX_EPOCH)
                                    .map(|d| d.as_millis() as u64)
                                    .unwrap_or(0);
                                let delay = fire_at_ms.saturating_sub(now);
                                if delay > 0 {
                                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                                }
                                let _ = store
                                    .enqueue_work(
                                        QueueKind::Orchestrator,
                                        WorkItem::TimerFired {
                                            instance,
                                            id,
                                            fire_at_ms,
                                        },
                                    )
                                    .await;
                            });
                            let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Timer dispatcher; state corruption");
                            panic!("unexpected WorkItem in Timer dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    /// Handle to the underlying history store, mainly for inspection in tests.
    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    /// Abort background tasks. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Await completion of all outstanding spawned orchestration instances.
    pub async fn drain_instances(self: Arc<Self>) {
        let mut joins = self.instance_joins.lock().await;
        while let Some(j) = joins.pop() {
            let _ = j.await;
        }
    }

    pub(crate) async fn buffer_external(&self, instance: &str, name: String, data: String) {
        info!(instance, name=%name, "buffering external event until a subscription opens");
        self.buffered_events
            .lock()
            .await
            .entry((instance.to_string(), name))
            .or_default()
            .push_back(data);
    }

    /// Re-check the buffer against freshly read history and move payloads back
    /// onto the orchestrator queue for every subscription that opened after its
    /// event was buffered. A raise can race the subscription append: the
    /// dispatcher's deliver-or-buffer check may act on a snapshot that predates
    /// `ExternalSubscribed`, landing the payload in the buffer just after the
    /// new wait drained it. Requeued items flow through the dispatcher again,
    /// which re-runs this check, so a payload cannot strand.
    async fn redeliver_buffered(&self, instance: &str) {
        let hist = self.history_store.read(instance).await;
        if hist.iter().any(|e| e.is_terminal()) {
            return;
        }
        let names: Vec<String> = {
            let buf = self.buffered_events.lock().await;
            buf.keys()
                .filter(|(inst, _)| inst == instance)
                .map(|(_, n)| n.clone())
                .collect()
        };
        for name in names {
            let open = completions::open_subscription_count(&hist, &name);
            for _ in 0..open {
                let key = (instance.to_string(), name.clone());
                let popped = {
                    let mut buf = self.buffered_events.lock().await;
                    match buf.get_mut(&key) {
                        Some(q) => {
                            let v = q.pop_front();
                            if q.is_empty() {
                                buf.remove(&key);
                            }
                            v
                        }
                        None => None,
                    }
                };
                let Some(data) = popped else { break };
                debug!(instance, name=%name, "requeueing buffered external for an open subscription");
                let _ = self
                    .history_store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::ExternalRaised {
                            instance: instance.to_string(),
                            name: name.clone(),
                            data,
                        },
                    )
                    .await;
            }
        }
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    async fn fail_instance(
        self: &Arc<Self>,
        instance: &str,
        history: &mut Vec<Event>,
        error: String,
    ) -> (Vec<Event>, Result<String, String>) {
        let _ = self
            .history_store
            .append(instance, vec![Event::OrchestrationFailed { error: error.clone() }])
            .await;
        history.push(Event::OrchestrationFailed { error: error.clone() });
        self.notify_waiters(instance, history, &Err(error.clone())).await;
        self.router.unregister(instance).await;
        (history.clone(), Err(error))
    }

    fn flush_turn_logs(instance: &str, logs: &[(LogLevel, String)], logged_count: &mut usize) {
        // Each replay re-runs the orchestrator from the start, so this turn's
        // buffer is a prefix-extension of the last one; emit only the tail.
        for (level, msg) in logs.iter().skip(*logged_count) {
            match level {
                LogLevel::Debug => debug!(instance, "{msg}"),
                LogLevel::Info => info!(instance, "{msg}"),
                LogLevel::Warn => warn!(instance, "{msg}"),
                LogLevel::Error => error!(instance, "{msg}"),
            }
        }
        *logged_count = (*logged_count).max(logs.len());
    }

    /// Run a single instance to completion, returning its final history and output.
    pub async fn run_instance_to_completion(self: Arc<Self>, instance: &str) -> (Vec<Event>, Result<String, String>) {
        // Ensure instance not already active in this runtime
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Ensure removal of active flag even if the task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                // Drop can't be async; do the removal on a task
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut history: Vec<Event> = self.history_store.read(instance).await;

        // Already terminal (rehydrated after completion): just settle waiters
        if let Some(result) = terminal_result(&history) {
            self.notify_waiters(instance, &history, &result).await;
            return (history, result);
        }

        let mut comp_rx = self.router.register(instance).await;

        // Re-dispatch work that was in flight when the instance last dehydrated
        completions::rehydrate_pending(instance, &history, &self.history_store).await;
        self.redeliver_buffered(instance).await;

        // Capture orchestration name and input from the start event
        let Some((orchestration_name, current_input)) = history.iter().find_map(|e| match e {
            Event::OrchestrationStarted { name, input } => Some((name.clone(), input.clone())),
            _ => None,
        }) else {
            error!(instance, "no OrchestrationStarted in history; state corruption");
            return self.fail_instance(instance, &mut history, "missing start event".into()).await;
        };

        let Some(orchestration_handler) = self.orchestration_registry.get(&orchestration_name) else {
            let err = format!("unregistered:{orchestration_name}");
            return self.fail_instance(instance, &mut history, err).await;
        };

        let mut turn_index: u64 = 0;
        let mut logged_count: usize = 0;
        // Completions appended in the previous batch, validated after replay
        let mut last_appended_completions: Vec<(&'static str, u64)> = Vec::new();
        loop {
            let baseline_len = history.len();
            use crate::runtime::replay::ReplayEngine as _;
            let engine = crate::runtime::replay::DefaultReplayEngine::new();
            let (hist_after, decisions, logs, out_opt) = engine.replay(
                history,
                turn_index,
                orchestration_handler.clone(),
                current_input.clone(),
            );
            history = hist_after;
            Self::flush_turn_logs(instance, &logs, &mut logged_count);

            if !last_appended_completions.is_empty() {
                if let Some(err) =
                    replay::detect_completion_kind_mismatch(&history[..baseline_len], &last_appended_completions)
                {
                    return self.fail_instance(instance, &mut history, err).await;
                }
                last_appended_completions.clear();
            }

            if let Some(out) = out_opt {
                // Persist any deltas produced during this final turn
                if history.len() > baseline_len {
                    let deltas = history[baseline_len..].to_vec();
                    if let Err(e) = self.history_store.append(instance, deltas).await {
                        error!(instance, turn_index, error=%e, "failed to append final turn events");
                        self.notify_waiters(instance, &history, &Err(format!("history append failed: {e}")))
                            .await;
                        panic!("history append failed: {e}");
                    }
                }
                let term = match &out {
                    Ok(s) => Event::OrchestrationCompleted { output: s.clone() },
                    Err(e) => Event::OrchestrationFailed { error: e.clone() },
                };
                if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
                    error!(instance, turn_index, error=%e, "failed to append terminal event");
                    self.notify_waiters(instance, &history, &Err(format!("history append failed: {e}")))
                        .await;
                    panic!("history append failed: {e}");
                }
                history.push(term);
                self.notify_waiters(instance, &history, &out).await;
                self.router.unregister(instance).await;
                return (history, out);
            }

            // Persist deltas incrementally to avoid duplicates
            let mut persisted_len = baseline_len;
            let mut appended_any = false;
            if history.len() > persisted_len {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    error!(instance, turn_index, error=%e, "failed to append scheduled events");
                    self.notify_waiters(instance, &history, &Err(format!("history append failed: {e}")))
                        .await;
                    panic!("history append failed: {e}");
                }
                appended_any = true;
                persisted_len = history.len();
            }

            self.apply_decisions(instance, &history, decisions).await;

            // Receive at least one completion, or dehydrate on idle timeout
            let len_before_completions = history.len();
            let first_opt = tokio::time::timeout(
                std::time::Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS),
                comp_rx.recv(),
            )
            .await;
            let first = match first_opt {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.router.unregister(instance).await;
                    return (history, Ok(String::new()));
                }
                Err(_timeout) => {
                    // Dehydrate only if nobody is waiting on a result
                    let has_waiters = self.result_waiters.lock().await.contains_key(instance);
                    if has_waiters {
                        tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                        continue;
                    } else {
                        self.router.unregister(instance).await;
                        return (history, Ok(String::new()));
                    }
                }
            };

            let mut ack_tokens_persist_after: Vec<String> = Vec::new();
            let mut ack_tokens_immediate: Vec<String> = Vec::new();
            let mut terminate_reason: Option<String> = None;
            let mut terminate_acks: Vec<String> = Vec::new();
            let handle_msg = |msg: OrchestratorMsg,
                              history: &mut Vec<Event>,
                              persist_after: &mut Vec<String>,
                              immediate: &mut Vec<String>,
                              unmatched: &mut Vec<(String, String)>,
                              terminate: &mut Option<String>,
                              terminate_acks: &mut Vec<String>| {
                if let OrchestratorMsg::TerminateRequested { reason, ack_token, .. } = msg {
                    if terminate.is_none() {
                        *terminate = Some(reason);
                    }
                    // Acked only once the terminal event is durably appended,
                    // so a crash before then redelivers the terminate request
                    if let Some(t) = ack_token {
                        terminate_acks.push(t);
                    }
                    return;
                }
                let (token, applied) = completions::append_completion(history, msg);
                match applied {
                    completions::Applied::Appended => {
                        if let Some(t) = token {
                            persist_after.push(t);
                        }
                    }
                    completions::Applied::Ignored => {
                        if let Some(t) = token {
                            immediate.push(t);
                        }
                    }
                    completions::Applied::Unmatched { name, data } => {
                        unmatched.push((name, data));
                        if let Some(t) = token {
                            immediate.push(t);
                        }
                    }
                }
            };
            let mut unmatched_externals: Vec<(String, String)> = Vec::new();
            handle_msg(
                first,
                &mut history,
                &mut ack_tokens_persist_after,
                &mut ack_tokens_immediate,
                &mut unmatched_externals,
                &mut terminate_reason,
                &mut terminate_acks,
            );
            for _ in 0..Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => handle_msg(
                        msg,
                        &mut history,
                        &mut ack_tokens_persist_after,
                        &mut ack_tokens_immediate,
                        &mut unmatched_externals,
                        &mut terminate_reason,
                        &mut terminate_acks,
                    ),
                    Err(_) => break,
                }
            }
            // Externals that raced past their subscription go back to the buffer
            for (name, data) in unmatched_externals {
                self.buffer_external(instance, name, data).await;
            }
            // Ack immediately for messages that resulted in no history change
            for t in ack_tokens_immediate.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            // Persist completion events appended during this batch
            if history.len() > persisted_len {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    error!(instance, turn_index, error=%e, "failed to append history");
                    self.notify_waiters(instance, &history, &Err(format!("history append failed: {e}")))
                        .await;
                    panic!("history append failed: {e}");
                }
                appended_any = true;
            }
            for t in ack_tokens_persist_after.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            // Forced termination ends the execution without running user code again
            if let Some(reason) = terminate_reason {
                let term = Event::OrchestrationTerminated { reason: reason.clone() };
                if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
                    error!(instance, turn_index, error=%e, "failed to append terminal event");
                    panic!("history append failed: {e}");
                }
                history.push(term);
                for t in terminate_acks.drain(..) {
                    let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
                }
                let result = Err(format!("terminated: {reason}"));
                self.notify_waiters(instance, &history, &result).await;
                self.router.unregister(instance).await;
                info!(instance, reason=%reason, "orchestration terminated");
                return (history, result);
            }

            replay::collect_appended_completions(&history, len_before_completions, &mut last_appended_completions);

            if appended_any {
                turn_index = turn_index.saturating_add(1);
            }
        }
    }

    /// Spawn an instance and return a handle that resolves to its history
    /// and output when complete.
    pub fn spawn_instance_to_completion(self: Arc<Self>, instance: &str) -> JoinHandle<(Vec<Event>, Result<String, String>)> {
        let this_for_task = self.clone();
        let inst = instance.to_string();
        tokio::spawn(async move { this_for_task.run_instance_to_completion(&inst).await })
    }
}

fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().rev().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        Event::OrchestrationTerminated { reason } => Some(Err(format!("terminated: {reason}"))),
        _ => None,
    })
}

impl Runtime {
    /// Raise an external event by name into an instance. Events raised before
    /// the orchestrator subscribes are buffered and delivered FIFO once a wait
    /// for that name opens.
    pub async fn raise_event(&self, instance: &str, name: impl Into<String>, data: impl Into<String>) {
        let name_str = name.into();
        let data_str = data.into();
        if let Err(e) = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name_str.clone(),
                    data: data_str,
                },
            )
            .await
        {
            warn!(instance, name=%name_str, error=%e, "raise_event: failed to enqueue ExternalRaised");
        }
    }

    /// Typed variant of `raise_event`.
    pub async fn raise_event_typed<T: Serialize>(&self, instance: &str, name: impl Into<String>, data: &T) {
        match Json::encode(data) {
            Ok(payload) => self.raise_event(instance, name, payload).await,
            Err(e) => warn!(instance, error=%e, "raise_event_typed: encode failed"),
        }
    }

    /// Request forced termination of a running instance. The engine appends
    /// `OrchestrationTerminated` and stops scheduling further work; late
    /// completions for the instance are ignored.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) {
        let reason_s = reason.into();
        let _ = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason_s,
                },
            )
            .await;
    }

    /// Wait until the orchestration reaches a terminal state or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                OrchestrationStatus::NotFound | OrchestrationStatus::Running => {}
                terminal => return Ok(terminal),
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) otherwise.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => match Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            _ => unreachable!("wait_for_orchestration returns only terminal or timeout"),
        }
    }
}
