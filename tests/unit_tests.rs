use duraflow::providers::HistoryStore;
use duraflow::providers::fs::FsHistoryStore;
use duraflow::runtime::registry::ActivityRegistry;
use duraflow::runtime::{self};
use duraflow::{Action, Event, LogLevel, OrchestrationContext, OrchestrationRegistry, run_turn};
use std::sync::Arc;

mod common;

// 1) Single-turn emission: exactly one action per scheduled future and a matching schedule event recorded.
#[test]
fn action_emission_single_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        unreachable!()
    };

    let history: Vec<Event> = Vec::new();
    let (hist_after, actions, _logs, out): (_, _, _, Option<Result<String, String>>) = run_turn(history, orchestrator);
    assert!(out.is_none(), "must not complete in first turn");
    assert_eq!(actions.len(), 1, "exactly one action expected");
    match &actions[0] {
        Action::CallActivity { name, input, .. } => {
            assert_eq!(name, "A");
            assert_eq!(input, "1");
        }
        _ => panic!("unexpected action kind"),
    }
    assert!(matches!(hist_after[0], Event::ActivityScheduled { .. }));
}

// 2) Correlation: out-of-order completion in history still resolves the correct future by id.
#[test]
fn correlation_out_of_order_completion() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
        },
        Event::TimerFired { id: 42, fire_at_ms: 0 },
        Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "1").into_activity().await };

    let (_hist_after, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(
        actions.is_empty(),
        "should resolve from existing completion, no new actions"
    );
    assert_eq!(out.unwrap(), Ok("ok".to_string()));
}

// 3) Greeting workflow against a mocked history: approved path visits all three cities.
#[test]
fn greeting_approved_path_mocked_history() {
    let history = vec![
        Event::OrchestrationStarted {
            name: "Greeting".into(),
            input: "".into(),
        },
        Event::ActivityScheduled {
            id: 1,
            name: "SayHello".into(),
            input: "Tokyo".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "Hello Tokyo!".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "SayHello".into(),
            input: "Seattle".into(),
        },
        Event::ActivityCompleted {
            id: 2,
            result: "Hello Seattle!".into(),
        },
        Event::ExternalSubscribed {
            id: 3,
            name: "Approval".into(),
        },
        Event::ExternalEvent {
            id: 3,
            name: "Approval".into(),
            data: "true".into(),
        },
        Event::ActivityScheduled {
            id: 4,
            name: "SayHello".into(),
            input: "London".into(),
        },
        Event::ActivityCompleted {
            id: 4,
            result: "Hello London!".into(),
        },
    ];

    let (_hist, actions, _logs, out) = run_turn(history, greeting_orchestrator);
    assert!(actions.is_empty());
    let outputs: Vec<String> = serde_json::from_str(&out.unwrap().unwrap()).unwrap();
    assert_eq!(outputs, vec!["Hello Tokyo!", "Hello Seattle!", "Hello London!"]);
}

// 4) Greeting workflow denied: two outputs and a denial entry in the replay-safe log buffer.
#[test]
fn greeting_denied_path_logs_denial() {
    let history = vec![
        Event::OrchestrationStarted {
            name: "Greeting".into(),
            input: "".into(),
        },
        Event::ActivityScheduled {
            id: 1,
            name: "SayHello".into(),
            input: "Tokyo".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "Hello Tokyo!".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "SayHello".into(),
            input: "Seattle".into(),
        },
        Event::ActivityCompleted {
            id: 2,
            result: "Hello Seattle!".into(),
        },
        Event::ExternalSubscribed {
            id: 3,
            name: "Approval".into(),
        },
        Event::ExternalEvent {
            id: 3,
            name: "Approval".into(),
            data: "false".into(),
        },
    ];

    let (_hist, actions, logs, out) = run_turn(history, greeting_orchestrator);
    assert!(actions.is_empty());
    let outputs: Vec<String> = serde_json::from_str(&out.unwrap().unwrap()).unwrap();
    assert_eq!(outputs, vec!["Hello Tokyo!", "Hello Seattle!"]);
    assert!(
        logs.iter()
            .any(|(lvl, msg)| *lvl == LogLevel::Info && msg.contains("London trip denied")),
        "denial should be logged: {logs:?}"
    );
}

fn greeting_orchestrator(
    ctx: OrchestrationContext,
) -> impl std::future::Future<Output = Result<String, String>> + Send {
    async move {
        let mut outputs: Vec<String> = Vec::new();
        outputs.push(ctx.schedule_activity("SayHello", "Tokyo").into_activity().await?);
        outputs.push(ctx.schedule_activity("SayHello", "Seattle").into_activity().await?);
        let approved: bool = ctx
            .schedule_wait("Approval")
            .into_event_typed::<bool>()
            .await
            .unwrap_or(false);
        if approved {
            outputs.push(ctx.schedule_activity("SayHello", "London").into_activity().await?);
        } else {
            ctx.trace_info("London trip denied by approver");
        }
        serde_json::to_string(&outputs).map_err(|e| e.to_string())
    }
}

// 5) Custom status: latest value wins and replay re-observes instead of duplicating.
#[test]
fn custom_status_set_and_replayed() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.set_custom_status("phase-1");
        let r = ctx.schedule_activity("A", "x").into_activity().await?;
        ctx.set_custom_status("phase-2");
        Ok(r)
    };

    // First turn emits the first status and schedules the activity
    let (hist1, actions1, _logs, out1): (_, _, _, Option<Result<String, String>>) = run_turn(Vec::new(), orchestrator);
    assert!(out1.is_none());
    assert_eq!(actions1.len(), 1);
    let statuses: Vec<&Event> = hist1
        .iter()
        .filter(|e| matches!(e, Event::CustomStatusSet { .. }))
        .collect();
    assert_eq!(statuses.len(), 1);

    // Complete the activity; replay must not duplicate the first status
    let mut hist2 = hist1.clone();
    hist2.push(Event::ActivityCompleted {
        id: 1,
        result: "ok".into(),
    });
    let (hist3, _actions, _logs, out2) = run_turn(hist2, orchestrator);
    assert_eq!(out2.unwrap(), Ok("ok".to_string()));
    let values: Vec<String> = hist3
        .iter()
        .filter_map(|e| match e {
            Event::CustomStatusSet { value } => Some(value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec!["phase-1", "phase-2"]);
}

// 6) HistoryStore admin APIs over the fs provider.
#[tokio::test]
async fn history_store_admin_apis() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(tmp.path(), true).unwrap();
    store
        .append("i1", vec![Event::TimerCreated { id: 1, fire_at_ms: 10 }])
        .await
        .unwrap();
    store
        .append(
            "i2",
            vec![Event::ExternalSubscribed {
                id: 1,
                name: "Go".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(store.list_instances().await, vec!["i1".to_string(), "i2".to_string()]);

    let recs = store.read_records("i1").await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].instance, "i1");
    assert_eq!(recs[0].sequence, 1);
    assert!(recs[0].timestamp_ms > 0);

    store.remove_instance("i1").await.unwrap();
    assert_eq!(store.list_instances().await, vec!["i2".to_string()]);
    assert!(store.read("i1").await.is_empty());
}

// 7) Status queries through the runtime, including custom status detail.
#[tokio::test]
async fn status_queries_reflect_history() {
    let activity_registry = ActivityRegistry::builder()
        .register("Echo", |input: String| async move { Ok(input) })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("StatusOrch", |ctx: OrchestrationContext, input: String| async move {
            ctx.set_custom_status("working");
            let r = ctx.schedule_activity("Echo", input).into_activity().await?;
            Ok(r)
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestration_registry).await;

    assert_eq!(
        rt.get_orchestration_status("missing").await,
        runtime::OrchestrationStatus::NotFound
    );

    let h = rt
        .clone()
        .start_orchestration("inst-status", "StatusOrch", "hi")
        .await
        .unwrap();
    let (_hist, out) = h.await.unwrap();
    assert_eq!(out.unwrap(), "hi");

    let detail = rt.get_status_detail("inst-status").await;
    assert_eq!(
        detail.status,
        runtime::OrchestrationStatus::Completed { output: "hi".into() }
    );
    assert_eq!(detail.custom_status, Some("working".into()));
    rt.shutdown().await;
}

// 8) Unregistered orchestration fails cleanly instead of hanging.
#[tokio::test]
async fn unregistered_orchestration_fails() {
    let rt = runtime::Runtime::start(
        Arc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().build(),
    )
    .await;
    let h = rt.clone().start_orchestration("inst-unreg", "Nope", "").await.unwrap();
    let (_hist, out) = h.await.unwrap();
    assert_eq!(out.unwrap_err(), "unregistered:Nope");
    assert_eq!(
        rt.get_orchestration_status("inst-unreg").await,
        runtime::OrchestrationStatus::Failed {
            error: "unregistered:Nope".into()
        }
    );
    rt.shutdown().await;
}
