use duraflow::futures::DurableOutput;
use duraflow::{Event, OrchestrationContext, run_turn};

// 1) select2 winner is the completion that appears earliest in history, not program order.
#[test]
fn select2_picks_earliest_history_completion() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "B".into(),
            input: "".into(),
        },
        // B completed first even though A was scheduled first
        Event::ActivityCompleted {
            id: 2,
            result: "b".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "a".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "");
        let b = ctx.schedule_activity("B", "");
        let (winner_idx, out) = ctx.select2(a, b).await;
        (winner_idx, out)
    };

    let (_hist, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(actions.is_empty());
    let (winner_idx, out) = out.unwrap();
    assert_eq!(winner_idx, 1, "B finished first in history");
    assert_eq!(out, DurableOutput::Activity(Ok("b".into())));
}

// 2) Replaying the same select twice yields the same winner.
#[test]
fn select_winner_is_stable_across_replays() {
    let history = vec![
        Event::TimerCreated { id: 1, fire_at_ms: 100 },
        Event::ExternalSubscribed {
            id: 2,
            name: "Go".into(),
        },
        Event::ExternalEvent {
            id: 2,
            name: "Go".into(),
            data: "payload".into(),
        },
        Event::TimerFired { id: 1, fire_at_ms: 100 },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let t = ctx.schedule_timer(100);
        let e = ctx.schedule_wait("Go");
        let (idx, _out) = ctx.select2(t, e).await;
        idx
    };

    let (_h1, _a1, _l1, out1) = run_turn(history.clone(), orchestrator);
    let (_h2, _a2, _l2, out2) = run_turn(history, orchestrator);
    assert_eq!(out1.unwrap(), 1, "external completed before timer in history");
    assert_eq!(out1, out2);
}

// 3) join returns outputs in history completion order.
#[test]
fn join_outputs_follow_history_order() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "W".into(),
            input: "x".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "W".into(),
            input: "y".into(),
        },
        Event::ActivityScheduled {
            id: 3,
            name: "W".into(),
            input: "z".into(),
        },
        Event::ActivityCompleted {
            id: 2,
            result: "ry".into(),
        },
        Event::ActivityCompleted {
            id: 3,
            result: "rz".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "rx".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let futs = vec![
            ctx.schedule_activity("W", "x"),
            ctx.schedule_activity("W", "y"),
            ctx.schedule_activity("W", "z"),
        ];
        ctx.join(futs).await
    };

    let (_hist, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(actions.is_empty());
    let outputs = out.unwrap();
    assert_eq!(
        outputs,
        vec![
            DurableOutput::Activity(Ok("ry".into())),
            DurableOutput::Activity(Ok("rz".into())),
            DurableOutput::Activity(Ok("rx".into())),
        ]
    );
}

// 4) join remains pending until every branch has a completion.
#[test]
fn join_pending_until_all_complete() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "W".into(),
            input: "x".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "W".into(),
            input: "y".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "rx".into(),
        },
    ];

    let orchestrator = |ctx: OrchestrationContext| async move {
        let futs = vec![ctx.schedule_activity("W", "x"), ctx.schedule_activity("W", "y")];
        ctx.join(futs).await
    };

    let (_hist, actions, _logs, out) = run_turn(history, orchestrator);
    assert!(out.is_none());
    assert!(actions.is_empty(), "both branches already scheduled in history");
}

// 5) A select loser's schedule event still lands in history on the first turn.
#[test]
fn select_schedules_both_branches() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let t = ctx.schedule_timer(50);
        let e = ctx.schedule_wait("Signal");
        let (idx, _out) = ctx.select2(t, e).await;
        idx
    };

    let (hist, actions, _logs, out): (_, _, _, Option<usize>) = run_turn(Vec::new(), orchestrator);
    assert!(out.is_none());
    assert_eq!(actions.len(), 2);
    assert!(hist.iter().any(|e| matches!(e, Event::TimerCreated { id: 1, .. })));
    assert!(
        hist.iter()
            .any(|e| matches!(e, Event::ExternalSubscribed { id: 2, name } if name == "Signal"))
    );
}

// 6) Typed event decoding through into_event_typed.
#[test]
fn typed_external_event_decoding() {
    let history = vec![
        Event::ExternalSubscribed {
            id: 1,
            name: "Approval".into(),
        },
        Event::ExternalEvent {
            id: 1,
            name: "Approval".into(),
            data: "true".into(),
        },
    ];
    let orchestrator =
        |ctx: OrchestrationContext| async move { ctx.schedule_wait("Approval").into_event_typed::<bool>().await };
    let (_h, _a, _l, out) = run_turn(history, orchestrator);
    assert_eq!(out.unwrap(), Ok(true));
}
