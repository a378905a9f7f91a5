//! Task cancellation and orchestrator shutdown.

use std::time::Duration;

use weeki::core::{SubTaskErrorKind, SubTaskSpec, TaskState};
use weeki::Error;

use crate::fixtures::{
    eventually, fixed, independent, settings, wait_for_terminal, Behaviour, Harness,
    ScriptedAgent,
};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Test: Cancelling a running task
/// Given a task whose sub-tasks hang
/// When it is cancelled
/// Then it fails with the cancelled flag and its slots are released
#[tokio::test]
async fn test_cancel_releases_slots() {
    let agent = ScriptedAgent::new(Duration::ZERO)
        .with("t0", Behaviour::hang())
        .with("t1", Behaviour::hang());
    let harness = Harness::new(2, agent, fixed(independent(2)), settings(TIMEOUT, 3));

    let id = harness.orchestrator.accept("stuck").unwrap();
    eventually(|| harness.agent.current() == 2).await;

    harness.orchestrator.cancel(&id).unwrap();
    let status = wait_for_terminal(&harness.orchestrator, &id).await;

    assert_eq!(status.state, TaskState::Failed);
    assert!(status.result.as_ref().unwrap().cancelled);
    for sub in &status.sub_tasks {
        assert_eq!(sub.error.as_ref().unwrap().kind, SubTaskErrorKind::Cancelled);
        assert_eq!(sub.retry_count, 0, "cancellation is never retried");
    }
    assert_eq!(harness.orchestrator.pool().available(), 2);
    eventually(|| harness.agent.current() == 0).await;
}

/// Test: Cancellation is scoped to one task
/// Given two tasks whose roots both hang
/// When one of them is cancelled
/// Then the other keeps running until it is cancelled itself
#[tokio::test]
async fn test_cancel_does_not_affect_other_tasks() {
    let specs = vec![
        SubTaskSpec::new("slow", "hang"),
        SubTaskSpec::new("after", "later").depends_on(["slow"]),
    ];
    let agent = ScriptedAgent::new(Duration::from_millis(20)).with("slow", Behaviour::hang());
    let harness = Harness::new(3, agent, fixed(specs), settings(TIMEOUT, 0));

    let doomed = harness.orchestrator.accept("first").unwrap();
    let survivor = harness.orchestrator.accept("second").unwrap();
    eventually(|| harness.agent.current() == 2).await;

    harness.orchestrator.cancel(&doomed).unwrap();
    let cancelled = wait_for_terminal(&harness.orchestrator, &doomed).await;
    assert!(cancelled.result.unwrap().cancelled);

    assert_eq!(
        harness.orchestrator.registry().get(&survivor).unwrap().state,
        TaskState::Scheduling
    );
    assert!(harness.orchestrator.is_running(&survivor));

    harness.orchestrator.cancel(&survivor).unwrap();
    let survived = wait_for_terminal(&harness.orchestrator, &survivor).await;
    assert_eq!(harness.agent.attempts("after"), 0);
    assert!(survived.result.unwrap().cancelled);
}

/// Test: An unaffected task completes while another is cancelled
/// Given a hanging task and a quick independent task
/// When the hanging task is cancelled mid-flight
/// Then the quick task succeeds untouched
#[tokio::test]
async fn test_quick_task_succeeds_beside_cancelled_task() {
    let agent = ScriptedAgent::new(Duration::from_millis(40)).with("t0", Behaviour::hang());
    let hanging = Harness::new(4, agent, fixed(independent(1)), settings(TIMEOUT, 0));
    let quick_decomposer = fixed(vec![
        SubTaskSpec::new("q1", "quick"),
        SubTaskSpec::new("q2", "quick").depends_on(["q1"]),
    ]);
    let quick = weeki::Orchestrator::new(
        hanging.orchestrator.pool().clone(),
        quick_decomposer,
        settings(TIMEOUT, 0),
    );

    let doomed = hanging.orchestrator.accept("hang").unwrap();
    let fine = quick.accept("quick").unwrap();
    eventually(|| hanging.agent.current() >= 1).await;
    hanging.orchestrator.cancel(&doomed).unwrap();

    let status = wait_for_terminal(&quick, &fine).await;
    assert_eq!(status.state, TaskState::Succeeded);
    let cancelled = wait_for_terminal(&hanging.orchestrator, &doomed).await;
    assert_eq!(cancelled.state, TaskState::Failed);
}

/// Test: Shutdown
/// Given running tasks
/// When the orchestrator shuts down
/// Then every task ends cancelled, slots are free and new directives are refused
#[tokio::test]
async fn test_shutdown_cancels_everything() {
    let agent = ScriptedAgent::new(Duration::ZERO).with("t0", Behaviour::hang());
    let harness = Harness::new(2, agent, fixed(independent(1)), settings(TIMEOUT, 0));

    let a = harness.orchestrator.accept("one").unwrap();
    let b = harness.orchestrator.accept("two").unwrap();
    eventually(|| harness.agent.current() == 2).await;

    harness.orchestrator.shutdown().await;

    for id in [a, b] {
        let status = harness.orchestrator.registry().get(&id).unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.result.unwrap().cancelled);
    }
    assert_eq!(harness.orchestrator.pool().available(), 2);
    assert!(harness.orchestrator.pool().is_closed());
    assert!(matches!(
        harness.orchestrator.accept("three"),
        Err(Error::ShuttingDown)
    ));
    assert_eq!(harness.orchestrator.health().active_loops, 0);
}

/// Test: Cancel after completion
/// Given a finished task
/// When it is cancelled
/// Then nothing changes
#[tokio::test]
async fn test_cancel_finished_task_is_noop() {
    let harness = Harness::new(
        1,
        ScriptedAgent::new(Duration::ZERO),
        fixed(independent(1)),
        settings(TIMEOUT, 0),
    );
    let (id, status) = harness.run("done").await;
    assert_eq!(status.state, TaskState::Succeeded);

    harness.orchestrator.cancel(&id).unwrap();
    assert_eq!(
        harness.orchestrator.registry().get(&id).unwrap().state,
        TaskState::Succeeded
    );
}
