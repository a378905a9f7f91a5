//! End-to-end scheduling scenarios.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use weeki::core::{
    Decomposition, Directive, SubTaskErrorKind, SubTaskSpec, SubTaskState, TaskErrorKind,
    TaskState,
};
use weeki::orchestration::Decomposer;

use crate::fixtures::{
    eventually, fan_in, fixed, independent, settings, Behaviour, Harness, ScriptedAgent,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Test: Fan-in with a single slot
/// Given S1, S2 independent and S3 depending on both, capacity 1
/// When the directive runs
/// Then S1 and S2 run one after the other, S3 runs last, the task succeeds
#[tokio::test]
async fn test_fan_in_capacity_one_succeeds() {
    let harness = Harness::new(
        1,
        ScriptedAgent::new(Duration::from_millis(10)),
        fixed(fan_in()),
        settings(TIMEOUT, 0),
    );

    let (id, status) = harness.run("A").await;

    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(harness.agent.peak(), 1, "capacity 1 must serialise execution");

    let executions = harness.agent.executions();
    let order: Vec<&str> = executions.iter().map(|e| e.sub_task.as_str()).collect();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "S3");

    let result = status.result.unwrap();
    assert_eq!(
        result.output,
        Some(json!({ "sub_task": "S3", "inputs": ["S1", "S2"] }))
    );
    assert_eq!(result.outputs.len(), 3);
    assert!(result.failures.is_empty());
    assert!(harness.task(&id).error.is_none());
}

/// Test: Dependency ordering
/// Given the fan-in graph with two slots
/// When the directive runs
/// Then S3 starts only after both dependencies completed
#[tokio::test]
async fn test_dependents_start_after_dependencies_succeed() {
    let harness = Harness::new(
        2,
        ScriptedAgent::new(Duration::from_millis(20)),
        fixed(fan_in()),
        settings(TIMEOUT, 0),
    );

    let (id, status) = harness.run("A").await;
    assert_eq!(status.state, TaskState::Succeeded);

    let task = harness.task(&id);
    let sub = |name: &str| {
        task.sub_tasks
            .iter()
            .find(|s| s.id.as_str() == name)
            .unwrap()
            .clone()
    };
    let s3_started = sub("S3").started_at.unwrap();
    for dep in ["S1", "S2"] {
        let completed = sub(dep).completed_at.unwrap();
        assert!(
            completed <= s3_started,
            "{} completed at {} after S3 started at {}",
            dep,
            completed,
            s3_started
        );
    }
}

/// Test: Permanent failure makes the root unreachable
/// Given the fan-in graph where S2 always fails and retries are disabled
/// When the directive runs
/// Then S1 succeeds, S3 never runs, the task fails with exactly S2's error
#[tokio::test]
async fn test_fan_in_with_failed_dependency_fails_task() {
    let harness = Harness::new(
        1,
        ScriptedAgent::new(Duration::from_millis(5)).with("S2", Behaviour::fail_always()),
        fixed(fan_in()),
        settings(TIMEOUT, 0),
    );

    let (_, status) = harness.run("A").await;

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(harness.agent.attempts("S3"), 0);

    let state_of = |name: &str| {
        status
            .sub_tasks
            .iter()
            .find(|s| s.id.as_str() == name)
            .unwrap()
    };
    assert_eq!(state_of("S1").state, SubTaskState::Succeeded);
    assert_eq!(state_of("S2").state, SubTaskState::Failed);
    assert_eq!(state_of("S3").state, SubTaskState::Pending);
    assert!(state_of("S3").blocked);

    let result = status.result.unwrap();
    assert!(!result.root_reached);
    assert!(!result.cancelled);
    let failed: Vec<&str> = result.failures.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(failed, vec!["S2"]);
    assert_eq!(result.failures[0].error.kind, SubTaskErrorKind::AgentFailed);
}

/// Test: Failures do not cascade to independent branches
/// Given two independent chains where only one fails
/// When the directive runs
/// Then the other chain completes and the task is partially failed
#[tokio::test]
async fn test_independent_branch_survives_failure() {
    let specs = vec![
        SubTaskSpec::new("a1", "left"),
        SubTaskSpec::new("a2", "left again").depends_on(["a1"]),
        SubTaskSpec::new("b1", "right"),
        SubTaskSpec::new("b2", "right again").depends_on(["b1"]),
    ];
    let harness = Harness::new(
        2,
        ScriptedAgent::new(Duration::from_millis(5)).with("a1", Behaviour::fail_always()),
        fixed(specs),
        settings(TIMEOUT, 1),
    );

    let (_, status) = harness.run("two chains").await;

    assert_eq!(status.state, TaskState::PartiallyFailed);
    assert_eq!(harness.agent.attempts("a1"), 2, "one retry allowed");
    assert_eq!(harness.agent.attempts("a2"), 0);
    assert_eq!(harness.agent.attempts("b2"), 1);

    let result = status.result.unwrap();
    assert!(result.root_reached);
    // Only one root succeeded, so its payload is the output.
    assert_eq!(
        result.output,
        Some(json!({ "sub_task": "b2", "inputs": ["b1"] }))
    );
}

/// Test: Retry recovers a flaky sub-task
/// Given a sub-task that fails twice and a retry limit of 3
/// When the directive runs
/// Then it succeeds on the third attempt with retry count 2
#[tokio::test]
async fn test_flaky_sub_task_recovers_through_retries() {
    let harness = Harness::new(
        2,
        ScriptedAgent::new(Duration::from_millis(1)).with("t0", Behaviour::fail_times(2)),
        fixed(independent(1)),
        settings(TIMEOUT, 3),
    );

    let (_, status) = harness.run("flaky").await;

    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(harness.agent.attempts("t0"), 3);
    assert_eq!(status.sub_tasks[0].retry_count, 2);
}

/// Test: Fatal agent errors are not retried
/// Given a sub-task whose agent reports a fatal error
/// When the directive runs
/// Then it is attempted exactly once
#[tokio::test]
async fn test_fatal_error_skips_retries() {
    let fatal = Behaviour {
        fail_times: u32::MAX,
        fatal: true,
        ..Default::default()
    };
    let harness = Harness::new(
        1,
        ScriptedAgent::new(Duration::ZERO).with("t0", fatal),
        fixed(independent(1)),
        settings(TIMEOUT, 5),
    );

    let (_, status) = harness.run("fatal").await;

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(harness.agent.attempts("t0"), 1);
    assert!(status.sub_tasks[0].error.as_ref().unwrap().fatal);
}

/// Test: Cyclic decomposition
/// Given a decomposition with a cycle
/// When the directive runs
/// Then the task fails with a malformed graph error and no agent runs
#[tokio::test]
async fn test_cycle_never_reaches_an_agent() {
    let specs = vec![
        SubTaskSpec::new("x", "x").depends_on(["z"]),
        SubTaskSpec::new("y", "y").depends_on(["x"]),
        SubTaskSpec::new("z", "z").depends_on(["y"]),
    ];
    let harness = Harness::new(
        2,
        ScriptedAgent::new(Duration::ZERO),
        fixed(specs),
        settings(TIMEOUT, 0),
    );

    let (_, status) = harness.run("loop").await;

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.error.unwrap().kind, TaskErrorKind::MalformedGraph);
    assert!(status.sub_tasks.is_empty());
    assert!(status.result.is_none());
    assert_eq!(harness.agent.total_attempts(), 0);
}

/// Test: A panicking decomposer
/// Given a decomposer that panics
/// When the directive runs
/// Then the task fails with an internal error and its loop is gone
#[tokio::test]
async fn test_panicking_decomposer_fails_task() {
    let decomposer: Arc<dyn Decomposer> =
        Arc::new(|_: &Directive| -> weeki::Result<Decomposition> { panic!("decomposer bug") });
    let harness = Harness::new(
        1,
        ScriptedAgent::new(Duration::ZERO),
        decomposer,
        settings(TIMEOUT, 0),
    );

    let (id, status) = harness.run("explode").await;

    assert_eq!(status.state, TaskState::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::Internal);
    assert!(error.message.contains("decomposer bug"), "{}", error.message);
    eventually(|| !harness.orchestrator.is_running(&id)).await;
    assert!(harness.orchestrator.health().loops_live);
    assert_eq!(harness.orchestrator.pool().available(), 1);
}

/// Test: Every node of a deep graph is eventually scheduled
/// Given a diamond of diamonds
/// When the directive runs
/// Then every sub-task succeeds exactly once
#[tokio::test]
async fn test_layered_graph_runs_every_node_once() {
    let specs = vec![
        SubTaskSpec::new("root", "start"),
        SubTaskSpec::new("l1", "left").depends_on(["root"]),
        SubTaskSpec::new("r1", "right").depends_on(["root"]),
        SubTaskSpec::new("mid", "join").depends_on(["l1", "r1"]),
        SubTaskSpec::new("l2", "left").depends_on(["mid"]),
        SubTaskSpec::new("r2", "right").depends_on(["mid"]),
        SubTaskSpec::new("end", "join").depends_on(["l2", "r2"]),
    ];
    let harness = Harness::new(
        3,
        ScriptedAgent::new(Duration::from_millis(2)),
        fixed(specs),
        settings(TIMEOUT, 0),
    );

    let (_, status) = harness.run("diamonds").await;

    assert_eq!(status.state, TaskState::Succeeded);
    for name in ["root", "l1", "r1", "mid", "l2", "r2", "end"] {
        assert_eq!(harness.agent.attempts(name), 1, "{} attempts", name);
    }
    assert!(harness.agent.peak() <= 2, "at most two nodes are ever ready together");
}
