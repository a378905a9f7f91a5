//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted agent with per-sub-task behaviour that records concurrency
//! - Closure decomposers over predefined sub-task sets
//! - Building an orchestrator and polling a task to completion

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use weeki::agent::{Agent, AgentError, AgentInput, AgentRegistry};
use weeki::core::{Capability, Decomposition, Directive, SubTaskSpec, Task, TaskId};
use weeki::orchestration::{AgentPool, Decomposer, Orchestrator, SchedulerSettings, TaskStatus};

/// How the scripted agent treats one sub-task.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Work time before answering.
    pub delay: Duration,
    /// Fail this many attempts before succeeding.
    pub fail_times: u32,
    /// Failures are flagged fatal.
    pub fatal: bool,
    /// Never answer.
    pub hang: bool,
}

impl Behaviour {
    pub fn delay(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            ..Default::default()
        }
    }

    pub fn fail_always() -> Self {
        Self {
            fail_times: u32::MAX,
            ..Default::default()
        }
    }

    pub fn fail_times(times: u32) -> Self {
        Self {
            fail_times: times,
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
}

/// One recorded execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub sub_task: String,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Agent driven by a script keyed on sub-task id.
///
/// Unscripted sub-tasks succeed after `default_delay`.
pub struct ScriptedAgent {
    id: String,
    caps: Vec<Capability>,
    default_delay: Duration,
    script: HashMap<String, Behaviour>,
    attempts: Mutex<HashMap<String, u32>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<Execution>>,
}

impl ScriptedAgent {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            id: "scripted".to_string(),
            caps: vec![Capability::from("work")],
            default_delay,
            script: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, sub_task: &str, behaviour: Behaviour) -> Self {
        self.script.insert(sub_task.to_string(), behaviour);
        self
    }

    /// Most executions observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, sub_task: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(sub_task)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.log.lock().unwrap().clone()
    }

    fn enter(&self, sub_task: &str) -> Running<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut log = self.log.lock().unwrap();
        log.push(Execution {
            sub_task: sub_task.to_string(),
            started: Instant::now(),
            finished: None,
        });
        Running {
            agent: self,
            entry: log.len() - 1,
        }
    }
}

/// Counts an execution as running until dropped, including when the
/// execution future is dropped by a timeout or cancellation.
struct Running<'a> {
    agent: &'a ScriptedAgent,
    entry: usize,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.agent.current.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut log) = self.agent.log.lock() {
            log[self.entry].finished = Some(Instant::now());
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.caps
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        let sub_task = input.sub_task_id.to_string();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(sub_task.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let behaviour = self.script.get(&sub_task).cloned().unwrap_or(Behaviour {
            delay: self.default_delay,
            ..Default::default()
        });

        let _running = self.enter(&sub_task);
        if behaviour.hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(behaviour.delay).await;

        if attempt <= behaviour.fail_times {
            let message = format!("{} failed on attempt {}", sub_task, attempt);
            return Err(if behaviour.fatal {
                AgentError::fatal(message)
            } else {
                AgentError::new(message)
            });
        }
        let inputs: Vec<String> = input
            .dependency_outputs
            .keys()
            .map(|k| k.to_string())
            .collect();
        Ok(json!({ "sub_task": sub_task, "inputs": inputs }))
    }
}

/// S1 and S2 independent, S3 depending on both.
pub fn fan_in() -> Vec<SubTaskSpec> {
    vec![
        SubTaskSpec::new("S1", "first half"),
        SubTaskSpec::new("S2", "second half"),
        SubTaskSpec::new("S3", "combine").depends_on(["S1", "S2"]),
    ]
}

/// `n` sub-tasks with no dependencies, named `t0..tn`.
pub fn independent(n: usize) -> Vec<SubTaskSpec> {
    (0..n)
        .map(|i| SubTaskSpec::new(format!("t{}", i), "independent work"))
        .collect()
}

/// Decomposer that always returns the given sub-tasks.
pub fn fixed(specs: Vec<SubTaskSpec>) -> Arc<dyn Decomposer> {
    Arc::new(move |_: &Directive| -> weeki::Result<Decomposition> {
        Ok(Decomposition::new(specs.clone()))
    })
}

pub fn settings(timeout: Duration, retry_limit: u32) -> SchedulerSettings {
    SchedulerSettings {
        agent_timeout: timeout,
        retry_limit,
        fail_fast: false,
    }
}

/// An orchestrator over a single scripted agent.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub agent: Arc<ScriptedAgent>,
}

impl Harness {
    pub fn new(
        capacity: usize,
        agent: ScriptedAgent,
        decomposer: Arc<dyn Decomposer>,
        settings: SchedulerSettings,
    ) -> Self {
        let agent = Arc::new(agent);
        let mut agents = AgentRegistry::new();
        agents.register(agent.clone());
        let pool = Arc::new(AgentPool::new(capacity, Arc::new(agents)));
        Self {
            orchestrator: Orchestrator::new(pool, decomposer, settings),
            agent,
        }
    }

    pub async fn run(&self, directive: &str) -> (TaskId, TaskStatus) {
        let id = self.orchestrator.accept(directive).unwrap();
        let status = wait_for_terminal(&self.orchestrator, &id).await;
        (id, status)
    }

    pub fn task(&self, id: &TaskId) -> Task {
        self.orchestrator.registry().task(id).unwrap()
    }
}

/// Poll the registry until the task reaches a terminal state.
pub async fn wait_for_terminal(orchestrator: &Orchestrator, id: &TaskId) -> TaskStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = orchestrator.registry().get(id).unwrap();
        if status.state.is_terminal() {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "task {} stuck in {}",
            id,
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `check` holds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
