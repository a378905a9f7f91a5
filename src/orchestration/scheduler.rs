//! Orchestrator: owns the lifecycle of every task.
//!
//! `accept` records a task and spawns one scheduling loop for it. The loop
//! decomposes the directive, builds the task graph, then repeatedly submits
//! ready sub-tasks to the shared [`AgentPool`] and folds execution outcomes
//! back into the graph until it is terminal. Every transition is published
//! to the [`TaskRegistry`].
//!
//! The loop suspends in exactly one place: a `select!` over task
//! cancellation, the next execution outcome, and (when a ready sub-task was
//! turned away) a pool slot. The slot reservation outlives loop passes, so
//! a task keeps its place in the pool's arrival-order queue.

use crate::agent::{AgentInput, AgentRegistry};
use crate::config::Config;
use crate::core::{
    Directive, SubTask, SubTaskError, SubTaskId, Task, TaskError, TaskErrorKind, TaskGraph,
    TaskId, TaskResult,
};
use crate::error::{Error, Result};
use crate::orchestration::decompose::Decomposer;
use crate::orchestration::health::HealthReport;
use crate::orchestration::pool::{AgentPool, ExecutionReport, SlotPermit};
use crate::orchestration::registry::TaskRegistry;
use futures::future::{BoxFuture, OptionFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduling policy shared by every task loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Deadline for a single agent execution.
    pub agent_timeout: Duration,
    /// Retries allowed per sub-task after its first attempt.
    pub retry_limit: u32,
    /// Stop starting sub-tasks after the first permanent failure.
    pub fail_fast: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            agent_timeout: config.agent_timeout(),
            retry_limit: config.retry_limit,
            fail_fast: config.fail_fast,
        }
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    pool: Arc<AgentPool>,
    decomposer: Arc<dyn Decomposer>,
    settings: SchedulerSettings,
    shutdown: CancellationToken,
    loops: Mutex<HashMap<TaskId, RunningLoop>>,
}

impl Inner {
    fn loops(&self) -> MutexGuard<'_, HashMap<TaskId, RunningLoop>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry point of the orchestration core.
///
/// Cheap to clone; clones share the same registry, pool and loops.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use weeki::agent::AgentRegistry;
/// use weeki::config::Config;
/// use weeki::orchestration::{KeywordDecomposer, Orchestrator};
///
/// let config = Config::default();
/// let agents = AgentRegistry::with_builtin_agents(config.agent_delay());
/// let orchestrator = Orchestrator::from_config(&config, agents, Arc::new(KeywordDecomposer));
///
/// let task_id = orchestrator.accept("research the market then write a summary")?;
/// let status = orchestrator.registry().get(&task_id)?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<AgentPool>,
        decomposer: Arc<dyn Decomposer>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(TaskRegistry::new()),
                pool,
                decomposer,
                settings,
                shutdown: CancellationToken::new(),
                loops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Build an orchestrator with a pool sized by `config.max_agents`.
    pub fn from_config(
        config: &Config,
        agents: AgentRegistry,
        decomposer: Arc<dyn Decomposer>,
    ) -> Self {
        let pool = Arc::new(AgentPool::new(config.max_agents, Arc::new(agents)));
        Self::new(pool, decomposer, SchedulerSettings::from(config))
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.inner.pool
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Accept a directive and start working on it.
    ///
    /// Returns as soon as the task is recorded; decomposition and scheduling
    /// happen on a spawned loop. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// `InvalidDirective` for blank text, `ShuttingDown` after `shutdown()`.
    pub fn accept(&self, directive: impl Into<Directive>) -> Result<TaskId> {
        let directive = directive.into();
        if directive.is_blank() {
            return Err(Error::InvalidDirective(
                "directive text is empty".to_string(),
            ));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let task = Task::new(TaskId::new(), directive);
        let task_id = task.id;
        self.inner.registry.insert(task);
        info!(task = %task_id.short(), "directive accepted");

        let cancel = self.inner.shutdown.child_token();
        let task_loop = TaskLoop {
            inner: Arc::clone(&self.inner),
            task_id,
            cancel: cancel.clone(),
        };

        // Held across spawn so the loop cannot deregister before it is registered.
        let mut loops = self.inner.loops();
        let handle = tokio::spawn(task_loop.run());
        loops.insert(task_id, RunningLoop { cancel, handle });
        Ok(task_id)
    }

    /// Cancel a task. Its running executions are stopped and their slots
    /// released; other tasks are unaffected.
    ///
    /// Cancelling a finished task is a no-op.
    ///
    /// # Errors
    /// `NotFound` if the task is unknown.
    pub fn cancel(&self, task_id: &TaskId) -> Result<()> {
        if !self.inner.registry.contains(task_id) {
            return Err(Error::NotFound(*task_id));
        }
        if let Some(running) = self.inner.loops().get(task_id) {
            info!(task = %task_id.short(), "cancelling task");
            running.cancel.cancel();
        }
        Ok(())
    }

    /// Whether the task's scheduling loop is still running.
    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.inner.loops().contains_key(task_id)
    }

    /// Stop accepting directives, cancel every loop and wait for them.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutdown.cancel();
        let handles: Vec<(TaskId, JoinHandle<()>)> = self
            .inner
            .loops()
            .drain()
            .map(|(id, running)| (id, running.handle))
            .collect();

        for (task_id, handle) in handles {
            if let Err(err) = handle.await {
                error!(task = %task_id.short(), %err, "scheduling loop aborted");
            }
        }
        self.inner.pool.close();
        debug!("orchestrator stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn health(&self) -> HealthReport {
        let (active_loops, dead_loops) = {
            let loops = self.inner.loops();
            let dead = loops.values().filter(|l| l.handle.is_finished()).count();
            (loops.len() - dead, dead)
        };
        HealthReport::new(
            !self.is_shutting_down(),
            self.inner.pool.capacity(),
            self.inner.pool.available(),
            dead_loops == 0,
            active_loops,
            self.inner.registry.stats(),
        )
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pool", &self.inner.pool)
            .field("registry", &self.inner.registry)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

type InFlight = FuturesUnordered<BoxFuture<'static, ExecutionReport>>;
type Reservation = BoxFuture<'static, Result<SlotPermit>>;

/// What a dispatch pass left behind.
enum Dispatch {
    /// Every ready sub-task was handled.
    Drained,
    /// A ready sub-task was turned away for lack of a slot.
    WantSlot,
}

/// The scheduling loop of one task.
struct TaskLoop {
    inner: Arc<Inner>,
    task_id: TaskId,
    cancel: CancellationToken,
}

impl TaskLoop {
    async fn run(self) {
        let failure = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(format!("scheduling loop panicked: {}", panic_message(&*panic))),
        };
        if let Some(message) = failure {
            error!(task = %self.task_id.short(), error = %message, "scheduling loop failed");
            // Stops any execution still running for this task.
            self.cancel.cancel();
            let _ = self.inner.registry.update(&self.task_id, |task| {
                task.abort(TaskError::new(TaskErrorKind::Internal, message))
            });
        }
        self.inner.loops().remove(&self.task_id);
    }

    async fn drive(&self) -> Result<()> {
        let directive = self.inner.registry.update(&self.task_id, |task| {
            task.begin_decomposition();
            task.directive.clone()
        })?;
        debug!(task = %self.task_id.short(), "decomposing directive");

        let decomposed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return self.finish(Vec::new(), cancelled_result());
            }
            result = self.inner.decomposer.decompose(&directive) => result,
        };
        let decomposition = match decomposed {
            Ok(decomposition) => decomposition,
            Err(err) => {
                warn!(task = %self.task_id.short(), %err, "decomposition failed");
                return self.abort(TaskErrorKind::DecompositionFailed, err);
            }
        };

        let mut graph = match TaskGraph::build(&directive, decomposition) {
            Ok(graph) => graph,
            Err(err) => {
                warn!(task = %self.task_id.short(), %err, "rejected task graph");
                return self.abort(TaskErrorKind::MalformedGraph, err);
            }
        };
        info!(
            task = %self.task_id.short(),
            sub_tasks = graph.len(),
            dependencies = graph.dependency_count(),
            "task graph built"
        );
        let snapshot = graph.snapshot();
        self.inner
            .registry
            .update(&self.task_id, |task| task.begin_scheduling(snapshot))?;

        let mut in_flight = InFlight::new();
        // Kept across passes so the task holds its place in the pool's queue.
        let mut reservation: Option<Reservation> = None;
        loop {
            if self.cancel.is_cancelled() {
                return self.wind_down(graph, in_flight).await;
            }

            let dispatch = self.dispatch(&mut graph, &mut in_flight)?;
            self.publish(&graph)?;

            if graph.is_terminal() {
                let result = graph.aggregate()?;
                return self.finish(graph.snapshot(), result);
            }
            let want_slot = matches!(dispatch, Dispatch::WantSlot);
            if !want_slot {
                reservation = None;
            } else if reservation.is_none() {
                reservation = Some(self.reserve_slot());
            }
            if in_flight.is_empty() && !want_slot && !self.cancel.is_cancelled() {
                return self.abort(
                    TaskErrorKind::Internal,
                    "scheduling stalled with no runnable sub-task",
                );
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                Some(report) = in_flight.next(), if !in_flight.is_empty() => {
                    self.record(&mut graph, report)?;
                }
                Some(permit) = OptionFuture::from(reservation.as_mut()), if reservation.is_some() => {
                    reservation = None;
                    match permit {
                        Ok(permit) => self.dispatch_with(&mut graph, &mut in_flight, permit)?,
                        Err(_) => self.cancel.cancel(),
                    }
                }
            }
        }
    }

    /// Submit every ready sub-task the pool will take without waiting.
    fn dispatch(&self, graph: &mut TaskGraph, in_flight: &mut InFlight) -> Result<Dispatch> {
        let ready: Vec<SubTaskId> = graph.ready_nodes().cloned().collect();
        for id in ready {
            // A fail-fast short-circuit earlier in this pass closes the rest.
            if !graph.is_ready_id(&id) {
                continue;
            }
            let input = self.input_for(graph, &id)?;
            let cancel = self.cancel.child_token();
            match self
                .inner
                .pool
                .try_submit(input, self.inner.settings.agent_timeout, cancel)
            {
                Ok(pending) => {
                    graph.mark_running(&id)?;
                    info!(
                        task = %self.task_id.short(),
                        sub_task = %id,
                        agent = %pending.agent_id(),
                        slot = pending.slot(),
                        "sub-task started"
                    );
                    in_flight.push(pending.wait().boxed());
                }
                Err(Error::PoolSaturated { .. }) => {
                    debug!(task = %self.task_id.short(), sub_task = %id, "pool saturated");
                    return Ok(Dispatch::WantSlot);
                }
                Err(Error::NoEligibleAgent { capability }) => {
                    graph.mark_running(&id)?;
                    self.fail(graph, &id, SubTaskError::no_eligible_agent(&capability))?;
                }
                Err(Error::ShuttingDown) => {
                    self.cancel.cancel();
                    return Ok(Dispatch::Drained);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(Dispatch::Drained)
    }

    /// Queue for the next free slot.
    fn reserve_slot(&self) -> Reservation {
        let pool = Arc::clone(&self.inner.pool);
        async move { pool.reserve().await }.boxed()
    }

    /// Start the first ready sub-task on a slot obtained by waiting.
    fn dispatch_with(
        &self,
        graph: &mut TaskGraph,
        in_flight: &mut InFlight,
        permit: SlotPermit,
    ) -> Result<()> {
        let Some(id) = graph.ready_nodes().next().cloned() else {
            return Ok(());
        };
        let input = self.input_for(graph, &id)?;
        let cancel = self.cancel.child_token();
        match self
            .inner
            .pool
            .execute(permit, input, self.inner.settings.agent_timeout, cancel)
        {
            Ok(pending) => {
                graph.mark_running(&id)?;
                info!(
                    task = %self.task_id.short(),
                    sub_task = %id,
                    agent = %pending.agent_id(),
                    slot = pending.slot(),
                    "sub-task started"
                );
                in_flight.push(pending.wait().boxed());
                Ok(())
            }
            Err(Error::NoEligibleAgent { capability }) => {
                graph.mark_running(&id)?;
                self.fail(graph, &id, SubTaskError::no_eligible_agent(&capability))
            }
            Err(other) => Err(other),
        }
    }

    fn input_for(&self, graph: &TaskGraph, id: &SubTaskId) -> Result<AgentInput> {
        let sub = graph
            .get(id)
            .ok_or_else(|| Error::UnknownSubTask(id.clone()))?;
        let directive = graph.directive();
        Ok(AgentInput {
            task_id: self.task_id,
            sub_task_id: id.clone(),
            description: sub.description.clone(),
            capability: sub.capability.clone(),
            directive: directive.text.clone(),
            context: directive.context.clone(),
            dependency_outputs: graph.inputs_for(id)?,
        })
    }

    /// Fold one execution outcome into the graph.
    fn record(&self, graph: &mut TaskGraph, report: ExecutionReport) -> Result<()> {
        let id = report.sub_task_id;
        match report.outcome {
            Ok(output) => {
                graph.mark_succeeded(&id, output)?;
                info!(task = %self.task_id.short(), sub_task = %id, "sub-task succeeded");
                Ok(())
            }
            Err(err) => {
                let attempts = graph.get(&id).map_or(0, |sub| sub.retry_count);
                if err.is_retryable() && attempts < self.inner.settings.retry_limit {
                    warn!(
                        task = %self.task_id.short(),
                        sub_task = %id,
                        %err,
                        retry = attempts + 1,
                        limit = self.inner.settings.retry_limit,
                        "retrying sub-task"
                    );
                    graph.requeue(&id, err)?;
                    Ok(())
                } else {
                    self.fail(graph, &id, err)
                }
            }
        }
    }

    fn fail(&self, graph: &mut TaskGraph, id: &SubTaskId, err: SubTaskError) -> Result<()> {
        warn!(task = %self.task_id.short(), sub_task = %id, %err, "sub-task failed");
        graph.mark_failed(id, err)?;
        if self.inner.settings.fail_fast && !graph.is_short_circuited() {
            info!(task = %self.task_id.short(), "fail-fast: no further sub-tasks will start");
            graph.short_circuit();
        }
        Ok(())
    }

    /// Collect outcomes of executions stopped by cancellation, then finish.
    async fn wind_down(&self, mut graph: TaskGraph, mut in_flight: InFlight) -> Result<()> {
        graph.short_circuit();
        while let Some(report) = in_flight.next().await {
            let id = report.sub_task_id;
            match report.outcome {
                Ok(output) => graph.mark_succeeded(&id, output)?,
                Err(err) => graph.mark_failed(&id, err)?,
            }
        }
        let mut result = graph.aggregate()?;
        result.cancelled = true;
        info!(
            task = %self.task_id.short(),
            succeeded = result.outputs.len(),
            "task cancelled"
        );
        self.finish(graph.snapshot(), result)
    }

    fn publish(&self, graph: &TaskGraph) -> Result<()> {
        let snapshot = graph.snapshot();
        self.inner
            .registry
            .update(&self.task_id, |task| task.sync_sub_tasks(snapshot))
    }

    fn finish(&self, sub_tasks: Vec<SubTask>, result: TaskResult) -> Result<()> {
        let state = result.state();
        let failed = result.failures.len();
        self.inner
            .registry
            .update(&self.task_id, |task| task.finish(sub_tasks, result))?;
        info!(task = %self.task_id.short(), %state, failed, "task finished");
        Ok(())
    }

    fn abort(&self, kind: TaskErrorKind, message: impl ToString) -> Result<()> {
        let error = TaskError::new(kind, message.to_string());
        self.inner
            .registry
            .update(&self.task_id, |task| task.abort(error))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn cancelled_result() -> TaskResult {
    TaskResult {
        output: None,
        outputs: Vec::new(),
        failures: Vec::new(),
        root_reached: false,
        cancelled: true,
    }
}
