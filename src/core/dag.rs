//! Task graph: one directive's sub-tasks as a directed acyclic graph.
//!
//! Sub-tasks live in a petgraph `DiGraph` arena; an edge `a -> b` means
//! `b` depends on `a`. The graph is validated once at construction and
//! afterwards only changes node state through the transition methods.

use crate::core::subtask::{Capability, SubTask, SubTaskError, SubTaskId, SubTaskState};
use crate::core::task::{Directive, SubTaskFailure, SubTaskOutput, TaskResult};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// One sub-task as described by a decomposition function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub id: SubTaskId,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<SubTaskId>,
    /// Required capability; `None` accepts any agent.
    #[serde(default)]
    pub capability: Option<Capability>,
}

impl SubTaskSpec {
    pub fn new(id: impl Into<SubTaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            depends_on: Vec::new(),
            capability: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubTaskId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

/// Output of a decomposition function: sub-tasks plus dependency edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub sub_tasks: Vec<SubTaskSpec>,
}

impl Decomposition {
    pub fn new(sub_tasks: Vec<SubTaskSpec>) -> Self {
        Self { sub_tasks }
    }

    pub fn with(mut self, spec: SubTaskSpec) -> Self {
        self.sub_tasks.push(spec);
        self
    }

    pub fn len(&self) -> usize {
        self.sub_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_tasks.is_empty()
    }
}

/// The sub-task dependency graph of one task.
pub struct TaskGraph {
    directive: Directive,
    graph: DiGraph<SubTask, ()>,
    /// Index mapping from SubTaskId to NodeIndex for fast lookups.
    index: HashMap<SubTaskId, NodeIndex>,
    /// Topological order, fixed at construction.
    order: Vec<NodeIndex>,
    short_circuited: bool,
}

impl TaskGraph {
    /// Build and validate a graph from a decomposition.
    ///
    /// # Errors
    /// Returns `MalformedGraph` if the decomposition is empty, repeats an
    /// identifier, or contains a self-dependency, a dependency on an unknown
    /// sub-task, or a cycle.
    pub fn build(directive: &Directive, decomposition: Decomposition) -> Result<Self> {
        let specs = decomposition.sub_tasks;
        let positions = validate(&specs)?;

        let mut graph = DiGraph::with_capacity(specs.len(), specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            let mut deps: Vec<SubTaskId> = Vec::with_capacity(spec.depends_on.len());
            for dep in spec.depends_on {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
            let id = spec.id.clone();
            let node = graph.add_node(SubTask::new(spec.id, &spec.description, deps, spec.capability));
            index.insert(id, node);
        }

        let edges: Vec<(NodeIndex, NodeIndex)> = graph
            .node_indices()
            .flat_map(|node| {
                graph[node]
                    .depends_on
                    .iter()
                    .filter_map(|dep| index.get(dep).map(|&from| (from, node)))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            Error::malformed(format!(
                "dependency cycle through {}",
                graph[cycle.node_id()].id
            ))
        })?;

        trace!(
            sub_tasks = positions.len(),
            dependencies = graph.edge_count(),
            "task graph built"
        );

        Ok(Self {
            directive: directive.clone(),
            graph,
            index,
            order,
            short_circuited: false,
        })
    }

    pub fn directive(&self) -> &Directive {
        &self.directive
    }

    /// Get a sub-task by its ID.
    pub fn get(&self, id: &SubTaskId) -> Option<&SubTask> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    /// Sub-tasks in decomposition order.
    pub fn sub_tasks(&self) -> impl Iterator<Item = &SubTask> + '_ {
        self.graph.node_weights()
    }

    /// Owned copy of every sub-task, for publication to observers.
    pub fn snapshot(&self) -> Vec<SubTask> {
        self.graph.node_weights().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn running_count(&self) -> usize {
        self.count(SubTaskState::Running)
    }

    pub fn count(&self, state: SubTaskState) -> usize {
        self.graph.node_weights().filter(|s| s.state == state).count()
    }

    /// Sub-task IDs in dependency order.
    pub fn topological_order(&self) -> Vec<&SubTaskId> {
        self.order.iter().map(|&node| &self.graph[node].id).collect()
    }

    /// Sub-tasks that nothing else depends on.
    pub fn roots(&self) -> Vec<&SubTaskId> {
        self.order
            .iter()
            .filter(|&&node| self.is_root(node))
            .map(|&node| &self.graph[node].id)
            .collect()
    }

    // ========== Scheduling Operations ==========

    /// Pending sub-tasks whose dependencies have all succeeded.
    ///
    /// Recomputed on every call, in decomposition order. Yields nothing
    /// once the graph has been short-circuited.
    pub fn ready_nodes(&self) -> impl Iterator<Item = &SubTaskId> + '_ {
        let open = !self.short_circuited;
        self.graph
            .node_indices()
            .filter(move |_| open)
            .filter(move |&node| self.is_ready(node))
            .map(move |node| &self.graph[node].id)
    }

    pub fn is_ready_id(&self, id: &SubTaskId) -> bool {
        !self.short_circuited && self.index.get(id).is_some_and(|&node| self.is_ready(node))
    }

    /// Whether a pending sub-task can never run because a dependency failed.
    pub fn is_blocked(&self, id: &SubTaskId) -> bool {
        self.index
            .get(id)
            .is_some_and(|node| self.blocked_nodes().contains(node))
    }

    /// Dependency outputs handed to an agent alongside the sub-task.
    pub fn inputs_for(&self, id: &SubTaskId) -> Result<BTreeMap<SubTaskId, Value>> {
        let node = self.node(id)?;
        Ok(self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .filter_map(|dep| {
                let sub = &self.graph[dep];
                sub.result.clone().map(|result| (sub.id.clone(), result))
            })
            .collect())
    }

    /// Transition a ready sub-task to running.
    pub fn mark_running(&mut self, id: &SubTaskId) -> Result<()> {
        let node = self.node(id)?;
        if !self.is_ready(node) || self.short_circuited {
            return Err(self.invalid(node, SubTaskState::Running));
        }
        self.graph[node].start();
        trace!(sub_task = %id, "sub-task running");
        Ok(())
    }

    /// Transition a running sub-task to succeeded, storing its result.
    pub fn mark_succeeded(&mut self, id: &SubTaskId, result: Value) -> Result<()> {
        let node = self.expect_running(id, SubTaskState::Succeeded)?;
        self.graph[node].succeed(result);
        Ok(())
    }

    /// Transition a running sub-task to failed, storing its error.
    pub fn mark_failed(&mut self, id: &SubTaskId, error: SubTaskError) -> Result<()> {
        let node = self.expect_running(id, SubTaskState::Failed)?;
        self.graph[node].fail(error);
        Ok(())
    }

    /// Put a running sub-task back to pending for another attempt.
    pub fn requeue(&mut self, id: &SubTaskId, error: SubTaskError) -> Result<u32> {
        let node = self.expect_running(id, SubTaskState::Pending)?;
        let sub = &mut self.graph[node];
        sub.requeue(error);
        Ok(sub.retry_count)
    }

    /// Stop any further sub-task from becoming ready.
    pub fn short_circuit(&mut self) {
        self.short_circuited = true;
    }

    pub fn is_short_circuited(&self) -> bool {
        self.short_circuited
    }

    /// Check if the graph can make no further progress.
    ///
    /// True when nothing is running and every pending sub-task is either
    /// blocked by a failed dependency or cut off by a short-circuit.
    pub fn is_terminal(&self) -> bool {
        if self.graph.node_weights().any(|s| s.state == SubTaskState::Running) {
            return false;
        }
        if self.short_circuited {
            return true;
        }
        let blocked = self.blocked_nodes();
        self.graph
            .node_indices()
            .filter(|&node| self.graph[node].state == SubTaskState::Pending)
            .all(|node| blocked.contains(&node))
    }

    /// Merge the outcome of a terminal graph.
    ///
    /// Deterministic: repeated calls on the same graph return equal results.
    ///
    /// # Errors
    /// Returns `GraphNotTerminal` while the graph can still make progress.
    pub fn aggregate(&self) -> Result<TaskResult> {
        if !self.is_terminal() {
            return Err(Error::GraphNotTerminal);
        }

        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        let mut root_outputs = Vec::new();
        for &node in &self.order {
            let sub = &self.graph[node];
            match sub.state {
                SubTaskState::Succeeded => {
                    let output = sub.result.clone().unwrap_or(Value::Null);
                    if self.is_root(node) {
                        root_outputs.push((sub.id.clone(), output.clone()));
                    }
                    outputs.push(SubTaskOutput {
                        id: sub.id.clone(),
                        output,
                    });
                }
                SubTaskState::Failed => {
                    if let Some(error) = &sub.error {
                        failures.push(SubTaskFailure {
                            id: sub.id.clone(),
                            error: error.clone(),
                        });
                    }
                }
                SubTaskState::Pending | SubTaskState::Running => {}
            }
        }

        let root_reached = !root_outputs.is_empty();
        let output = match root_outputs.len() {
            0 => None,
            1 => root_outputs.pop().map(|(_, output)| output),
            _ => Some(Value::Object(
                root_outputs
                    .into_iter()
                    .map(|(id, output)| (id.0, output))
                    .collect::<Map<String, Value>>(),
            )),
        };

        Ok(TaskResult {
            output,
            outputs,
            failures,
            root_reached,
            cancelled: false,
        })
    }

    fn node(&self, id: &SubTaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownSubTask(id.clone()))
    }

    fn expect_running(&self, id: &SubTaskId, to: SubTaskState) -> Result<NodeIndex> {
        let node = self.node(id)?;
        if self.graph[node].state != SubTaskState::Running {
            return Err(self.invalid(node, to));
        }
        Ok(node)
    }

    fn invalid(&self, node: NodeIndex, to: SubTaskState) -> Error {
        let sub = &self.graph[node];
        Error::InvalidTransition {
            sub_task: sub.id.clone(),
            from: sub.state,
            to,
        }
    }

    fn is_ready(&self, node: NodeIndex) -> bool {
        self.graph[node].state == SubTaskState::Pending
            && self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .all(|dep| self.graph[dep].state == SubTaskState::Succeeded)
    }

    fn is_root(&self, node: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .next()
            .is_none()
    }

    /// Pending nodes with a failed (or itself blocked) dependency.
    fn blocked_nodes(&self) -> HashSet<NodeIndex> {
        let mut blocked = HashSet::new();
        for &node in &self.order {
            if self.graph[node].state != SubTaskState::Pending {
                continue;
            }
            let has_dead_dependency = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .any(|dep| self.graph[dep].state == SubTaskState::Failed || blocked.contains(&dep));
            if has_dead_dependency {
                blocked.insert(node);
            }
        }
        blocked
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("sub_tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .field("short_circuited", &self.short_circuited)
            .finish()
    }
}

/// Check a decomposition before anything is allocated for it.
///
/// Returns the position of every sub-task by ID.
fn validate(specs: &[SubTaskSpec]) -> Result<HashMap<SubTaskId, usize>> {
    if specs.is_empty() {
        return Err(Error::malformed("decomposition produced no sub-tasks"));
    }

    let mut positions = HashMap::with_capacity(specs.len());
    for (pos, spec) in specs.iter().enumerate() {
        if positions.insert(spec.id.clone(), pos).is_some() {
            return Err(Error::malformed(format!("duplicate sub-task id {}", spec.id)));
        }
    }

    for spec in specs {
        for dep in &spec.depends_on {
            if dep == &spec.id {
                return Err(Error::malformed(format!("sub-task {} depends on itself", spec.id)));
            }
            if !positions.contains_key(dep) {
                return Err(Error::malformed(format!(
                    "sub-task {} depends on unknown sub-task {}",
                    spec.id, dep
                )));
            }
        }
    }

    detect_cycle(specs, &positions)?;
    Ok(positions)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Depth-first walk over dependency edges; an edge into a node that is
/// still being visited closes a cycle.
fn detect_cycle(specs: &[SubTaskSpec], positions: &HashMap<SubTaskId, usize>) -> Result<()> {
    let mut marks = vec![Mark::Unvisited; specs.len()];

    for start in 0..specs.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::Visiting;
        // (node, index of the next dependency to follow)
        let mut stack = vec![(start, 0usize)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            match specs[node].depends_on.get(next) {
                Some(dep) => {
                    frame.1 += 1;
                    let Some(&dep_pos) = positions.get(dep) else {
                        continue;
                    };
                    match marks[dep_pos] {
                        Mark::Visiting => {
                            return Err(Error::malformed(format!(
                                "dependency cycle: {} depends on {}",
                                specs[node].id, dep
                            )));
                        }
                        Mark::Unvisited => {
                            marks[dep_pos] = Mark::Visiting;
                            stack.push((dep_pos, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}
