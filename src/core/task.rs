//! Task data model: the root aggregate for one directive.
//!
//! A task owns the directive, a snapshot of its sub-tasks, and the final
//! result. Its state is never written directly: it moves forward only
//! through the lifecycle methods below, and the terminal state is derived
//! from the aggregated sub-task outcome.

use crate::core::subtask::{SubTask, SubTaskError, SubTaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The caller's instruction, immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Natural-language instruction.
    pub text: String,
    /// Optional structured context supplied alongside the text.
    #[serde(default)]
    pub context: Value,
}

impl Directive {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

impl From<&str> for Directive {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Directive {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Task state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, graph not built yet.
    Pending,
    /// Waiting on the decomposition function.
    Decomposing,
    /// Graph built, scheduling loop running.
    Scheduling,
    /// Every sub-task succeeded.
    Succeeded,
    /// At least one root succeeded and at least one sub-task failed.
    PartiallyFailed,
    /// No root succeeded, the task was cancelled, or it never got a graph.
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::PartiallyFailed | TaskState::Failed
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Decomposing => write!(f, "decomposing"),
            TaskState::Scheduling => write!(f, "scheduling"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::PartiallyFailed => write!(f, "partially_failed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Output of one succeeded sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskOutput {
    pub id: SubTaskId,
    pub output: Value,
}

/// Error of one permanently failed sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskFailure {
    pub id: SubTaskId,
    pub error: SubTaskError,
}

/// Aggregated outcome of a terminal task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Directive-level output: the payload of the single succeeded root, or
    /// an object keyed by root id when several roots succeeded.
    pub output: Option<Value>,
    /// Every succeeded sub-task output, in dependency order.
    pub outputs: Vec<SubTaskOutput>,
    /// Every permanently failed sub-task, in dependency order.
    pub failures: Vec<SubTaskFailure>,
    /// Whether at least one root sub-task succeeded.
    pub root_reached: bool,
    /// The task was cancelled before it could finish.
    #[serde(default)]
    pub cancelled: bool,
}

impl TaskResult {
    /// Terminal task state implied by this outcome.
    pub fn state(&self) -> TaskState {
        if self.cancelled || !self.root_reached {
            TaskState::Failed
        } else if self.failures.is_empty() {
            TaskState::Succeeded
        } else {
            TaskState::PartiallyFailed
        }
    }

    pub fn is_success(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    /// Identifiers of the failed sub-tasks.
    pub fn failed_ids(&self) -> Vec<&SubTaskId> {
        self.failures.iter().map(|f| &f.id).collect()
    }
}

/// Why a task failed before or outside of scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    DecompositionFailed,
    MalformedGraph,
    /// A contract violation inside the scheduling loop.
    Internal,
}

/// Task-level failure recorded when the loop could not run to aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A directive and everything the core knows about its execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub directive: Directive,
    state: TaskState,
    /// Snapshot of the graph's sub-tasks, in decomposition order.
    pub sub_tasks: Vec<SubTask>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task for an accepted directive.
    pub fn new(id: TaskId, directive: Directive) -> Self {
        let now = Utc::now();
        Self {
            id,
            directive,
            state: TaskState::Pending,
            sub_tasks: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn begin_decomposition(&mut self) {
        self.state = TaskState::Decomposing;
        self.touch();
    }

    /// Record the sub-tasks of a freshly built graph and enter scheduling.
    pub(crate) fn begin_scheduling(&mut self, sub_tasks: Vec<SubTask>) {
        self.state = TaskState::Scheduling;
        self.sub_tasks = sub_tasks;
        self.touch();
    }

    pub(crate) fn sync_sub_tasks(&mut self, sub_tasks: Vec<SubTask>) {
        self.sub_tasks = sub_tasks;
        self.touch();
    }

    /// Record the aggregated outcome; the terminal state follows from it.
    pub(crate) fn finish(&mut self, sub_tasks: Vec<SubTask>, result: TaskResult) {
        self.state = result.state();
        self.sub_tasks = sub_tasks;
        self.result = Some(result);
        self.touch();
    }

    /// Fail the task without a graph outcome. Any partial graph is dropped.
    pub(crate) fn abort(&mut self, error: TaskError) {
        self.state = TaskState::Failed;
        self.sub_tasks.clear();
        self.error = Some(error);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
