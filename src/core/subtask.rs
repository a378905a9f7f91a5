//! Sub-task data model for the task graph.
//!
//! Sub-tasks are the atomic units of work handed to agents. Each one
//! tracks its state, required capability, timing, and its result or error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a sub-task, unique within one task graph.
///
/// Identifiers come from the decomposition, so they are free-form strings
/// such as `"s1"` rather than generated UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubTaskId(pub String);

impl SubTaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubTaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubTaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named category of work an agent can perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub const CODING: &'static str = "coding";
    pub const DESIGN: &'static str = "design";
    pub const RESEARCH: &'static str = "research";
    pub const WRITING: &'static str = "writing";
    pub const UTILITY: &'static str = "utility";
    pub const DATA_PROCESSING: &'static str = "data_processing";
    pub const FORMATTING: &'static str = "formatting";
    pub const COMMUNICATION: &'static str = "communication";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sub-task state in its lifecycle.
///
/// `ready` is not stored: a pending sub-task whose dependencies have all
/// succeeded is ready by definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SubTaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SubTaskState::Succeeded | SubTaskState::Failed)
    }
}

impl std::fmt::Display for SubTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubTaskState::Pending => write!(f, "pending"),
            SubTaskState::Running => write!(f, "running"),
            SubTaskState::Succeeded => write!(f, "succeeded"),
            SubTaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a sub-task execution did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskErrorKind {
    /// The agent did not finish before its deadline.
    AgentTimeout,
    /// The agent reported an error (or panicked).
    AgentFailed,
    /// No agent is registered for the required capability.
    NoEligibleAgent,
    /// The owning task was cancelled while the execution was running.
    Cancelled,
}

impl std::fmt::Display for SubTaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubTaskErrorKind::AgentTimeout => write!(f, "agent_timeout"),
            SubTaskErrorKind::AgentFailed => write!(f, "agent_failed"),
            SubTaskErrorKind::NoEligibleAgent => write!(f, "no_eligible_agent"),
            SubTaskErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error payload recorded on a failed sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskError {
    pub kind: SubTaskErrorKind,
    pub message: String,
    /// The agent asked for the failure not to be retried.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,
}

impl SubTaskError {
    pub fn new(kind: SubTaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            SubTaskErrorKind::AgentTimeout,
            format!("agent did not finish within {:?}", after),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(SubTaskErrorKind::Cancelled, "task was cancelled")
    }

    pub fn no_eligible_agent(capability: &str) -> Self {
        Self::new(
            SubTaskErrorKind::NoEligibleAgent,
            format!("no agent registered for capability '{}'", capability),
        )
    }

    /// Whether the orchestrator may try this sub-task again.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            SubTaskErrorKind::AgentTimeout => true,
            SubTaskErrorKind::AgentFailed => !self.fatal,
            SubTaskErrorKind::NoEligibleAgent | SubTaskErrorKind::Cancelled => false,
        }
    }
}

impl std::fmt::Display for SubTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A single node of a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: SubTaskId,
    pub description: String,
    /// Sub-tasks that must succeed before this one is ready, in declaration order.
    pub depends_on: Vec<SubTaskId>,
    /// Required capability; `None` accepts any agent.
    pub capability: Option<Capability>,
    /// Moved only by the task graph; read through [`SubTask::state`].
    pub(crate) state: SubTaskState,
    /// Present only when the sub-task succeeded.
    pub result: Option<Value>,
    /// Present only when the sub-task failed.
    pub error: Option<SubTaskError>,
    pub retry_count: u32,
    /// The error that caused the most recent retry.
    pub last_error: Option<SubTaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    pub fn new(
        id: SubTaskId,
        description: &str,
        depends_on: Vec<SubTaskId>,
        capability: Option<Capability>,
    ) -> Self {
        Self {
            id,
            description: description.to_string(),
            depends_on,
            capability,
            state: SubTaskState::Pending,
            result: None,
            error: None,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn state(&self) -> SubTaskState {
        self.state
    }

    pub(crate) fn start(&mut self) {
        self.state = SubTaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn succeed(&mut self, result: Value) {
        self.state = SubTaskState::Succeeded;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: SubTaskError) {
        self.state = SubTaskState::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn requeue(&mut self, error: SubTaskError) {
        self.state = SubTaskState::Pending;
        self.retry_count += 1;
        self.last_error = Some(error);
        self.started_at = None;
    }

    /// Capability label used for routing and display.
    pub fn capability_label(&self) -> &str {
        self.capability.as_ref().map(|c| c.as_str()).unwrap_or("any")
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}
