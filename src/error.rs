use thiserror::Error;

use crate::core::{SubTaskId, SubTaskState, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    #[error("Malformed task graph: {reason}")]
    MalformedGraph { reason: String },

    #[error("Invalid transition for sub-task {sub_task} from {from} to {to}")]
    InvalidTransition {
        sub_task: SubTaskId,
        from: SubTaskState,
        to: SubTaskState,
    },

    #[error("Sub-task not found in graph: {0}")]
    UnknownSubTask(SubTaskId),

    #[error("Task graph is not terminal yet")]
    GraphNotTerminal,

    #[error("No eligible agent for capability: {capability}")]
    NoEligibleAgent { capability: String },

    #[error("Decomposition failed: {0}")]
    DecompositionFailed(String),

    #[error("Agent pool is saturated (capacity: {capacity})")]
    PoolSaturated { capacity: usize },

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Build a `MalformedGraph` error from any displayable reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedGraph {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
