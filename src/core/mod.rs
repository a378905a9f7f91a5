//! Core domain models for weeki orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, sub-tasks, and the task graph.

pub mod dag;
pub mod subtask;
pub mod task;

pub use dag::{Decomposition, SubTaskSpec, TaskGraph};
pub use subtask::{Capability, SubTask, SubTaskError, SubTaskErrorKind, SubTaskId, SubTaskState};
pub use task::{
    Directive, SubTaskFailure, SubTaskOutput, Task, TaskError, TaskErrorKind, TaskId, TaskResult,
    TaskState,
};
