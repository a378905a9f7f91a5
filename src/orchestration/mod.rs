//! Orchestration layer for weeki.
//!
//! This module turns directives into finished tasks: decomposition into a
//! task graph, a bounded pool of agent slots shared by all tasks, one
//! scheduling loop per task, the task registry, and the health probe.

mod decompose;
mod health;
mod pool;
mod registry;
mod scheduler;

pub use decompose::{Decomposer, KeywordDecomposer};
pub use health::{HealthReport, VERSION};
pub use pool::{AgentPool, ExecutionReport, PendingExecution, PoolEvent, SlotPermit, SlotSnapshot};
pub use registry::{SubTaskStatus, TaskPage, TaskRegistry, TaskStats, TaskStatus};
pub use scheduler::{Orchestrator, SchedulerSettings};
