pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, TaskRegistry, TaskStatus};
