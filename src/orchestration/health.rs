//! Liveness report for the orchestration core.
//!
//! The report answers two questions: can the pool take another sub-task
//! right now, and are the scheduling loops alive. Task counts per state are
//! included for monitoring.

use crate::orchestration::registry::TaskStats;
use serde::{Deserialize, Serialize};

/// Crate version reported by the health probe.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Point-in-time health of an orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Loops are live and the orchestrator still accepts directives.
    ///
    /// A saturated pool is not unhealthy.
    pub healthy: bool,
    pub version: String,
    pub pool_capacity: usize,
    pub free_slots: usize,
    pub has_free_slot: bool,
    /// No scheduling loop has died without finishing its task.
    pub loops_live: bool,
    /// Scheduling loops currently running.
    pub active_loops: usize,
    pub tasks: TaskStats,
}

impl HealthReport {
    pub(crate) fn new(
        accepting: bool,
        pool_capacity: usize,
        free_slots: usize,
        loops_live: bool,
        active_loops: usize,
        tasks: TaskStats,
    ) -> Self {
        Self {
            healthy: accepting && loops_live,
            version: VERSION.to_string(),
            pool_capacity,
            free_slots,
            has_free_slot: free_slots > 0,
            loops_live,
            active_loops,
            tasks,
        }
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} | slots {}/{} free | {} loop(s) | {} task(s), {} active",
            if self.healthy { "healthy" } else { "unhealthy" },
            self.free_slots,
            self.pool_capacity,
            self.active_loops,
            self.tasks.total,
            self.tasks.active(),
        )
    }
}
