//! Process-wide registry of task records.
//!
//! Records are created when a directive is accepted and are updated in
//! place by the task's scheduling loop. Every record sits behind its own
//! lock so readers of one task never wait on the writer of another.

use crate::core::{
    Capability, SubTask, SubTaskError, SubTaskId, SubTaskState, Task, TaskError, TaskId,
    TaskResult, TaskState,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Status of one sub-task as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskStatus {
    pub id: SubTaskId,
    pub state: SubTaskState,
    pub capability: Option<Capability>,
    pub retry_count: u32,
    /// Pending forever because a dependency failed.
    pub blocked: bool,
    pub error: Option<SubTaskError>,
}

/// Status of one task as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub directive: String,
    pub state: TaskState,
    pub sub_tasks: Vec<SubTaskStatus>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn from_task(task: &Task) -> Self {
        let blocked = blocked_ids(&task.sub_tasks);
        Self {
            id: task.id,
            directive: task.directive.text.clone(),
            state: task.state(),
            sub_tasks: task
                .sub_tasks
                .iter()
                .map(|sub| SubTaskStatus {
                    id: sub.id.clone(),
                    state: sub.state,
                    capability: sub.capability.clone(),
                    retry_count: sub.retry_count,
                    blocked: blocked.contains(&sub.id),
                    error: sub.error.clone(),
                })
                .collect(),
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// One page of the task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<TaskStatus>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Task counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub decomposing: usize,
    pub scheduling: usize,
    pub succeeded: usize,
    pub partially_failed: usize,
    pub failed: usize,
}

impl TaskStats {
    /// Tasks that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.pending + self.decomposing + self.scheduling
    }
}

type Record = Arc<RwLock<Task>>;

/// Map of task id to task record.
#[derive(Default)]
pub struct TaskRegistry {
    records: RwLock<HashMap<TaskId, Record>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task record, replacing any record with the same id.
    pub fn insert(&self, task: Task) {
        let id = task.id;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(RwLock::new(task)));
    }

    /// Apply a change to one record under its write lock.
    pub fn update<F, R>(&self, id: &TaskId, change: F) -> Result<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let record = self.record(id)?;
        let mut task = record.write().unwrap_or_else(PoisonError::into_inner);
        Ok(change(&mut task))
    }

    /// Current status of a task.
    ///
    /// # Errors
    /// Returns `NotFound` for ids that were never accepted or were removed.
    pub fn get(&self, id: &TaskId) -> Result<TaskStatus> {
        let record = self.record(id)?;
        let task = record.read().unwrap_or_else(PoisonError::into_inner);
        Ok(TaskStatus::from_task(&task))
    }

    /// Full copy of a task record.
    pub fn task(&self, id: &TaskId) -> Result<Task> {
        let record = self.record(id)?;
        let task = record.read().unwrap_or_else(PoisonError::into_inner);
        Ok(task.clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Tasks newest first, `per_page` at a time. Pages start at 1.
    pub fn list(&self, page: usize, per_page: usize) -> TaskPage {
        let page = page.max(1);
        let per_page = per_page.max(1);

        let mut tasks: Vec<TaskStatus> = self
            .records()
            .iter()
            .map(|record| {
                let task = record.read().unwrap_or_else(PoisonError::into_inner);
                TaskStatus::from_task(&task)
            })
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = tasks.len();
        let tasks = tasks
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        TaskPage {
            tasks,
            total,
            page,
            per_page,
        }
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for record in self.records() {
            let state = record.read().unwrap_or_else(PoisonError::into_inner).state();
            stats.total += 1;
            match state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Decomposing => stats.decomposing += 1,
                TaskState::Scheduling => stats.scheduling += 1,
                TaskState::Succeeded => stats.succeeded += 1,
                TaskState::PartiallyFailed => stats.partially_failed += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop a task record.
    pub fn remove(&self, id: &TaskId) -> Result<Task> {
        let record = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or(Error::NotFound(*id))?;
        let task = record.read().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(task)
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, id: &TaskId) -> Result<Record> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(Error::NotFound(*id))
    }

    /// Clone the record handles so the outer lock is released before any
    /// record is read.
    fn records(&self) -> Vec<Record> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

/// Pending sub-tasks with a failed or blocked dependency.
fn blocked_ids(sub_tasks: &[SubTask]) -> HashSet<SubTaskId> {
    let states: HashMap<&SubTaskId, SubTaskState> =
        sub_tasks.iter().map(|s| (&s.id, s.state)).collect();
    let mut blocked = HashSet::new();
    loop {
        let before = blocked.len();
        for sub in sub_tasks {
            if sub.state != SubTaskState::Pending || blocked.contains(&sub.id) {
                continue;
            }
            let stuck = sub.depends_on.iter().any(|dep| {
                states.get(dep) == Some(&SubTaskState::Failed) || blocked.contains(dep)
            });
            if stuck {
                blocked.insert(sub.id.clone());
            }
        }
        if blocked.len() == before {
            return blocked;
        }
    }
}
