//! Agent pool for bounded concurrent execution.
//!
//! The `AgentPool` owns a fixed number of slots shared by every task. A
//! fair semaphore admits executions first-come-first-served; each admitted
//! execution is bound to one slot, runs its agent under a deadline, and
//! frees the slot on every exit path before its outcome is delivered.

use crate::agent::{AgentInput, AgentRegistry};
use crate::core::{Capability, SubTaskError, SubTaskErrorKind, SubTaskId, TaskId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 256;

/// Events emitted by the agent pool for slot activity.
///
/// These events allow external components to react to executions
/// without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// An agent started working on a sub-task.
    Started {
        slot: usize,
        task_id: TaskId,
        sub_task_id: SubTaskId,
        agent_id: String,
    },
    /// The agent returned, successfully or with an error.
    Finished {
        slot: usize,
        task_id: TaskId,
        sub_task_id: SubTaskId,
        succeeded: bool,
    },
    /// The agent missed its deadline and was dropped.
    TimedOut {
        slot: usize,
        task_id: TaskId,
        sub_task_id: SubTaskId,
        after: Duration,
    },
    /// The execution was cancelled with its task.
    Cancelled {
        slot: usize,
        task_id: TaskId,
        sub_task_id: SubTaskId,
    },
}

/// Copy of an occupied slot for observers.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub task_id: TaskId,
    pub sub_task_id: SubTaskId,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    /// Time left before the deadline.
    pub remaining: Duration,
}

#[derive(Debug, Clone)]
struct Occupancy {
    task_id: TaskId,
    sub_task_id: SubTaskId,
    agent_id: String,
    started_at: DateTime<Utc>,
    deadline: Instant,
}

struct Shared {
    slots: Mutex<Vec<Option<Occupancy>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    events: broadcast::Sender<PoolEvent>,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Option<Occupancy>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn occupy(&self, occupancy: Occupancy) -> Option<usize> {
        let mut slots = self.slots();
        let slot = slots.iter().position(Option::is_none)?;
        slots[slot] = Some(occupancy);
        drop(slots);

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        Some(slot)
    }

    fn vacate(&self, slot: usize) {
        if let Some(entry) = self.slots().get_mut(slot) {
            *entry = None;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Reserved pool capacity, not yet bound to a slot.
///
/// Dropping it returns the capacity to the pool.
#[derive(Debug)]
pub struct SlotPermit {
    permit: OwnedSemaphorePermit,
}

/// Frees its slot when dropped, then returns the permit.
struct SlotGuard {
    shared: Arc<Shared>,
    slot: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.vacate(self.slot);
        debug!(slot = self.slot, "slot released");
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub sub_task_id: SubTaskId,
    pub agent_id: String,
    pub slot: usize,
    pub outcome: std::result::Result<Value, SubTaskError>,
}

/// Handle to an admitted execution.
#[derive(Debug)]
pub struct PendingExecution {
    task_id: TaskId,
    sub_task_id: SubTaskId,
    agent_id: String,
    slot: usize,
    cancel: CancellationToken,
    rx: oneshot::Receiver<std::result::Result<Value, SubTaskError>>,
}

impl PendingExecution {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn sub_task_id(&self) -> &SubTaskId {
        &self.sub_task_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Cancel just this execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the execution to resolve.
    ///
    /// The slot is already free when this returns.
    pub async fn wait(self) -> ExecutionReport {
        let outcome = self.rx.await.unwrap_or_else(|_| {
            Err(SubTaskError::new(
                SubTaskErrorKind::AgentFailed,
                "agent execution aborted",
            ))
        });
        ExecutionReport {
            task_id: self.task_id,
            sub_task_id: self.sub_task_id,
            agent_id: self.agent_id,
            slot: self.slot,
            outcome,
        }
    }
}

/// Manages the global set of agent slots.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use weeki::agent::AgentRegistry;
/// use weeki::orchestration::AgentPool;
///
/// let pool = AgentPool::new(3, Arc::new(AgentRegistry::new()));
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct AgentPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    shared: Arc<Shared>,
    agents: Arc<AgentRegistry>,
}

impl AgentPool {
    /// Create a pool with `capacity` slots dispatching to `agents`.
    pub fn new(capacity: usize, agents: Arc<AgentRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            shared: Arc::new(Shared {
                slots: Mutex::new(vec![None; capacity]),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                events,
            }),
            agents,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots not reserved or occupied.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn has_capacity(&self) -> bool {
        self.available() > 0
    }

    /// Executions currently bound to a slot.
    pub fn active_count(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Most executions ever bound at the same time.
    pub fn high_water_mark(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of occupied slots.
    pub fn occupied(&self) -> Vec<SlotSnapshot> {
        let now = Instant::now();
        self.shared
            .slots()
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().map(|o| SlotSnapshot {
                    slot,
                    task_id: o.task_id,
                    sub_task_id: o.sub_task_id.clone(),
                    agent_id: o.agent_id.clone(),
                    started_at: o.started_at,
                    remaining: o.deadline.saturating_duration_since(now),
                })
            })
            .collect()
    }

    /// Reserve a slot without waiting.
    ///
    /// # Errors
    /// `PoolSaturated` when every slot is taken, `ShuttingDown` after `close()`.
    pub fn try_reserve(&self) -> Result<SlotPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(SlotPermit { permit }),
            Err(TryAcquireError::NoPermits) => Err(Error::PoolSaturated {
                capacity: self.capacity,
            }),
            Err(TryAcquireError::Closed) => Err(Error::ShuttingDown),
        }
    }

    /// Wait for a slot. Waiters are served in arrival order.
    ///
    /// Cancel safe: dropping the future gives up the place in line.
    pub async fn reserve(&self) -> Result<SlotPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;
        Ok(SlotPermit { permit })
    }

    /// Admit a sub-task if a slot is free right now.
    pub fn try_submit(
        &self,
        input: AgentInput,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PendingExecution> {
        self.check_eligible(input.capability.as_ref())?;
        let permit = self.try_reserve()?;
        self.execute(permit, input, timeout, cancel)
    }

    /// Admit a sub-task, waiting for a slot if necessary.
    pub async fn submit(
        &self,
        input: AgentInput,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PendingExecution> {
        self.check_eligible(input.capability.as_ref())?;
        let permit = self.reserve().await?;
        self.execute(permit, input, timeout, cancel)
    }

    /// Start a sub-task on reserved capacity.
    ///
    /// The agent is chosen round-robin among those registered for the
    /// sub-task's capability. If none is eligible the permit is returned
    /// and `NoEligibleAgent` is reported.
    pub fn execute(
        &self,
        permit: SlotPermit,
        input: AgentInput,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PendingExecution> {
        let agent = self.agents.select(input.capability.as_ref())?;
        let agent_id = agent.id().to_string();
        let task_id = input.task_id;
        let sub_task_id = input.sub_task_id.clone();

        let slot = self
            .shared
            .occupy(Occupancy {
                task_id,
                sub_task_id: sub_task_id.clone(),
                agent_id: agent_id.clone(),
                started_at: Utc::now(),
                deadline: deadline_after(Instant::now(), timeout),
            })
            .ok_or(Error::PoolSaturated {
                capacity: self.capacity,
            })?;
        let guard = SlotGuard {
            shared: Arc::clone(&self.shared),
            slot,
            _permit: permit.permit,
        };

        debug!(
            task = %task_id.short(),
            sub_task = %sub_task_id,
            agent = %agent_id,
            slot,
            "execution admitted"
        );
        self.shared.emit(PoolEvent::Started {
            slot,
            task_id,
            sub_task_id: sub_task_id.clone(),
            agent_id: agent_id.clone(),
        });

        let (tx, rx) = oneshot::channel();
        let exec_cancel = cancel.clone();
        let event_sub_task = sub_task_id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = exec_cancel.cancelled() => Err(SubTaskError::cancelled()),
                result = tokio::time::timeout(timeout, agent.execute(input)) => match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(SubTaskError::from(err)),
                    Err(_) => Err(SubTaskError::timeout(timeout)),
                },
            };

            let shared = Arc::clone(&guard.shared);
            drop(guard);

            let event = match &outcome {
                Ok(_) => PoolEvent::Finished {
                    slot,
                    task_id,
                    sub_task_id: event_sub_task,
                    succeeded: true,
                },
                Err(err) if err.kind == SubTaskErrorKind::AgentTimeout => {
                    warn!(task = %task_id.short(), sub_task = %event_sub_task, ?timeout, "agent timed out");
                    PoolEvent::TimedOut {
                        slot,
                        task_id,
                        sub_task_id: event_sub_task,
                        after: timeout,
                    }
                }
                Err(err) if err.kind == SubTaskErrorKind::Cancelled => PoolEvent::Cancelled {
                    slot,
                    task_id,
                    sub_task_id: event_sub_task,
                },
                Err(_) => PoolEvent::Finished {
                    slot,
                    task_id,
                    sub_task_id: event_sub_task,
                    succeeded: false,
                },
            };
            shared.emit(event);
            let _ = tx.send(outcome);
        });

        Ok(PendingExecution {
            task_id,
            sub_task_id,
            agent_id,
            slot,
            cancel,
            rx,
        })
    }

    /// Refuse all further admissions. Running executions are unaffected.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn check_eligible(&self, capability: Option<&Capability>) -> Result<()> {
        let eligible = match capability {
            Some(cap) => self.agents.has_capability(cap),
            None => !self.agents.is_empty(),
        };
        if eligible {
            Ok(())
        } else {
            Err(Error::NoEligibleAgent {
                capability: capability
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "any".to_string()),
            })
        }
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
