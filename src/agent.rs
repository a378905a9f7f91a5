//! Agents and capability-based agent selection.
//!
//! An [`Agent`] performs the work of one sub-task. Agents advertise
//! capability tags; the [`AgentRegistry`] maps each tag to the agents that
//! carry it and hands them out round-robin.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::{Capability, SubTaskError, SubTaskErrorKind, SubTaskId, TaskId};
use crate::{Error, Result};

/// Everything an agent receives for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub task_id: TaskId,
    pub sub_task_id: SubTaskId,
    pub description: String,
    pub capability: Option<Capability>,
    /// Text of the directive the sub-task was derived from.
    pub directive: String,
    /// Structured context supplied with the directive.
    pub context: Value,
    /// Outputs of the sub-tasks this one depends on.
    pub dependency_outputs: BTreeMap<SubTaskId, Value>,
}

/// Failure reported by an agent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    /// Retrying would not help; the orchestrator gives up immediately.
    pub fatal: bool,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<AgentError> for SubTaskError {
    fn from(err: AgentError) -> Self {
        let mut error = SubTaskError::new(SubTaskErrorKind::AgentFailed, err.message);
        error.fatal = err.fatal;
        error
    }
}

/// A capability unit that executes sub-tasks.
///
/// `execute()` may be dropped at any await point when its deadline passes
/// or the owning task is cancelled.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier, used in logs and slot snapshots.
    fn id(&self) -> &str;

    /// Capability tags this agent accepts work for.
    fn capabilities(&self) -> &[Capability];

    async fn execute(&self, input: AgentInput) -> std::result::Result<Value, AgentError>;
}

struct Eligible {
    members: Vec<usize>,
    cursor: AtomicUsize,
}

/// Registry mapping capability tags to agents.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    by_capability: HashMap<Capability, Eligible>,
    any_cursor: AtomicUsize,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled specialist and utility agents.
    pub fn with_builtin_agents(delay: Duration) -> Self {
        let mut registry = Self::new();
        for domain in [
            Capability::CODING,
            Capability::DESIGN,
            Capability::RESEARCH,
            Capability::WRITING,
        ] {
            registry.register(Arc::new(SpecialistAgent::new(domain, delay)));
        }
        for specialty in [
            Capability::DATA_PROCESSING,
            Capability::FORMATTING,
            Capability::COMMUNICATION,
        ] {
            registry.register(Arc::new(UtilityAgent::new(specialty, delay)));
        }
        registry
    }

    /// Add an agent under every capability it advertises.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let position = self.agents.len();
        for capability in agent.capabilities() {
            let eligible = self
                .by_capability
                .entry(capability.clone())
                .or_insert_with(|| Eligible {
                    members: Vec::new(),
                    cursor: AtomicUsize::new(0),
                });
            if !eligible.members.contains(&position) {
                eligible.members.push(position);
            }
        }
        debug!(agent = agent.id(), capabilities = ?agent.capabilities(), "agent registered");
        self.agents.push(agent);
    }

    /// Pick the next agent for a capability, round-robin.
    ///
    /// `None` accepts any registered agent.
    ///
    /// # Errors
    /// Returns `NoEligibleAgent` if nothing is registered for the capability.
    pub fn select(&self, capability: Option<&Capability>) -> Result<Arc<dyn Agent>> {
        let (members, cursor): (&[usize], &AtomicUsize) = match capability {
            Some(cap) => match self.by_capability.get(cap) {
                Some(eligible) if !eligible.members.is_empty() => {
                    (eligible.members.as_slice(), &eligible.cursor)
                }
                _ => {
                    return Err(Error::NoEligibleAgent {
                        capability: cap.to_string(),
                    })
                }
            },
            None => {
                if self.agents.is_empty() {
                    return Err(Error::NoEligibleAgent {
                        capability: "any".to_string(),
                    });
                }
                let turn = self.any_cursor.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&self.agents[turn % self.agents.len()]));
            }
        };
        let turn = cursor.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.agents[members[turn % members.len()]]))
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.by_capability
            .get(capability)
            .is_some_and(|e| !e.members.is_empty())
    }

    /// Registered capability tags, sorted.
    pub fn capabilities(&self) -> Vec<&Capability> {
        let mut caps: Vec<&Capability> = self.by_capability.keys().collect();
        caps.sort();
        caps
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.len())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Domain specialist (coding, design, research, writing).
pub struct SpecialistAgent {
    id: String,
    domain: String,
    capabilities: Vec<Capability>,
    delay: Duration,
}

impl SpecialistAgent {
    pub fn new(domain: &str, delay: Duration) -> Self {
        Self {
            id: format!("specialist_{}", domain),
            domain: domain.to_string(),
            capabilities: vec![Capability::from(domain)],
            delay,
        }
    }
}

#[async_trait]
impl Agent for SpecialistAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(&self, input: AgentInput) -> std::result::Result<Value, AgentError> {
        debug!(agent = %self.id, sub_task = %input.sub_task_id, "specialist processing");
        tokio::time::sleep(self.delay).await;
        Ok(json!({
            "processed_by": self.id,
            "domain": self.domain,
            "message": format!("Specialist task completed in domain: {}", self.domain),
            "analysis": format!("Domain-specific analysis for: {}", input.description),
            "recommendations": ["recommendation_1", "recommendation_2"],
            "inputs": input.dependency_outputs.keys().collect::<Vec<_>>(),
        }))
    }
}

/// Routine-work agent; also answers the generic `utility` capability.
pub struct UtilityAgent {
    id: String,
    specialty: String,
    capabilities: Vec<Capability>,
    delay: Duration,
}

impl UtilityAgent {
    pub fn new(specialty: &str, delay: Duration) -> Self {
        Self {
            id: format!("utility_{}", specialty),
            specialty: specialty.to_string(),
            capabilities: vec![
                Capability::from(specialty),
                Capability::from(Capability::UTILITY),
            ],
            delay,
        }
    }
}

#[async_trait]
impl Agent for UtilityAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(&self, input: AgentInput) -> std::result::Result<Value, AgentError> {
        debug!(agent = %self.id, sub_task = %input.sub_task_id, "utility processing");
        tokio::time::sleep(self.delay).await;
        Ok(json!({
            "processed_by": self.id,
            "specialty": self.specialty,
            "message": format!("Utility task processed by {} agent", self.specialty),
            "original_directive": input.description,
            "inputs": input.dependency_outputs.keys().collect::<Vec<_>>(),
        }))
    }
}
