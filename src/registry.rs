//! Prompts, tools, agents, and models with versioning.
//!
//! A `RwLock`-guarded set of maps, one per entity kind, each with CRUD
//! methods and a routing lookup, plus `PromptAssignment` resolution by
//! task class.

use crate::types::{
    AgentEntry, EntityStatus, ModelEntry, PromptAssignment, PromptEntry, Stage, SuccessMetrics,
    TaskClass, ToolEntry,
};
use log::{info, warn};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub enum RegistryError {
    PromptUnresolved { stage: Stage, component_role: String },
    NoModelAvailable { task_class: TaskClass },
    InvalidTransition { from: EntityStatus, to: EntityStatus },
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::PromptUnresolved { stage, component_role } => write!(
                f,
                "no prompt assignment for stage={stage:?} component_role={component_role}"
            ),
            RegistryError::NoModelAvailable { task_class } => {
                write!(f, "no healthy model available for task class {task_class:?}")
            }
            RegistryError::InvalidTransition { from, to } => {
                write!(f, "invalid entity status transition {from:?} -> {to:?}")
            }
            RegistryError::NotFound(id) => write!(f, "registry entry not found: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Hints narrowing prompt resolution to a non-default scope. Resolution
/// order is experiment scope -> agent scope -> component default ->
/// documented fallback.
#[derive(Debug, Clone, Default)]
pub struct ScopeHints {
    pub experiment: Option<String>,
    pub agent_id: Option<String>,
    pub legacy_exempt: bool,
}

/// Which task classes route to which model family.
fn model_family_for(task_class: TaskClass) -> &'static str {
    match task_class {
        TaskClass::Reasoning | TaskClass::Planning | TaskClass::GeneralChat => "reasoning",
        TaskClass::CodeGeneration | TaskClass::CodeAnalysis => "coding",
    }
}

/// Transitions out of a terminal status (`Deprecated`) are rejected; every
/// other transition is allowed.
fn validate_status_transition(from: EntityStatus, to: EntityStatus) -> Result<(), RegistryError> {
    if from == EntityStatus::Deprecated && to != EntityStatus::Deprecated {
        return Err(RegistryError::InvalidTransition { from, to });
    }
    Ok(())
}

struct RegistryState {
    prompts: HashMap<String, PromptEntry>,
    assignments: Vec<PromptAssignment>,
    agents: HashMap<String, AgentEntry>,
    tools: HashMap<String, ToolEntry>,
    models: HashMap<String, ModelEntry>,
}

/// Versioned registry of prompts/agents/tools/models plus prompt
/// assignment resolution. Copy-on-write in spirit: writers replace whole
/// entries rather than mutating fields in place, so readers never observe
/// a torn update.
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                prompts: HashMap::new(),
                assignments: Vec::new(),
                agents: HashMap::new(),
                tools: HashMap::new(),
                models: HashMap::new(),
            }),
        }
    }

    pub async fn register_prompt(&self, prompt: PromptEntry) {
        let mut state = self.state.write().await;
        info!("registered prompt {} v{}", prompt.prompt_id, prompt.version);
        state.prompts.insert(prompt.prompt_id.clone(), prompt);
    }

    pub async fn register_assignment(&self, assignment: PromptAssignment) {
        self.state.write().await.assignments.push(assignment);
    }

    pub async fn register_agent(&self, agent: AgentEntry) {
        self.state.write().await.agents.insert(agent.agent_id.clone(), agent);
    }

    pub async fn register_tool(&self, tool: ToolEntry) {
        self.state.write().await.tools.insert(tool.tool_id.clone(), tool);
    }

    pub async fn register_model(&self, model: ModelEntry) {
        self.state.write().await.models.insert(model.model_id.clone(), model);
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentEntry> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    pub async fn tool(&self, tool_id: &str) -> Option<ToolEntry> {
        self.state.read().await.tools.get(tool_id).cloned()
    }

    /// Record an agent outcome, updating its trust/latency metrics.
    pub async fn record_agent_outcome(&self, agent_id: &str, success: bool, latency_ms: f64) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.metrics.record(success, latency_ms);
        }
    }

    /// Record a prompt outcome, updating its success/failure counts and
    /// moving-average latency.
    pub async fn record_prompt_outcome(&self, prompt_id: &str, success: bool, latency_ms: f64) {
        let mut state = self.state.write().await;
        if let Some(prompt) = state.prompts.get_mut(prompt_id) {
            prompt.metrics.record(success, latency_ms);
        }
    }

    pub async fn prompt_metrics(&self, prompt_id: &str) -> Option<SuccessMetrics> {
        self.state.read().await.prompts.get(prompt_id).map(|p| p.metrics.clone())
    }

    pub async fn set_agent_status(
        &self,
        agent_id: &str,
        status: EntityStatus,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        validate_status_transition(agent.status, status)?;
        agent.status = status;
        Ok(())
    }

    /// Resolve `(stage, component_role, scope_hints)` to `(prompt_id,
    /// prompt_version, body)` following the documented precedence:
    /// experiment scope -> agent scope -> component default -> fallback.
    /// Missing resolution is a hard error unless `legacy_exempt` is set.
    pub async fn resolve_prompt(
        &self,
        stage: Stage,
        component_role: &str,
        hints: &ScopeHints,
    ) -> Result<(String, u32, String), RegistryError> {
        let state = self.state.read().await;

        let matches = |scope: Option<&str>| -> Option<&PromptAssignment> {
            state.assignments.iter().find(|a| {
                a.stage as u8 == stage as u8
                    && a.component_role == component_role
                    && a.scope.as_deref() == scope
            })
        };

        let resolved = hints
            .experiment
            .as_deref()
            .and_then(|s| matches(Some(s)))
            .or_else(|| hints.agent_id.as_deref().and_then(|s| matches(Some(s))))
            .or_else(|| matches(None));

        let assignment = match resolved {
            Some(a) => a,
            None => {
                if hints.legacy_exempt {
                    warn!(
                        "prompt unresolved for stage={stage:?} role={component_role}, \
                         proceeding under legacy-exempt marker"
                    );
                    return Ok((String::new(), 0, String::new()));
                }
                return Err(RegistryError::PromptUnresolved {
                    stage,
                    component_role: component_role.to_string(),
                });
            }
        };

        let body = state
            .prompts
            .get(&assignment.prompt_id)
            .map(|p| p.body.clone())
            .unwrap_or_default();

        Ok((assignment.prompt_id.clone(), assignment.prompt_version, body))
    }

    /// Deterministic model selection: map task class to a model family,
    /// then pick the highest-priority healthy model in that family,
    /// tie-broken by lowest moving-average latency ("last-healthy check"
    /// proxy). Falls back to any healthy model if the family is empty.
    pub async fn select_model(&self, task_class: TaskClass) -> Result<ModelEntry, RegistryError> {
        let state = self.state.read().await;
        let family = model_family_for(task_class);

        let mut candidates: Vec<&ModelEntry> = state
            .models
            .values()
            .filter(|m| m.healthy && m.status == EntityStatus::Active && m.capability_tags.iter().any(|t| t == family))
            .collect();

        if candidates.is_empty() {
            candidates = state
                .models
                .values()
                .filter(|m| m.healthy && m.status == EntityStatus::Active)
                .collect();
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.metrics.moving_avg_latency_ms.partial_cmp(&b.metrics.moving_avg_latency_ms).unwrap_or(std::cmp::Ordering::Equal))
        });

        candidates
            .into_iter()
            .next()
            .cloned()
            .ok_or(RegistryError::NoModelAvailable { task_class })
    }

    pub async fn set_model_health(&self, model_id: &str, healthy: bool) {
        if let Some(model) = self.state.write().await.models.get_mut(model_id) {
            model.healthy = healthy;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
