//! Core data model: the entities the kernel passes between components.
//!
//! `Workflow`, `Plan`, `Step`, `ExecutionEvent`, and the registry/approval/
//! checkpoint/queue/learning records. They carry `serde` derives throughout
//! because every one of them crosses a persistence or wire boundary
//! somewhere in the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque globally-unique identifier. A thin alias keeps call sites
/// readable without pretending these strings are validated UUIDs from
/// every source (some, like `prompt_id`, are registry-assigned).
pub type Id = String;

/// Generate a fresh opaque identifier.
pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

/// Classification assigned to an incoming request during interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    SimpleQuestion,
    InformationQuery,
    CodeGeneration,
    ComplexTask,
    PlanningOnly,
}

/// Canonical pipeline stage. Ordered, gap-free; every persisted event's
/// `stage` field must be one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Interpretation,
    ValidatorA,
    Routing,
    Planning,
    ValidatorB,
    Execution,
    Reflection,
    RegistryUpdate,
}

impl Stage {
    /// Canonical `(stage, component_role)` mapping.
    pub fn component_role(self) -> &'static str {
        match self {
            Stage::Interpretation => "interpretation",
            Stage::ValidatorA => "semantic_validator",
            Stage::Routing => "routing",
            Stage::Planning => "planning",
            Stage::ValidatorB => "execution_validator",
            Stage::Execution => "execution",
            Stage::Reflection => "reflection",
            Stage::RegistryUpdate => "reflection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// One user interaction, from request entry to terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Id,
    pub session_id: Id,
    pub request_type: RequestType,
    pub current_stage: Stage,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(session_id: impl Into<String>, request_type: RequestType) -> Self {
        Self {
            workflow_id: new_id(),
            session_id: session_id.into(),
            request_type,
            current_stage: Stage::Interpretation,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Apply a status transition, rejecting writes past a terminal status.
    pub fn set_status(&mut self, status: WorkflowStatus) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "workflow {} is terminal ({:?}); cannot move to {:?}",
                self.workflow_id, self.status, status
            ));
        }
        self.status = status;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Paused,
    Completed,
    Failed,
    Superseded,
}

/// A plan's strategy: approach, assumptions, constraints, success criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Strategy {
    pub approach: String,
    pub assumptions: Vec<String>,
    pub constraints: Vec<String>,
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    Action,
    Decision,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Who (or what) carries out a step. A closed sum type rather than a
/// duck-typed executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutorRef {
    Agent { agent_id: Id },
    Tool { tool_id: Id },
    Team { member_agent_ids: Vec<Id> },
    InlineLlm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: 0,
            jitter_ms: 0,
        }
    }
}

/// A structured function-call a step may request of the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One unit of execution within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: Id,
    pub plan_id: Id,
    pub index: usize,
    pub step_type: StepType,
    pub executor_ref: ExecutorRef,
    pub inputs: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    pub dependencies: Vec<Id>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub approval_required: bool,
    pub risk_level: RiskLevel,
    pub function_call: Option<FunctionCall>,
    pub state: StepState,
    pub attempts: u32,
}

impl Step {
    pub fn is_high_risk(&self) -> bool {
        matches!(self.risk_level, RiskLevel::High)
    }
}

/// Result of planning: an ordered, dependency-bound set of steps plus risk
/// and alternative-selection metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Id,
    pub workflow_id: Id,
    pub version: u32,
    pub goal: String,
    pub strategy: Strategy,
    pub steps: Vec<Step>,
    pub risk_score: f64,
    pub alternatives: Vec<Id>,
    pub status: PlanStatus,
}

impl Plan {
    /// Fraction of steps with `risk_level = high`.
    pub fn frac_high_risk_steps(&self) -> f64 {
        fraction(&self.steps, |s| s.is_high_risk())
    }

    /// Fraction of steps requiring human approval.
    pub fn frac_requires_approval(&self) -> f64 {
        fraction(&self.steps, |s| s.approval_required)
    }

    pub fn has_step_requiring_approval(&self) -> bool {
        self.steps.iter().any(|s| s.approval_required)
    }

    pub fn has_high_risk_step(&self) -> bool {
        self.steps.iter().any(Step::is_high_risk)
    }
}

fn fraction<T>(items: &[T], pred: impl Fn(&T) -> bool) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    items.iter().filter(|i| pred(i)).count() as f64 / items.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    Component,
    Registry,
    Human,
}

/// The canonical, append-only log record. Single observability truth for
/// the whole kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_id: Id,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: Id,
    pub session_id: Id,
    pub stage: Stage,
    pub component_role: String,
    pub component_name: String,
    pub decision_source: DecisionSource,
    pub status: String,
    pub input_summary: String,
    pub output_summary: String,
    pub reason_code: Option<String>,
    pub parent_event_id: Option<Id>,
    pub event_metadata: HashMap<String, serde_json::Value>,
    pub prompt_id: Option<Id>,
    pub prompt_version: Option<u32>,
}

/// Default cap for `input_summary`/`output_summary`.
pub const SUMMARY_MAX_BYTES: usize = 4096;

/// Truncate a textual summary to the bounded size the EventLog contract
/// requires, never emitting the raw payload.
pub fn bound_summary(text: &str) -> String {
    if text.len() <= SUMMARY_MAX_BYTES {
        return text.to_string();
    }
    let mut end = SUMMARY_MAX_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Draft,
    WaitingApproval,
    Active,
    Paused,
    Deprecated,
}

/// Success metrics tracked by the registry for agents, tools, and models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuccessMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub moving_avg_latency_ms: f64,
}

impl SuccessMetrics {
    /// Laplace-smoothed success ratio, used as the "trust" quantity in
    /// ApprovalGate's policy matrix.
    pub fn trust(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }

    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.total += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        const ALPHA: f64 = 0.2;
        if self.total == 1 {
            self.moving_avg_latency_ms = latency_ms;
        } else {
            self.moving_avg_latency_ms =
                ALPHA * latency_ms + (1.0 - ALPHA) * self.moving_avg_latency_ms;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent_id: Id,
    pub name: String,
    pub status: EntityStatus,
    pub capability_tags: Vec<String>,
    pub metrics: SuccessMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub tool_id: Id,
    pub name: String,
    pub status: EntityStatus,
    pub capability_tags: Vec<String>,
    pub metrics: SuccessMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskClass {
    Reasoning,
    Planning,
    GeneralChat,
    CodeGeneration,
    CodeAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: Id,
    pub name: String,
    pub status: EntityStatus,
    pub capability_tags: Vec<String>,
    pub priority: i32,
    pub healthy: bool,
    pub metrics: SuccessMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub prompt_id: Id,
    pub version: u32,
    pub body: String,
    pub status: EntityStatus,
    pub metrics: SuccessMetrics,
}

/// Binding from `(stage, component_role, scope)` to `(prompt_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAssignment {
    pub stage: Stage,
    pub component_role: String,
    pub scope: Option<String>,
    pub prompt_id: Id,
    pub prompt_version: u32,
    pub legacy_exempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Id,
    pub plan_id: Option<Id>,
    pub artifact_ref: String,
    pub risk_assessment: String,
    pub recommendation: String,
    pub status: ApprovalStatus,
    pub decision_deadline: DateTime<Utc>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Id,
    pub entity_type: String,
    pub entity_id: Id,
    pub state_blob: Vec<u8>,
    pub integrity_hash: String,
    pub reason: String,
    pub trace_id: Id,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueTaskState {
    Queued,
    Leased,
    Succeeded,
    Failed,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    pub task_id: Id,
    pub queue_id: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: QueueTaskState,
    pub lease_owner: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub next_visible_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearningPatternKind {
    Strategy,
    Prompt,
    ToolSelection,
    CodePattern,
    ErrorRecovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningPattern {
    pub pattern_id: Id,
    pub kind: LearningPatternKind,
    pub signature: String,
    pub observed_success_rate: f64,
    pub sample_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_workflow_status_rejects_further_transitions() {
        let mut wf = Workflow::new("sess-1", RequestType::SimpleQuestion);
        wf.set_status(WorkflowStatus::Completed).unwrap();
        assert!(wf.set_status(WorkflowStatus::Running).is_err());
    }

    #[test]
    fn trust_is_laplace_smoothed() {
        let metrics = SuccessMetrics::default();
        // No data yet: smoothing pulls trust to the midpoint, not 0 or 1.
        assert!((metrics.trust() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bound_summary_truncates_at_char_boundary() {
        let long = "a".repeat(SUMMARY_MAX_BYTES + 10);
        let bounded = bound_summary(&long);
        assert!(bounded.ends_with("..."));
        assert!(bounded.len() <= SUMMARY_MAX_BYTES + 3);
    }

    #[test]
    fn plan_risk_fractions_are_zero_for_empty_steps() {
        let plan = Plan {
            plan_id: new_id(),
            workflow_id: new_id(),
            version: 1,
            goal: "test".into(),
            strategy: Strategy::default(),
            steps: vec![],
            risk_score: 0.0,
            alternatives: vec![],
            status: PlanStatus::Draft,
        };
        assert_eq!(plan.frac_high_risk_steps(), 0.0);
        assert_eq!(plan.frac_requires_approval(), 0.0);
    }
}
