//! Human-in-the-loop approval gate. Policy decisions are `Allow`,
//! `Deny(reason)`, or `RequiresApproval` — the third state generalizes a
//! plain boolean policy check into one that may block on a human.

use crate::registry::Registry;
use crate::types::{new_id, ApprovalRequest, ApprovalStatus, ExecutorRef, Id, Plan, RequestType};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::info;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Allow,
    RequiresApproval { request_id: Id },
    Deny(String),
}

#[derive(Debug, Clone)]
pub enum ApprovalError {
    NotFound(Id),
    AlreadyDecided { request_id: Id, status: ApprovalStatus },
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalError::NotFound(id) => write!(f, "approval request {id} not found"),
            ApprovalError::AlreadyDecided { request_id, status } => {
                write!(f, "approval request {request_id} already decided ({status:?})")
            }
        }
    }
}

impl std::error::Error for ApprovalError {}

/// Policy boundary for whether a plan needs a human in the loop. `agent_trust`
/// is the Laplace-smoothed success ratio (`SuccessMetrics::trust`) of the
/// weakest agent the plan's steps reference, or `1.0` for a plan with no
/// agent-backed steps. The default `PlanPolicy` implements the auto-approve
/// matrix below; callers may substitute their own (e.g. an org-specific
/// compliance gate).
#[async_trait]
pub trait PlanPolicy: Send + Sync {
    async fn evaluate(&self, request_type: RequestType, plan: &Plan, agent_trust: f64) -> PlanDecision;
}

/// `SimpleQuestion`/`PlanningOnly` always auto-approve. `InformationQuery`
/// auto-approves unless the plan has a high-risk step. `CodeGeneration`
/// auto-approves when `risk_score <= 0.3` and `agent_trust >= 0.8`.
/// `ComplexTask` auto-approves when `risk_score <= 0.2`. Any plan with a
/// step whose `requires_approval` flag is set always requires approval,
/// regardless of request type.
pub struct DefaultPlanPolicy;

#[async_trait]
impl PlanPolicy for DefaultPlanPolicy {
    async fn evaluate(&self, request_type: RequestType, plan: &Plan, agent_trust: f64) -> PlanDecision {
        if plan.has_step_requiring_approval() {
            return PlanDecision::RequiresApproval { request_id: new_id() };
        }
        match request_type {
            RequestType::SimpleQuestion | RequestType::PlanningOnly => PlanDecision::Allow,
            RequestType::InformationQuery => {
                if plan.has_high_risk_step() {
                    PlanDecision::RequiresApproval { request_id: new_id() }
                } else {
                    PlanDecision::Allow
                }
            }
            RequestType::CodeGeneration => {
                if plan.risk_score <= 0.3 && agent_trust >= 0.8 {
                    PlanDecision::Allow
                } else {
                    PlanDecision::RequiresApproval { request_id: new_id() }
                }
            }
            RequestType::ComplexTask => {
                if plan.risk_score <= 0.2 {
                    PlanDecision::Allow
                } else {
                    PlanDecision::RequiresApproval { request_id: new_id() }
                }
            }
        }
    }
}

/// Weakest-link trust across the agents a plan's steps reference, Laplace
/// smoothed per `SuccessMetrics::trust`. A plan with no agent-backed step
/// (pure tool/inline-LLM steps) carries no agent risk, so it reads as fully
/// trusted.
async fn agent_trust(plan: &Plan, registry: &Registry) -> f64 {
    let mut agent_ids: Vec<&str> = Vec::new();
    for step in &plan.steps {
        match &step.executor_ref {
            ExecutorRef::Agent { agent_id } => agent_ids.push(agent_id.as_str()),
            ExecutorRef::Team { member_agent_ids } => {
                agent_ids.extend(member_agent_ids.iter().map(String::as_str))
            }
            ExecutorRef::Tool { .. } | ExecutorRef::InlineLlm => {}
        }
    }

    let mut lowest = 1.0f64;
    let mut found_any = false;
    for agent_id in agent_ids {
        if let Some(agent) = registry.agent(agent_id).await {
            found_any = true;
            lowest = lowest.min(agent.metrics.trust());
        }
    }
    if found_any {
        lowest
    } else {
        1.0
    }
}

/// Tracks pending/decided `ApprovalRequest`s and exposes the human decision
/// surface (`decide`). Requests past their `decision_deadline` read as
/// `Expired` without a background sweep — `status` is computed lazily on
/// read, so a request nobody ever decided simply ages out.
pub struct ApprovalGate {
    policy: Box<dyn PlanPolicy>,
    requests: RwLock<HashMap<Id, ApprovalRequest>>,
    default_deadline: ChronoDuration,
}

impl ApprovalGate {
    pub fn new(policy: Box<dyn PlanPolicy>, default_deadline_hours: u32) -> Self {
        Self {
            policy,
            requests: RwLock::new(HashMap::new()),
            default_deadline: ChronoDuration::hours(default_deadline_hours as i64),
        }
    }

    pub async fn evaluate_plan(
        &self,
        request_type: RequestType,
        plan: &Plan,
        registry: &Registry,
        risk_assessment: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> PlanDecision {
        let trust = agent_trust(plan, registry).await;
        let decision = self.policy.evaluate(request_type, plan, trust).await;
        if let PlanDecision::RequiresApproval { request_id } = &decision {
            let request = ApprovalRequest {
                request_id: request_id.clone(),
                plan_id: Some(plan.plan_id.clone()),
                artifact_ref: plan.plan_id.clone(),
                risk_assessment: risk_assessment.into(),
                recommendation: recommendation.into(),
                status: ApprovalStatus::Pending,
                decision_deadline: Utc::now() + self.default_deadline,
                feedback: None,
            };
            info!("approval request {request_id} opened for plan {}", plan.plan_id);
            self.requests.write().await.insert(request_id.clone(), request);
        }
        decision
    }

    /// Current status, computing `Expired` lazily for a still-`Pending`
    /// request past its deadline.
    pub async fn status(&self, request_id: &str) -> Result<ApprovalStatus, ApprovalError> {
        let requests = self.requests.read().await;
        let request = requests
            .get(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;
        Ok(effective_status(request))
    }

    /// Record a human decision. Rejects deciding a request that is already
    /// `Approved`/`Rejected`/`Modified`, or past its deadline.
    pub async fn decide(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        feedback: Option<String>,
    ) -> Result<(), ApprovalError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        let current = effective_status(request);
        if current != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyDecided {
                request_id: request_id.to_string(),
                status: current,
            });
        }

        request.status = status;
        request.feedback = feedback;
        info!("approval request {request_id} decided: {:?}", request.status);
        Ok(())
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }
}

fn effective_status(request: &ApprovalRequest) -> ApprovalStatus {
    if request.status == ApprovalStatus::Pending && Utc::now() > request.decision_deadline {
        ApprovalStatus::Expired
    } else {
        request.status
    }
}
