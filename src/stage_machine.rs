//! Drives a `Workflow` through the canonical stage sequence, resolving a
//! prompt and invoking a handler at each step. The stage graph is a
//! data-driven `HashMap<Stage, Vec<Stage>>` successor table rather than a
//! compile-time match, so new stages (and new branches) can be wired in
//! without touching the driver loop. Three branches read the request type
//! or the stage's own outcome rather than always advancing linearly:
//! `Routing` shortcuts straight to `Execution` for a `SimpleQuestion`,
//! `ValidatorA` loops back to `Interpretation` when it reports
//! `"clarification_needed"`, and `ValidatorB` loops back to `Planning`
//! when it reports `"rejected"`.

use crate::event_log::EventLogError;
use crate::executor::{Executor, ExecutorError};
use crate::registry::RegistryError;
use crate::runtime_context::RuntimeContext;
use crate::types::{DecisionSource, Id, Plan, RequestType, Stage, Workflow, WorkflowStatus};
use async_trait::async_trait;
use log::{error, info};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub enum StageMachineError {
    PromptUnresolved { stage: Stage },
    UnknownTransition { stage: Stage },
    HandlerFailed { stage: Stage, reason: String },
    EventLogUnavailable(String),
    /// A plan-execution call arrived without a live, non-terminal workflow
    /// at the matching stage behind it. There is no supported way to run a
    /// plan outside a `StageMachine`-driven workflow; go through
    /// `StageMachine::handle_request` instead.
    BypassRejected { workflow_id: Id },
}

impl fmt::Display for StageMachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageMachineError::PromptUnresolved { stage } => {
                write!(f, "stage {stage:?} has no resolvable prompt; refusing to proceed blind")
            }
            StageMachineError::UnknownTransition { stage } => {
                write!(f, "no transition defined out of stage {stage:?}")
            }
            StageMachineError::HandlerFailed { stage, reason } => {
                write!(f, "stage {stage:?} handler failed: {reason}")
            }
            StageMachineError::EventLogUnavailable(msg) => write!(f, "event log unavailable: {msg}"),
            StageMachineError::BypassRejected { workflow_id } => {
                write!(f, "plan execution for workflow {workflow_id} was not requested through a bound workflow")
            }
        }
    }
}

impl std::error::Error for StageMachineError {}

impl From<EventLogError> for StageMachineError {
    fn from(err: EventLogError) -> Self {
        StageMachineError::EventLogUnavailable(err.to_string())
    }
}

/// Per-stage unit of work. Implementations are the actual interpretation,
/// validation, routing, planning, execution, and reflection components;
/// the stage machine only resolves the prompt, invokes the handler, and
/// records the transition.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &RuntimeContext,
        workflow: &Workflow,
        prompt_body: &str,
    ) -> Result<String, String>;
}

/// The canonical successor sets for the 8-stage pipeline. A stage absent
/// from the table is terminal — `RegistryUpdate`'s absence here means
/// "workflow completes", not "misconfigured". `ValidatorA`, `Routing`, and
/// `ValidatorB` each list more than one successor; `next_stage` picks
/// among them based on the request type or the stage's reported outcome,
/// and checks the pick against this table so a bad branch decision is
/// caught as an `UnknownTransition` rather than silently taken.
fn canonical_transitions() -> HashMap<Stage, Vec<Stage>> {
    let mut table = HashMap::new();
    table.insert(Stage::Interpretation, vec![Stage::ValidatorA]);
    table.insert(Stage::ValidatorA, vec![Stage::Routing, Stage::Interpretation]);
    table.insert(Stage::Routing, vec![Stage::Planning, Stage::Execution]);
    table.insert(Stage::Planning, vec![Stage::ValidatorB]);
    table.insert(Stage::ValidatorB, vec![Stage::Execution, Stage::Planning]);
    table.insert(Stage::Execution, vec![Stage::Reflection]);
    table.insert(Stage::Reflection, vec![Stage::RegistryUpdate]);
    table
}

pub struct StageMachine {
    transitions: HashMap<Stage, Vec<Stage>>,
    handlers: HashMap<Stage, std::sync::Arc<dyn StageHandler>>,
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            transitions: canonical_transitions(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(mut self, stage: Stage, handler: std::sync::Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    /// Picks the branch out of `stage`: `ValidatorA` loops back to
    /// `Interpretation` on a `"clarification_needed"` outcome, `Routing`
    /// shortcuts straight to `Execution` for a `SimpleQuestion`, and
    /// `ValidatorB` loops back to `Planning` on a `"rejected"` outcome.
    /// Every other stage has exactly one successor. The candidate is
    /// checked against `canonical_transitions`'s successor set before
    /// being returned, so a stage outside the table (a terminal stage)
    /// yields `None` regardless of the branch logic below.
    fn next_stage(&self, stage: Stage, request_type: RequestType, outcome: &str) -> Option<Stage> {
        let candidate = match stage {
            Stage::Interpretation => Stage::ValidatorA,
            Stage::ValidatorA => {
                if outcome == "clarification_needed" {
                    Stage::Interpretation
                } else {
                    Stage::Routing
                }
            }
            Stage::Routing => {
                if request_type == RequestType::SimpleQuestion {
                    Stage::Execution
                } else {
                    Stage::Planning
                }
            }
            Stage::Planning => Stage::ValidatorB,
            Stage::ValidatorB => {
                if outcome == "rejected" {
                    Stage::Planning
                } else {
                    Stage::Execution
                }
            }
            Stage::Execution => Stage::Reflection,
            Stage::Reflection => Stage::RegistryUpdate,
            Stage::RegistryUpdate => return None,
        };
        let successors = self.transitions.get(&stage)?;
        successors.contains(&candidate).then_some(candidate)
    }

    /// Drive `workflow` from its current stage to completion (or the first
    /// unresolved-prompt / unknown-transition / handler failure, each
    /// fatal, failing fast rather than silently skipping a stage).
    pub async fn run(
        &self,
        ctx: &RuntimeContext,
        workflow: &mut Workflow,
    ) -> Result<(), StageMachineError> {
        workflow.set_status(WorkflowStatus::Running).ok();

        loop {
            let stage = workflow.current_stage;
            let component_role = stage.component_role();

            let (prompt_id, prompt_version, prompt_body) = match ctx
                .registry
                .resolve_prompt(stage, component_role, &Default::default())
                .await
            {
                Ok(resolved) => resolved,
                Err(RegistryError::PromptUnresolved { .. }) => {
                    error!("fatal: {stage:?} has no resolvable prompt for workflow {}", workflow.workflow_id);
                    workflow.set_status(WorkflowStatus::Failed).ok();
                    return Err(StageMachineError::PromptUnresolved { stage });
                }
                Err(other) => {
                    error!("registry error resolving prompt for {stage:?}: {other}");
                    workflow.set_status(WorkflowStatus::Failed).ok();
                    return Err(StageMachineError::PromptUnresolved { stage });
                }
            };

            let handler = self.handlers.get(&stage).cloned();
            let outcome = match handler {
                Some(h) => h.handle(ctx, workflow, &prompt_body).await,
                None => Ok(format!("no handler registered for {stage:?}; pass-through")),
            };

            let mut branch_outcome = String::new();
            match &outcome {
                Ok(summary) => {
                    branch_outcome = summary.clone();
                    ctx.event_log
                        .emit(
                            workflow.workflow_id.clone(),
                            workflow.session_id.clone(),
                            stage,
                            component_role,
                            "stage_machine",
                            DecisionSource::Component,
                            "ok",
                            "",
                            summary,
                            None,
                        )
                        .await?;
                }
                Err(reason) => {
                    ctx.event_log
                        .emit(
                            workflow.workflow_id.clone(),
                            workflow.session_id.clone(),
                            stage,
                            component_role,
                            "stage_machine",
                            DecisionSource::Component,
                            "failed",
                            "",
                            reason,
                            None,
                        )
                        .await?;
                    workflow.set_status(WorkflowStatus::Failed).ok();
                    return Err(StageMachineError::HandlerFailed {
                        stage,
                        reason: reason.clone(),
                    });
                }
            }

            let _ = (prompt_id, prompt_version);

            match self.next_stage(stage, workflow.request_type, &branch_outcome) {
                Some(next) => workflow.current_stage = next,
                None => {
                    if stage == Stage::RegistryUpdate {
                        workflow.set_status(WorkflowStatus::Completed).ok();
                        info!("workflow {} completed", workflow.workflow_id);
                        return Ok(());
                    }
                    return Err(StageMachineError::UnknownTransition { stage });
                }
            }
        }
    }

    /// The sanctioned entry point for one-shot work: builds a fresh
    /// `Workflow` and drives it through `run`. Nothing else in this crate
    /// constructs a `Workflow` that goes on to reach `Execution` — a caller
    /// wanting a plan carried out has to come through here.
    pub async fn handle_request(
        &self,
        ctx: &RuntimeContext,
        session_id: impl Into<String>,
        request_type: RequestType,
    ) -> Result<Workflow, StageMachineError> {
        let mut workflow = Workflow::new(session_id, request_type);
        self.run(ctx, &mut workflow).await?;
        Ok(workflow)
    }

    /// Run `plan` through the executor, but only if `workflow` is the live,
    /// non-terminal workflow that owns it and has actually reached the
    /// execution stage. A plan produced outside this workflow's own
    /// planning stage, or submitted after the workflow already moved on or
    /// finished, is rejected rather than silently executed.
    pub async fn execute_plan_for(
        &self,
        ctx: &RuntimeContext,
        workflow: &Workflow,
        plan: &mut Plan,
    ) -> Result<(), StageMachineError> {
        if workflow.workflow_id != plan.workflow_id
            || workflow.status.is_terminal()
            || workflow.current_stage != Stage::Execution
        {
            return Err(StageMachineError::BypassRejected {
                workflow_id: plan.workflow_id.clone(),
            });
        }
        Executor::new()
            .execute(ctx, plan)
            .await
            .map_err(|err| StageMachineError::HandlerFailed { stage: Stage::Execution, reason: err.to_string() })
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}
