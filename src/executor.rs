//! Walks an approved `Plan`'s steps to completion, dispatching each to its
//! resolved executor (`Agent`/`Tool`/`Team`/`InlineLlm`) and handling the
//! retry/replan escalation path. A step marked `approval_required`, or one
//! that exhausts its retries on a sandbox violation, fails the plan
//! outright instead of spending the one re-plan attempt on it. Tracks
//! cumulative elapsed time against each step's declared budget to surface
//! a `slow_progress` event before the plan actually misses its deadline.

use crate::llm_gateway::GenerateOptions;
use crate::registry::ScopeHints;
use crate::runtime_context::RuntimeContext;
use crate::types::{
    new_id, DecisionSource, ExecutorRef, FunctionCall, Id, Plan, PlanStatus, Stage, Step,
    StepState, StepType,
};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum ExecutorError {
    NotApproved { plan_id: Id, status: PlanStatus },
    StepFailed { step_id: Id, reason: String },
    ReplanFailed(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::NotApproved { plan_id, status } => {
                write!(f, "plan {plan_id} is not approved (status={status:?})")
            }
            ExecutorError::StepFailed { step_id, reason } => {
                write!(f, "step {step_id} failed and exhausted retries/replan: {reason}")
            }
            ExecutorError::ReplanFailed(reason) => write!(f, "re-planning failed: {reason}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Snapshot of prior steps' outputs, looked up by validation/decision steps
/// that reference a dependency's result. Built once per step so the
/// dispatch methods can take plain values instead of borrowing the whole
/// plan (which is simultaneously being mutated by the caller).
type OutputLookup = HashMap<Id, Value>;

fn output_lookup(plan: &Plan) -> OutputLookup {
    plan.steps
        .iter()
        .filter_map(|s| s.outputs.clone().map(|o| (s.step_id.clone(), o)))
        .collect()
}

/// A `SandboxError` (timeout, resource limit, or forbidden signature) is
/// never worth re-planning around — re-planning produces a new step graph,
/// not a different resource budget or denylist, so the same violation would
/// just recur. Fails the plan outright instead of burning the one re-plan
/// on a retry that cannot succeed.
fn is_fatal_failure(reason: &str) -> bool {
    reason.contains("sandbox violation")
}

pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Drive every step of `plan` to a terminal state. Precondition:
    /// `plan.status == Approved`.
    pub async fn execute(&self, ctx: &RuntimeContext, plan: &mut Plan) -> Result<(), ExecutorError> {
        if plan.status != PlanStatus::Approved {
            return Err(ExecutorError::NotApproved {
                plan_id: plan.plan_id.clone(),
                status: plan.status,
            });
        }

        ctx.checkpoints
            .snapshot(
                "plan",
                plan.plan_id.clone(),
                serde_json::to_vec(plan).unwrap_or_default(),
                "pre-plan",
                plan.plan_id.clone(),
            )
            .await;

        plan.status = PlanStatus::Executing;
        let expected_total_ms: u64 = plan.steps.iter().map(|s| s.timeout_ms).sum();
        let start = Instant::now();
        let mut elapsed_expected_ms: u64 = 0;
        let mut replanned_once = false;
        let mut idx = 0;

        while idx < plan.steps.len() {
            if matches!(plan.steps[idx].state, StepState::Skipped | StepState::Succeeded) {
                idx += 1;
                continue;
            }

            plan.steps[idx].state = StepState::Running;
            let step_id = plan.steps[idx].step_id.clone();
            let step_snapshot = plan.steps[idx].clone();

            ctx.checkpoints
                .snapshot(
                    "step",
                    step_id.clone(),
                    serde_json::to_vec(&step_snapshot).unwrap_or_default(),
                    "pre-step",
                    plan.plan_id.clone(),
                )
                .await;

            let lookup = output_lookup(plan);
            let outcome = self.run_step(ctx, &*plan, &step_snapshot, &lookup).await;
            elapsed_expected_ms += step_snapshot.timeout_ms;

            match outcome {
                Ok(StepOutcome::Succeeded(output)) => {
                    plan.steps[idx].outputs = Some(output);
                    plan.steps[idx].state = StepState::Succeeded;
                    self.emit_step_event(ctx, plan, &step_id, "succeeded", "").await;
                    idx += 1;
                }
                Ok(StepOutcome::Routed { chosen_output, skip }) => {
                    plan.steps[idx].outputs = Some(chosen_output);
                    plan.steps[idx].state = StepState::Succeeded;
                    for other in plan.steps.iter_mut() {
                        if skip.contains(&other.step_id) {
                            other.state = StepState::Skipped;
                        }
                    }
                    self.emit_step_event(ctx, plan, &step_id, "succeeded", "decision routed").await;
                    idx += 1;
                }
                Err(reason) => {
                    plan.steps[idx].attempts += 1;
                    let attempts = plan.steps[idx].attempts;
                    let max_attempts = plan.steps[idx].retry_policy.max_attempts;

                    if attempts < max_attempts {
                        let backoff = plan.steps[idx].retry_policy.backoff_base_ms
                            + plan.steps[idx].retry_policy.jitter_ms * attempts as u64;
                        warn!("step {step_id} attempt {attempts} failed: {reason}; retrying in {backoff}ms");
                        self.emit_step_event(ctx, plan, &step_id, "retrying", &reason).await;
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        plan.steps[idx].state = StepState::Ready;
                        continue;
                    }

                    let fatal = step_snapshot.approval_required || is_fatal_failure(&reason);

                    if !replanned_once && !fatal {
                        replanned_once = true;
                        warn!("step {step_id} exhausted retries; invoking re-planning once");
                        self.emit_step_event(ctx, plan, &step_id, "failed", &reason).await;
                        match ctx.planner.replan(plan, &reason, &[]).await {
                            Ok(mut new_plan) => {
                                new_plan.status = PlanStatus::Approved;
                                *plan = new_plan;
                                idx = 0;
                                continue;
                            }
                            Err(err) => {
                                plan.status = PlanStatus::Failed;
                                return Err(ExecutorError::ReplanFailed(err.to_string()));
                            }
                        }
                    }

                    plan.steps[idx].state = StepState::Failed;
                    plan.status = PlanStatus::Failed;
                    self.emit_step_event(ctx, plan, &step_id, "failed", &reason).await;
                    error!("plan {} failed at step {step_id}, rolling back to pre-plan checkpoint", plan.plan_id);
                    let _ = ctx.checkpoints.rollback("plan", &plan.plan_id).await;
                    return Err(ExecutorError::StepFailed { step_id, reason });
                }
            }

            let actual_ms = start.elapsed().as_millis() as u64;
            if expected_total_ms > 0 && actual_ms > 0 {
                let progress_ratio = elapsed_expected_ms as f64 / expected_total_ms as f64;
                let time_ratio = actual_ms as f64 / expected_total_ms as f64;
                if time_ratio > 0.0 && progress_ratio < 0.8 * time_ratio {
                    warn!("plan {} progress lagging: {progress_ratio:.2} of expected vs {time_ratio:.2} of time budget", plan.plan_id);
                    ctx.event_log
                        .emit(
                            plan.workflow_id.clone(),
                            plan.workflow_id.clone(),
                            Stage::Execution,
                            "execution",
                            "executor_supervisor",
                            DecisionSource::Component,
                            "slow_progress",
                            "",
                            "",
                            None,
                        )
                        .await
                        .ok();
                }
            }
        }

        plan.status = PlanStatus::Completed;
        info!("plan {} completed", plan.plan_id);
        Ok(())
    }

    async fn emit_step_event(&self, ctx: &RuntimeContext, plan: &Plan, step_id: &str, status: &str, detail: &str) {
        ctx.event_log
            .emit(
                plan.workflow_id.clone(),
                plan.workflow_id.clone(),
                Stage::Execution,
                "execution",
                step_id,
                DecisionSource::Component,
                status,
                "",
                detail,
                None,
            )
            .await
            .ok();
    }

    async fn run_step(
        &self,
        ctx: &RuntimeContext,
        plan: &Plan,
        step: &Step,
        lookup: &OutputLookup,
    ) -> Result<StepOutcome, String> {
        match step.step_type {
            StepType::Validation => self.run_validation(step, lookup).map(StepOutcome::Succeeded),
            StepType::Decision => self.run_decision(ctx, plan, step).await,
            StepType::Action => self.run_action(ctx, step).await.map(StepOutcome::Succeeded),
        }
    }

    /// Declared checks against a dependency's output: `must_contain`,
    /// `must_not_contain`, `length_at_most`, or `schema` (required-key
    /// presence). Produces `pass|fail|partial` with a quality score.
    fn run_validation(&self, step: &Step, lookup: &OutputLookup) -> Result<Value, String> {
        let rule = step.inputs.get("rule").and_then(Value::as_str).unwrap_or("must_contain");
        let target_id = step.inputs.get("target_step_id").and_then(Value::as_str);
        let target_text = target_id
            .and_then(|id| lookup.get(id))
            .map(|v| v.to_string())
            .unwrap_or_default();

        let (status, score) = match rule {
            "must_contain" => {
                let expected = step.inputs.get("expected").and_then(Value::as_str).unwrap_or("");
                if target_text.contains(expected) {
                    ("pass", 1.0)
                } else {
                    ("fail", 0.0)
                }
            }
            "must_not_contain" => {
                let forbidden = step.inputs.get("expected").and_then(Value::as_str).unwrap_or("");
                if target_text.contains(forbidden) {
                    ("fail", 0.0)
                } else {
                    ("pass", 1.0)
                }
            }
            "length_at_most" => {
                let max_len = step.inputs.get("expected").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
                if target_text.len() <= max_len {
                    ("pass", 1.0)
                } else {
                    let overflow = (target_text.len() - max_len) as f64;
                    ("partial", (1.0 - overflow / target_text.len().max(1) as f64).clamp(0.0, 1.0))
                }
            }
            "schema" => {
                let required_keys = step
                    .inputs
                    .get("expected")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let target_value = target_id.and_then(|id| lookup.get(id));
                let present = target_value.and_then(Value::as_object);
                match present {
                    Some(obj) => {
                        let total = required_keys.len().max(1);
                        let found = required_keys
                            .iter()
                            .filter(|k| k.as_str().map(|k| obj.contains_key(k)).unwrap_or(false))
                            .count();
                        if found == total {
                            ("pass", 1.0)
                        } else if found == 0 {
                            ("fail", 0.0)
                        } else {
                            ("partial", found as f64 / total as f64)
                        }
                    }
                    None => ("fail", 0.0),
                }
            }
            other => return Err(format!("unknown validation rule '{other}'")),
        };

        if status == "fail" {
            return Err(format!("validation '{rule}' against step {target_id:?} failed"));
        }
        Ok(json!({ "status": status, "quality_score": score }))
    }

    /// Structured-choice decision: ask the LLM gateway which declared
    /// branch to take, then mark every step whose `inputs.branch` doesn't
    /// match the chosen branch as `skipped`.
    async fn run_decision(&self, ctx: &RuntimeContext, plan: &Plan, step: &Step) -> Result<StepOutcome, String> {
        let branches: Vec<String> = step
            .inputs
            .get("branches")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if branches.is_empty() {
            return Err("decision step declared no branches".to_string());
        }

        let prompt = step
            .inputs
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("choose the best branch");
        let user_prompt = format!(
            "{prompt}\nChoose exactly one of: {}.\nRespond with JSON: {{\"selected_branch\": string, \"rationale\": string}}",
            branches.join(", ")
        );

        let response = ctx
            .llm_gateway
            .generate("reasoning", "", &user_prompt, &[], GenerateOptions::default())
            .await
            .map_err(|e| e.to_string())?;

        let parsed: Value = serde_json::from_str(response.text.trim()).unwrap_or(Value::Null);
        let selected = parsed
            .get("selected_branch")
            .and_then(Value::as_str)
            .filter(|b| branches.iter().any(|br| br == b))
            .unwrap_or(&branches[0])
            .to_string();
        let rationale = parsed.get("rationale").and_then(Value::as_str).unwrap_or("").to_string();

        // Siblings tagged with a `branch` that this decision didn't choose
        // never become ready: `waiting` -> `skipped`.
        let skip: Vec<Id> = plan
            .steps
            .iter()
            .filter(|s| {
                s.dependencies.contains(&step.step_id)
                    && s.inputs.get("branch").and_then(Value::as_str).map(|b| b != selected).unwrap_or(false)
            })
            .map(|s| s.step_id.clone())
            .collect();

        Ok(StepOutcome::Routed {
            chosen_output: json!({ "selected_branch": selected, "rationale": rationale }),
            skip,
        })
    }

    async fn run_action(&self, ctx: &RuntimeContext, step: &Step) -> Result<Value, String> {
        match &step.executor_ref {
            ExecutorRef::Tool { tool_id } => {
                let call = step
                    .function_call
                    .clone()
                    .unwrap_or_else(|| FunctionCall { name: tool_id.clone(), arguments: step.inputs.clone() });
                let outcome = ctx.sandbox.execute(&call.name, call.arguments).await.map_err(|e| e.to_string())?;
                if outcome.status == "success" {
                    Ok(outcome.result)
                } else {
                    Err(outcome.stderr)
                }
            }
            ExecutorRef::Agent { agent_id } => self.run_agent(ctx, agent_id, step).await,
            ExecutorRef::Team { member_agent_ids } => {
                let mut outputs = Vec::with_capacity(member_agent_ids.len());
                for agent_id in member_agent_ids {
                    outputs.push(self.run_agent(ctx, agent_id, step).await?);
                }
                Ok(json!({ "team_outputs": outputs }))
            }
            ExecutorRef::InlineLlm => {
                let description = step.inputs.get("description").and_then(Value::as_str).unwrap_or("");
                let response = ctx
                    .llm_gateway
                    .generate("reasoning", "", description, &[], GenerateOptions::default())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({ "text": response.text }))
            }
        }
    }

    async fn run_agent(&self, ctx: &RuntimeContext, agent_id: &str, step: &Step) -> Result<Value, String> {
        let agent = ctx.registry.agent(agent_id).await;
        let (_, _, system_prompt) = ctx
            .registry
            .resolve_prompt(
                Stage::Execution,
                "execution",
                &ScopeHints { agent_id: Some(agent_id.to_string()), legacy_exempt: true, ..Default::default() },
            )
            .await
            .unwrap_or_default();
        let user_prompt = step.inputs.get("description").and_then(Value::as_str).unwrap_or("");

        let start = Instant::now();
        let result = ctx
            .llm_gateway
            .generate("reasoning", &system_prompt, user_prompt, &[], GenerateOptions::default())
            .await;
        let latency_ms = start.elapsed().as_millis() as f64;

        match result {
            Ok(response) => {
                if agent.is_some() {
                    ctx.registry.record_agent_outcome(agent_id, true, latency_ms).await;
                }
                Ok(json!({ "text": response.text }))
            }
            Err(err) => {
                if agent.is_some() {
                    ctx.registry.record_agent_outcome(agent_id, false, latency_ms).await;
                }
                Err(err.to_string())
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

enum StepOutcome {
    Succeeded(Value),
    Routed { chosen_output: Value, skip: Vec<Id> },
}
