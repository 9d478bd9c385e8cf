//! Turns an analyzed task into an ordered, risk-scored `Plan`.
//!
//! Plan extraction runs a four-stage cascade over the model's response to
//! pull out structured JSON even when the model wraps it in prose. Alternative
//! plans are generated by spawning one variant per strategy in parallel,
//! joining the results, and tolerating individual variant failures.

use crate::llm_gateway::{GenerateOptions, LlmGateway};
use crate::registry::{Registry, ScopeHints};
use crate::types::{
    new_id, ExecutorRef, Id, LearningPattern, Plan, PlanStatus, RetryPolicy, RiskLevel, Stage,
    Step, StepState, StepType, Strategy,
};
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum PlannerError {
    NoParsableResponse,
    EmptyDecomposition,
    AllAlternativesFailed,
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::NoParsableResponse => write!(f, "no plan JSON could be extracted from the model response"),
            PlannerError::EmptyDecomposition => write!(f, "decomposition produced zero steps"),
            PlannerError::AllAlternativesFailed => write!(f, "every plan alternative failed to generate"),
        }
    }
}

impl std::error::Error for PlannerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternativeStance {
    Conservative,
    Balanced,
    Aggressive,
}

impl AlternativeStance {
    fn prompt_suffix(self) -> &'static str {
        match self {
            AlternativeStance::Conservative => {
                "Favor the fewest, safest steps. Prefer well-known tools over novel ones."
            }
            AlternativeStance::Balanced => "Balance thoroughness against step count and risk.",
            AlternativeStance::Aggressive => {
                "Favor the most direct path to the goal even if it uses higher-risk steps."
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StepDraft {
    description: String,
    #[serde(default)]
    tool_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    requires_approval: bool,
}

#[derive(Debug, Deserialize)]
struct PlanDraft {
    goal: String,
    steps: Vec<StepDraft>,
}

/// Scan for a JSON object in free-form model text. Four stages, each tried
/// in order against the whole response:
/// 1. the response parses as JSON outright,
/// 2. a balanced-brace scan from the first `{` to its matching `}`,
/// 3. the same scan with trailing commas before `}`/`]` stripped,
/// 4. a fenced code block (```json ... ``` or ``` ... ```) extracted first.
fn extract_json(response: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(response.trim()) {
        return Some(value);
    }

    if let Some(candidate) = balanced_brace_scan(response) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            return Some(value);
        }
        let destrailed = strip_trailing_commas(&candidate);
        if let Ok(value) = serde_json::from_str::<Value>(&destrailed) {
            return Some(value);
        }
    }

    if let Some(fenced) = extract_fenced_block(response) {
        return extract_json(&fenced);
    }

    None
}

fn balanced_brace_scan(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let fence_start = text.find("```")?;
    let after_fence = &text[fence_start + 3..];
    let after_lang = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let end = after_lang.find("```")?;
    Some(after_lang[..end].trim().to_string())
}

/// Generates plans via an LLM gateway, decomposes them into a step DAG,
/// scores risk, and optionally generates and picks among strategy
/// alternatives in parallel.
pub struct Planner {
    llm: Arc<LlmGateway>,
    registry: Arc<Registry>,
    evaluation_weights: HashMap<String, f64>,
}

impl Planner {
    pub fn new(llm: Arc<LlmGateway>, registry: Arc<Registry>, evaluation_weights: HashMap<String, f64>) -> Self {
        Self {
            llm,
            registry,
            evaluation_weights,
        }
    }

    /// Generate a single candidate plan under the given stance, with
    /// procedural recall feeding prior learning patterns into the prompt.
    pub async fn generate_candidate(
        &self,
        workflow_id: &str,
        goal: &str,
        stance: AlternativeStance,
        recalled_patterns: &[LearningPattern],
    ) -> Result<Plan, PlannerError> {
        let (_, _, system_prompt) = self
            .registry
            .resolve_prompt(Stage::Planning, "planning", &ScopeHints { legacy_exempt: true, ..Default::default() })
            .await
            .unwrap_or_default();

        let recall_hint = if recalled_patterns.is_empty() {
            String::new()
        } else {
            format!(
                "\nKnown prior patterns: {}",
                recalled_patterns
                    .iter()
                    .map(|p| format!("{} (success_rate={:.2})", p.signature, p.observed_success_rate))
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        };

        let user_prompt = format!(
            "Goal: {goal}\n{}{recall_hint}\nRespond with JSON: {{\"goal\": string, \"steps\": [{{\"description\": string, \"tool_id\": string|null, \"agent_id\": string|null, \"depends_on\": [int], \"requires_approval\": bool}}]}}",
            stance.prompt_suffix()
        );

        let response = self
            .llm
            .generate(
                "reasoning",
                &system_prompt,
                &user_prompt,
                &[],
                GenerateOptions::default(),
            )
            .await
            .map_err(|_| PlannerError::NoParsableResponse)?;

        let draft = self.parse_plan_draft(&response.text)?;
        self.build_plan(workflow_id, draft, recalled_patterns).await
    }

    fn parse_plan_draft(&self, response_text: &str) -> Result<PlanDraft, PlannerError> {
        let value = extract_json(response_text).ok_or(PlannerError::NoParsableResponse)?;
        serde_json::from_value(value).map_err(|_| PlannerError::NoParsableResponse)
    }

    /// Decompose a draft into a step DAG (dependency order assigns `index`)
    /// and compute the risk score with the weighted heuristic below.
    async fn build_plan(
        &self,
        workflow_id: &str,
        draft: PlanDraft,
        recalled_patterns: &[LearningPattern],
    ) -> Result<Plan, PlannerError> {
        if draft.steps.is_empty() {
            return Err(PlannerError::EmptyDecomposition);
        }

        let plan_id = new_id();
        let order = topological_order(&draft.steps);
        let mut known = 0usize;
        let mut steps = Vec::with_capacity(draft.steps.len());

        // Assign each step's final id up front so dependency edges (which
        // reference other *draft* indices) can resolve to real step ids
        // before those steps are built.
        let step_ids: Vec<Id> = (0..order.len()).map(|_| new_id()).collect();
        let position_of_draft_index: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &draft_idx)| (draft_idx, pos)).collect();

        for (index, &draft_idx) in order.iter().enumerate() {
            let draft_step = &draft.steps[draft_idx];
            let executor_ref = if let Some(tool_id) = &draft_step.tool_id {
                if self.registry.tool(tool_id).await.is_some() {
                    known += 1;
                }
                ExecutorRef::Tool { tool_id: tool_id.clone() }
            } else if let Some(agent_id) = &draft_step.agent_id {
                if self.registry.agent(agent_id).await.is_some() {
                    known += 1;
                }
                ExecutorRef::Agent { agent_id: agent_id.clone() }
            } else {
                ExecutorRef::InlineLlm
            };

            let risk_level = if draft_step.requires_approval {
                RiskLevel::High
            } else if draft_step.tool_id.is_none() && draft_step.agent_id.is_none() {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            };

            steps.push(Step {
                step_id: step_ids[index].clone(),
                plan_id: plan_id.clone(),
                index,
                step_type: StepType::Action,
                executor_ref,
                inputs: serde_json::json!({ "description": draft_step.description }),
                outputs: None,
                dependencies: draft_step
                    .depends_on
                    .iter()
                    .filter_map(|d| position_of_draft_index.get(d))
                    .map(|&pos| step_ids[pos].clone())
                    .collect(),
                timeout_ms: 30_000,
                retry_policy: RetryPolicy { max_attempts: 2, backoff_base_ms: 500, jitter_ms: 100 },
                approval_required: draft_step.requires_approval,
                risk_level,
                function_call: None,
                state: StepState::Waiting,
                attempts: 0,
            });
        }

        let known_tool_ratio = known as f64 / steps.len() as f64;
        let novelty_score = if recalled_patterns.is_empty() { 1.0 } else { 0.0 };

        let mut plan = Plan {
            plan_id,
            workflow_id: workflow_id.to_string(),
            version: 1,
            goal: draft.goal,
            strategy: Strategy::default(),
            steps,
            risk_score: 0.0,
            alternatives: Vec::new(),
            status: PlanStatus::Draft,
        };

        plan.risk_score = risk_score(&plan, known_tool_ratio, novelty_score);
        Ok(plan)
    }

    /// Generate `Conservative`/`Balanced`/`Aggressive` alternatives in
    /// parallel (mirroring `Council::execute_parallel`'s spawn-then-join
    /// shape), score each, and return the highest scorer along with the
    /// full ranked list.
    pub async fn generate_and_select(
        &self,
        workflow_id: &str,
        goal: &str,
        recalled_patterns: &[LearningPattern],
    ) -> Result<(Plan, Vec<(Plan, f64)>), PlannerError> {
        let stances = [
            AlternativeStance::Conservative,
            AlternativeStance::Balanced,
            AlternativeStance::Aggressive,
        ];

        let mut tasks = Vec::new();
        for stance in stances {
            let planner_clone = self.clone_shared();
            let workflow_id = workflow_id.to_string();
            let goal = goal.to_string();
            let patterns = recalled_patterns.to_vec();
            tasks.push(tokio::spawn(async move {
                planner_clone
                    .generate_candidate(&workflow_id, &goal, stance, &patterns)
                    .await
            }));
        }

        let mut scored = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(plan)) => {
                    let score = self.score(&plan);
                    scored.push((plan, score));
                }
                Ok(Err(err)) => warn!("alternative generation failed: {err}"),
                Err(join_err) => warn!("alternative generation task panicked: {join_err}"),
            }
        }

        if scored.is_empty() {
            return Err(PlannerError::AllAlternativesFailed);
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut winner = scored[0].0.clone();
        winner.alternatives = scored[1..].iter().map(|(p, _)| p.plan_id.clone()).collect();

        info!(
            "selected plan {} (score={:.3}) among {} alternatives",
            winner.plan_id, scored[0].1, scored.len()
        );

        Ok((winner, scored))
    }

    /// Weighted score over `time`, `approval_points`,
    /// `risk`, `efficiency` combined by the configured weights. Higher is
    /// better; `risk` and `approval_points` contribute negatively.
    fn score(&self, plan: &Plan) -> f64 {
        let time_estimate = 1.0 / (1.0 + plan.steps.len() as f64);
        let approval_points = plan.frac_requires_approval();
        let risk = plan.risk_score;
        let efficiency = 1.0 - plan.frac_high_risk_steps();

        let w = |key: &str| self.evaluation_weights.get(key).copied().unwrap_or(0.25);
        w("time") * time_estimate - w("approval_points") * approval_points - w("risk") * risk
            + w("efficiency") * efficiency
    }

    fn clone_shared(&self) -> Arc<Planner> {
        // Planner holds only Arc'd fields; cheaply clonable for spawned tasks.
        Arc::new(Planner {
            llm: self.llm.clone(),
            registry: self.registry.clone(),
            evaluation_weights: self.evaluation_weights.clone(),
        })
    }

    /// Re-plan after an execution failure: bump the version and regenerate,
    /// carrying the failure reason into the prompt so the new plan avoids
    /// the same step shape (the executor's "replan once" escalation).
    pub async fn replan(
        &self,
        previous: &Plan,
        failure_reason: &str,
        recalled_patterns: &[LearningPattern],
    ) -> Result<Plan, PlannerError> {
        let goal = format!(
            "{}\nThe previous attempt failed: {failure_reason}. Avoid repeating that approach.",
            previous.goal
        );
        let mut plan = self
            .generate_candidate(&previous.workflow_id, &goal, AlternativeStance::Conservative, recalled_patterns)
            .await?;
        plan.version = previous.version + 1;
        plan.goal = previous.goal.clone();
        Ok(plan)
    }
}

fn risk_score(plan: &Plan, known_tool_ratio: f64, novelty_score: f64) -> f64 {
    let score = 0.2 * plan.frac_high_risk_steps()
        + 0.2 * plan.frac_requires_approval()
        + 0.3 * (1.0 - known_tool_ratio)
        + 0.3 * novelty_score;
    score.clamp(0.0, 1.0)
}

/// Kahn's algorithm over `depends_on` indices; ties break by first-seen
/// (draft order), not insertion-into-queue order, so two independently
/// ready steps keep the order the model listed them in. Cycles fall back
/// to draft order rather than erroring, since a malformed model response
/// shouldn't crash the planner.
fn topological_order(steps: &[StepDraft]) -> Vec<usize> {
    let n = steps.len();
    let mut in_degree: Vec<usize> =
        steps.iter().map(|s| s.depends_on.iter().filter(|&&d| d < n).count()).collect();

    let mut ready: std::collections::VecDeque<usize> =
        (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    let mut consumed = vec![false; n];

    while let Some(next) = ready.pop_front() {
        order.push(next);
        consumed[next] = true;
        for (i, step) in steps.iter().enumerate() {
            if !consumed[i] && step.depends_on.contains(&next) {
                in_degree[i] = in_degree[i].saturating_sub(1);
                if in_degree[i] == 0 {
                    ready.push_back(i);
                }
            }
        }
    }

    if order.len() != n {
        return (0..n).collect();
    }
    order
}
