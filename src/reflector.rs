//! Consumes a concluded plan's outcomes, scores plan quality, updates
//! prompt metrics, and emits `LearningPattern` proposals at three
//! granularities: micro (per step), meso (per step-group), and macro (per
//! plan). Patterns are proposals only — nothing here mutates a registry
//! entry directly.

use crate::registry::Registry;
use crate::types::{new_id, LearningPattern, LearningPatternKind, Plan, Step, StepState};
use log::info;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A concluded plan's quality, from the weighted formula below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanQuality {
    pub success_rate: f64,
    pub quality: f64,
}

/// Steps grouped for meso-level reflection. Grouping is by contiguous
/// topological position in fixed-size bands rather than a real dependency
/// clustering — a cheap-to-compute step-group that stays
/// stable across replans of the same shape.
const MESO_GROUP_SIZE: usize = 3;

pub struct Reflector {
    registry: Arc<Registry>,
}

impl Reflector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// `quality = success_rate*0.6 + (1 - risk_score)*0.2 + min(1,
    /// expected_ms/actual_ms)*0.2`.
    pub fn plan_quality(&self, plan: &Plan, expected_ms: u64, actual_ms: u64) -> PlanQuality {
        let total = plan.steps.len().max(1) as f64;
        let succeeded = plan.steps.iter().filter(|s| s.state == StepState::Succeeded).count() as f64;
        let success_rate = succeeded / total;
        let timeliness = if actual_ms == 0 {
            1.0
        } else {
            (expected_ms as f64 / actual_ms as f64).min(1.0)
        };
        let quality = success_rate * 0.6 + (1.0 - plan.risk_score) * 0.2 + timeliness * 0.2;
        PlanQuality { success_rate, quality }
    }

    /// Per-`prompt_id` moving-average latency and success/failure tracking.
    pub async fn record_prompt_outcome(&self, prompt_id: &str, success: bool, latency_ms: f64) {
        self.registry.record_prompt_outcome(prompt_id, success, latency_ms).await;
    }

    /// Emit micro/meso/macro `LearningPattern`s for a concluded plan. These
    /// are proposals only, tagged with a component decision source, and are
    /// never auto-applied to an active prompt or agent.
    pub fn reflect(&self, plan: &Plan, expected_ms: u64, actual_ms: u64) -> Vec<LearningPattern> {
        let mut patterns = Vec::with_capacity(plan.steps.len() + plan.steps.len() / MESO_GROUP_SIZE + 1);

        for step in &plan.steps {
            patterns.push(LearningPattern {
                pattern_id: new_id(),
                kind: micro_kind(step),
                signature: step_signature(plan, step),
                observed_success_rate: if step.state == StepState::Succeeded { 1.0 } else { 0.0 },
                sample_count: 1,
            });
        }

        for group in plan.steps.chunks(MESO_GROUP_SIZE) {
            if group.is_empty() {
                continue;
            }
            let succeeded = group.iter().filter(|s| s.state == StepState::Succeeded).count();
            patterns.push(LearningPattern {
                pattern_id: new_id(),
                kind: LearningPatternKind::Strategy,
                signature: group_signature(plan, group),
                observed_success_rate: succeeded as f64 / group.len() as f64,
                sample_count: group.len() as u32,
            });
        }

        let quality = self.plan_quality(plan, expected_ms, actual_ms);
        patterns.push(LearningPattern {
            pattern_id: new_id(),
            kind: LearningPatternKind::Strategy,
            signature: format!("plan:{}:goal={}", plan.plan_id, structural_hash(&plan.goal)),
            observed_success_rate: quality.success_rate,
            sample_count: 1,
        });

        info!(
            "reflected on plan {}: {} patterns emitted, quality={:.3}",
            plan.plan_id,
            patterns.len(),
            quality.quality
        );

        patterns
    }
}

fn micro_kind(step: &Step) -> LearningPatternKind {
    match &step.executor_ref {
        crate::types::ExecutorRef::Tool { .. } => LearningPatternKind::ToolSelection,
        crate::types::ExecutorRef::Agent { .. } | crate::types::ExecutorRef::Team { .. } => {
            LearningPatternKind::Strategy
        }
        crate::types::ExecutorRef::InlineLlm => {
            if step.state == StepState::Failed {
                LearningPatternKind::ErrorRecovery
            } else {
                LearningPatternKind::Prompt
            }
        }
    }
}

fn step_signature(plan: &Plan, step: &Step) -> String {
    format!("plan:{}:step:{}:fingerprint={}", plan.plan_id, step.index, structural_hash(&step.inputs.to_string()))
}

fn group_signature(plan: &Plan, group: &[Step]) -> String {
    let indices: Vec<String> = group.iter().map(|s| s.index.to_string()).collect();
    format!("plan:{}:group:[{}]", plan.plan_id, indices.join(","))
}

/// Stable fingerprint of free-form text, used as the `LearningPattern`
/// signature's structural component.
fn structural_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::types::{new_id, ExecutorRef, FunctionCall, PlanStatus, RetryPolicy, RiskLevel, Strategy, StepType};

    fn step(index: usize, state: StepState) -> Step {
        let _ = FunctionCall { name: String::new(), arguments: serde_json::Value::Null };
        Step {
            step_id: new_id(),
            plan_id: "p1".to_string(),
            index,
            step_type: StepType::Action,
            executor_ref: ExecutorRef::InlineLlm,
            inputs: serde_json::json!({ "description": format!("step {index}") }),
            outputs: None,
            dependencies: vec![],
            timeout_ms: 1000,
            retry_policy: RetryPolicy::single_attempt(),
            approval_required: false,
            risk_level: RiskLevel::Low,
            function_call: None,
            state,
            attempts: 0,
        }
    }

    fn plan(steps: Vec<Step>, risk_score: f64) -> Plan {
        Plan {
            plan_id: "p1".to_string(),
            workflow_id: "wf1".to_string(),
            version: 1,
            goal: "ship it".to_string(),
            strategy: Strategy::default(),
            steps,
            risk_score,
            alternatives: vec![],
            status: PlanStatus::Completed,
        }
    }

    #[test]
    fn quality_rewards_full_success_low_risk_and_speed() {
        let reflector = Reflector::new(Arc::new(Registry::new()));
        let p = plan(vec![step(0, StepState::Succeeded), step(1, StepState::Succeeded)], 0.1);
        let quality = reflector.plan_quality(&p, 1000, 1000);
        assert!((quality.success_rate - 1.0).abs() < 1e-9);
        assert!(quality.quality > 0.9);
    }

    #[test]
    fn quality_penalizes_failures_and_overrun_time() {
        let reflector = Reflector::new(Arc::new(Registry::new()));
        let p = plan(vec![step(0, StepState::Succeeded), step(1, StepState::Failed)], 0.5);
        let quality = reflector.plan_quality(&p, 1000, 4000);
        assert!((quality.success_rate - 0.5).abs() < 1e-9);
        assert!(quality.quality < 0.6);
    }

    #[test]
    fn reflect_emits_one_micro_pattern_per_step_plus_meso_and_macro() {
        let reflector = Reflector::new(Arc::new(Registry::new()));
        let p = plan(vec![step(0, StepState::Succeeded), step(1, StepState::Succeeded)], 0.2);
        let patterns = reflector.reflect(&p, 1000, 1200);
        // 2 micro + 1 meso group (chunk size 3 covers both) + 1 macro.
        assert_eq!(patterns.len(), 4);
    }

    #[tokio::test]
    async fn record_prompt_outcome_updates_registry_metrics() {
        let registry = Arc::new(Registry::new());
        registry
            .register_prompt(crate::types::PromptEntry {
                prompt_id: "p1".to_string(),
                version: 1,
                body: "body".to_string(),
                status: crate::types::EntityStatus::Active,
                metrics: Default::default(),
            })
            .await;
        let reflector = Reflector::new(registry.clone());
        reflector.record_prompt_outcome("p1", true, 50.0).await;
        let metrics = registry.prompt_metrics("p1").await.unwrap();
        assert_eq!(metrics.successes, 1);
    }
}
