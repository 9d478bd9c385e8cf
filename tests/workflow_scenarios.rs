//! End-to-end scenarios driving a full `RuntimeContext` through
//! `StageMachine::handle_request`: the same entry point a real caller uses.

use agentkernel::{StageHandler, StageMachine, StageMachineError, WorkflowStatus};
use agentkernel::approval::{ApprovalGate, DefaultPlanPolicy};
use agentkernel::checkpoint::CheckpointStore;
use agentkernel::config::KernelConfig;
use agentkernel::event_log::EventLog;
use agentkernel::llm_gateway::{GenerateOptions, GenerateResponse, LlmEndpoint, LlmError, LlmGateway, TokenUsage};
use agentkernel::planner::Planner;
use agentkernel::registry::Registry;
use agentkernel::runtime_context::RuntimeContext;
use agentkernel::sandbox::{Sandbox, SandboxLimits};
use agentkernel::task_queue::{TaskQueue, TaskQueueConfig};
use agentkernel::types::{EntityStatus, PromptAssignment, PromptEntry, RequestType, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

struct ScriptedEndpoint {
    response: String,
}

#[async_trait]
impl LlmEndpoint for ScriptedEndpoint {
    async fn generate(
        &self,
        _system: &str,
        _user: &str,
        _history: &[(String, String)],
        _options: &GenerateOptions,
    ) -> Result<GenerateResponse, LlmError> {
        Ok(GenerateResponse {
            text: self.response.clone(),
            reasoning: None,
            tokens: TokenUsage { prompt_tokens: 1, completion_tokens: 1 },
            latency_ms: 1,
            server_id: "scripted".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn server_id(&self) -> &str {
        "scripted"
    }
}

struct PassThrough;
#[async_trait]
impl StageHandler for PassThrough {
    async fn handle(
        &self,
        _ctx: &RuntimeContext,
        _workflow: &agentkernel::types::Workflow,
        _prompt_body: &str,
    ) -> Result<String, String> {
        Ok("ok".to_string())
    }
}

async fn context_with_response(response_json: &str) -> RuntimeContext {
    let registry = Arc::new(Registry::new());
    for stage in [
        Stage::Interpretation,
        Stage::ValidatorA,
        Stage::Routing,
        Stage::Planning,
        Stage::ValidatorB,
        Stage::Execution,
        Stage::Reflection,
        Stage::RegistryUpdate,
    ] {
        registry
            .register_prompt(PromptEntry {
                prompt_id: format!("{stage:?}-prompt"),
                version: 1,
                body: "do the thing".to_string(),
                status: EntityStatus::Active,
                metrics: Default::default(),
            })
            .await;
        registry
            .register_assignment(PromptAssignment {
                stage,
                component_role: stage.component_role().to_string(),
                scope: None,
                prompt_id: format!("{stage:?}-prompt"),
                prompt_version: 1,
                legacy_exempt: false,
            })
            .await;
    }

    let endpoint: Arc<dyn LlmEndpoint> = Arc::new(ScriptedEndpoint { response: response_json.to_string() });
    let llm_gateway = Arc::new(LlmGateway::new(vec![(endpoint, 4)], Duration::from_secs(0)));
    let planner = Arc::new(Planner::new(
        llm_gateway.clone(),
        registry.clone(),
        agentkernel::config::default_evaluation_weights(),
    ));

    RuntimeContext::new(
        Arc::new(KernelConfig::default()),
        Arc::new(EventLog::new()),
        registry,
        llm_gateway,
        planner,
        Arc::new(Sandbox::new(SandboxLimits { wall_ms: 2000, mem_mb: 64, cpu_ms: 2000 })),
        Arc::new(CheckpointStore::new()),
        Arc::new(ApprovalGate::new(Box::new(DefaultPlanPolicy), 24)),
        Arc::new(TaskQueue::new(TaskQueueConfig { max_retries: 1, base_backoff_ms: 10, max_backoff_ms: 100, max_concurrent: 4 })),
    )
}

fn stage_machine_with_passthrough_handlers() -> StageMachine {
    StageMachine::new()
        .with_handler(Stage::Interpretation, Arc::new(PassThrough))
        .with_handler(Stage::ValidatorA, Arc::new(PassThrough))
        .with_handler(Stage::Routing, Arc::new(PassThrough))
        .with_handler(Stage::Planning, Arc::new(PassThrough))
        .with_handler(Stage::ValidatorB, Arc::new(PassThrough))
        .with_handler(Stage::Execution, Arc::new(PassThrough))
        .with_handler(Stage::Reflection, Arc::new(PassThrough))
        .with_handler(Stage::RegistryUpdate, Arc::new(PassThrough))
}

/// A simple question is routed straight from `Routing` to `Execution`,
/// skipping `Planning`/`ValidatorB`, and reaches `Completed` without anyone
/// pausing for a human decision.
#[tokio::test]
async fn simple_question_completes_without_approval() {
    let ctx = context_with_response("{}").await;
    let machine = stage_machine_with_passthrough_handlers();

    let workflow = machine
        .handle_request(&ctx, "sess-simple", RequestType::SimpleQuestion)
        .await
        .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let events = ctx.event_log.by_workflow(&workflow.workflow_id, None).await;
    assert_eq!(events.len(), 6);
}

/// A complex task's plan is always routed through `RequiresApproval`, and a
/// human rejection never auto-escalates to execution.
#[tokio::test]
async fn complex_task_requires_approval_and_rejection_blocks_execution() {
    let ctx = context_with_response("{}").await;

    let plan = agentkernel::types::Plan {
        plan_id: agentkernel::types::new_id(),
        workflow_id: agentkernel::types::new_id(),
        version: 1,
        goal: "ship a risky migration".to_string(),
        strategy: agentkernel::types::Strategy::default(),
        steps: vec![],
        risk_score: 0.8,
        alternatives: vec![],
        status: agentkernel::types::PlanStatus::Draft,
    };

    let decision = ctx
        .approvals
        .evaluate_plan(RequestType::ComplexTask, &plan, &ctx.registry, "high", "escalate to a human")
        .await;

    let agentkernel::approval::PlanDecision::RequiresApproval { request_id } = decision else {
        panic!("complex tasks must always require approval");
    };

    ctx.approvals
        .decide(&request_id, agentkernel::types::ApprovalStatus::Rejected, Some("too risky".to_string()))
        .await
        .unwrap();

    let status = ctx.approvals.status(&request_id).await.unwrap();
    assert_eq!(status, agentkernel::types::ApprovalStatus::Rejected);
}

/// A step that exhausts its retries triggers exactly one re-plan; the
/// re-planned version increments and carries the failure reason forward.
#[tokio::test]
async fn retry_exhaustion_triggers_a_single_replan() {
    let ctx = context_with_response("{}").await;

    ctx.sandbox
        .register_tool(
            "always_fails",
            agentkernel::sandbox::ToolSchema::default(),
            Arc::new(|_args| Err("simulated tool failure".to_string())),
        )
        .await;

    let plan_id = agentkernel::types::new_id();
    let workflow_id = agentkernel::types::new_id();
    let failing_step = agentkernel::types::Step {
        step_id: agentkernel::types::new_id(),
        plan_id: plan_id.clone(),
        index: 0,
        step_type: agentkernel::types::StepType::Action,
        executor_ref: agentkernel::types::ExecutorRef::Tool { tool_id: "always_fails".to_string() },
        inputs: serde_json::json!({}),
        outputs: None,
        dependencies: vec![],
        timeout_ms: 10,
        retry_policy: agentkernel::types::RetryPolicy { max_attempts: 1, backoff_base_ms: 0, jitter_ms: 0 },
        approval_required: false,
        risk_level: agentkernel::types::RiskLevel::Low,
        function_call: None,
        state: agentkernel::types::StepState::Waiting,
        attempts: 0,
    };

    let mut plan = agentkernel::types::Plan {
        plan_id,
        workflow_id,
        version: 1,
        goal: "goal".to_string(),
        strategy: agentkernel::types::Strategy::default(),
        steps: vec![failing_step],
        risk_score: 0.1,
        alternatives: vec![],
        status: agentkernel::types::PlanStatus::Approved,
    };

    let executor = agentkernel::Executor::new();
    let result = executor.execute(&ctx, &mut plan).await;

    // The scripted re-plan response ("{}") has no steps, so the
    // re-planner's decomposition is empty and re-planning itself fails —
    // the executor surfaces that as `ReplanFailed`, not an infinite loop.
    assert!(matches!(result, Err(agentkernel::ExecutorError::ReplanFailed(_))));
}

/// A tool that overruns its wall-time limit is killed by the sandbox and
/// the plan fails outright; the executor does not re-plan a timeout.
#[tokio::test]
async fn sandbox_timeout_fails_the_plan_without_replanning() {
    let ctx = context_with_response("{}").await;
    ctx.sandbox
        .register_tool(
            "slow",
            agentkernel::sandbox::ToolSchema::default(),
            Arc::new(|_args| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(serde_json::Value::Null)
            }),
        )
        .await;

    let plan_id = agentkernel::types::new_id();
    let slow_step = agentkernel::types::Step {
        step_id: agentkernel::types::new_id(),
        plan_id: plan_id.clone(),
        index: 0,
        step_type: agentkernel::types::StepType::Action,
        executor_ref: agentkernel::types::ExecutorRef::Tool { tool_id: "slow".to_string() },
        inputs: serde_json::json!({}),
        outputs: None,
        dependencies: vec![],
        timeout_ms: 10,
        retry_policy: agentkernel::types::RetryPolicy::single_attempt(),
        approval_required: false,
        risk_level: agentkernel::types::RiskLevel::Low,
        function_call: None,
        state: agentkernel::types::StepState::Waiting,
        attempts: 0,
    };

    let mut plan = agentkernel::types::Plan {
        plan_id,
        workflow_id: agentkernel::types::new_id(),
        version: 1,
        goal: "goal".to_string(),
        strategy: agentkernel::types::Strategy::default(),
        steps: vec![slow_step],
        risk_score: 0.1,
        alternatives: vec![],
        status: agentkernel::types::PlanStatus::Approved,
    };

    // single_attempt() means the step has no retries left the first time
    // it times out, and a sandbox violation is never worth re-planning
    // around, so the executor fails the plan directly without ever calling
    // the planner's replan.
    let executor = agentkernel::Executor::new();
    let result = executor.execute(&ctx, &mut plan).await;
    assert!(matches!(result, Err(agentkernel::ExecutorError::StepFailed { .. })));
    assert_eq!(plan.status, agentkernel::types::PlanStatus::Failed);
}

/// `execute_plan_for` refuses to run a plan for a workflow that never
/// reached the execution stage through `StageMachine` — the only supported
/// path into plan execution is `handle_request`.
#[tokio::test]
async fn plan_execution_outside_a_bound_workflow_is_rejected() {
    let ctx = context_with_response("{}").await;
    let machine = StageMachine::new();
    let workflow = agentkernel::types::Workflow::new("sess-bypass", RequestType::SimpleQuestion);

    let mut plan = agentkernel::types::Plan {
        plan_id: agentkernel::types::new_id(),
        workflow_id: workflow.workflow_id.clone(),
        version: 1,
        goal: "goal".to_string(),
        strategy: agentkernel::types::Strategy::default(),
        steps: vec![],
        risk_score: 0.0,
        alternatives: vec![],
        status: agentkernel::types::PlanStatus::Approved,
    };

    let result = machine.execute_plan_for(&ctx, &workflow, &mut plan).await;
    assert!(matches!(result, Err(StageMachineError::BypassRejected { .. })));
}

/// Alternative-plan selection picks the highest-scoring candidate and
/// records the rest as `alternatives` rather than discarding them.
#[tokio::test]
async fn alternative_plan_selection_prefers_the_highest_scorer() {
    let draft = serde_json::json!({
        "goal": "ship it",
        "steps": [
            {"description": "do it", "tool_id": null, "agent_id": null, "depends_on": [], "requires_approval": false}
        ]
    })
    .to_string();

    let ctx = context_with_response(&draft).await;
    let (winner, scored) = ctx
        .planner
        .generate_and_select("wf-alt", "ship it", &[])
        .await
        .unwrap();

    assert_eq!(scored.len(), 3);
    assert_eq!(winner.alternatives.len(), 2);
    let winner_score = scored.iter().find(|(p, _)| p.plan_id == winner.plan_id).unwrap().1;
    assert!(scored.iter().all(|(_, score)| *score <= winner_score));
}
