//! Shared handles passed into every component operation instead of global
//! state.
//!
//! None of this crate's modules reach for ambient statics — every
//! `Agent`/`Council`/`Orchestration` takes its collaborators (a
//! `ClientWrapper`, a `ToolRegistry`) as constructor arguments. `RuntimeContext`
//! generalizes that to the kernel's five shared services, bundled into one
//! `Arc`-cloneable struct so call sites don't thread five parameters
//! through every function signature.

use crate::approval::ApprovalGate;
use crate::checkpoint::CheckpointStore;
use crate::config::KernelConfig;
use crate::event_log::EventLog;
use crate::llm_gateway::LlmGateway;
use crate::planner::Planner;
use crate::registry::Registry;
use crate::sandbox::Sandbox;
use crate::task_queue::TaskQueue;
use std::sync::Arc;

/// Bundles every shared service a pipeline stage needs. Cheap to clone —
/// every field is an `Arc` — so a `RuntimeContext` can be passed by value
/// into spawned tasks without lifetime gymnastics.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<KernelConfig>,
    pub event_log: Arc<EventLog>,
    pub registry: Arc<Registry>,
    pub llm_gateway: Arc<LlmGateway>,
    pub planner: Arc<Planner>,
    pub sandbox: Arc<Sandbox>,
    pub checkpoints: Arc<CheckpointStore>,
    pub approvals: Arc<ApprovalGate>,
    pub task_queue: Arc<TaskQueue>,
}

impl RuntimeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<KernelConfig>,
        event_log: Arc<EventLog>,
        registry: Arc<Registry>,
        llm_gateway: Arc<LlmGateway>,
        planner: Arc<Planner>,
        sandbox: Arc<Sandbox>,
        checkpoints: Arc<CheckpointStore>,
        approvals: Arc<ApprovalGate>,
        task_queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            config,
            event_log,
            registry,
            llm_gateway,
            planner,
            sandbox,
            checkpoints,
            approvals,
            task_queue,
        }
    }
}
