//! Kernel configuration.
//!
//! A plain struct built with `with_*` builder methods and a `Default` impl
//! carrying the documented fallback values. No config-file parsing
//! dependency is introduced — callers construct this however they want
//! (env vars, a CLI flag parser, a settings service upstream of this crate).

use std::collections::HashMap;
use std::time::Duration;

/// One configured LLM endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub max_concurrent: usize,
    pub priority: i32,
}

/// Evaluation weights used by the planner's alternative scorer. Keys are
/// `"time"`, `"approval_points"`, `"risk"`, `"efficiency"`.
pub type EvaluationWeights = HashMap<String, f64>;

pub fn default_evaluation_weights() -> EvaluationWeights {
    let mut weights = HashMap::new();
    weights.insert("time".to_string(), 0.3);
    weights.insert("approval_points".to_string(), 0.2);
    weights.insert("risk".to_string(), 0.3);
    weights.insert("efficiency".to_string(), 0.2);
    weights
}

/// Default retry/backoff policy for the task queue.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 3_600_000,
        }
    }
}

/// Default resource/time limits for sandboxed tool execution.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub wall_ms: u64,
    pub mem_mb: u64,
    pub cpu_ms: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_ms: 30_000,
            mem_mb: 512,
            cpu_ms: 30_000,
        }
    }
}

/// Feature flags.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    pub generate_alternatives: bool,
    pub web_search: bool,
}

/// Global kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub llm_endpoints: Vec<EndpointConfig>,
    pub planner_default_alternatives: usize,
    pub planner_evaluation_weights: EvaluationWeights,
    pub approval_default_deadline_hours: u32,
    pub queue_defaults: QueueDefaults,
    pub sandbox_limits: SandboxLimits,
    pub features: FeatureFlags,
}

impl Default for KernelConfig {
    /// Zero alternatives, a 24h approval deadline, the queue/sandbox
    /// defaults above, and every feature flag off.
    fn default() -> Self {
        Self {
            llm_endpoints: Vec::new(),
            planner_default_alternatives: 0,
            planner_evaluation_weights: default_evaluation_weights(),
            approval_default_deadline_hours: 24,
            queue_defaults: QueueDefaults::default(),
            sandbox_limits: SandboxLimits::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl KernelConfig {
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.llm_endpoints.push(endpoint);
        self
    }

    pub fn with_planner_default_alternatives(mut self, n: usize) -> Self {
        self.planner_default_alternatives = n;
        self
    }

    pub fn with_approval_deadline_hours(mut self, hours: u32) -> Self {
        self.approval_default_deadline_hours = hours;
        self
    }

    pub fn approval_deadline(&self) -> Duration {
        Duration::from_secs(self.approval_default_deadline_hours as u64 * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_fallbacks() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.planner_default_alternatives, 0);
        assert_eq!(cfg.approval_default_deadline_hours, 24);
        assert_eq!(cfg.queue_defaults.max_retries, 3);
        assert_eq!(cfg.queue_defaults.base_backoff_ms, 1_000);
        assert_eq!(cfg.queue_defaults.max_backoff_ms, 3_600_000);
    }

    #[test]
    fn evaluation_weights_sum_to_one() {
        let weights = default_evaluation_weights();
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
