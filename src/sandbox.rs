//! Executes declared function-calls under resource/time limits.
//!
//! A forbidden-signature prefilter runs before a call is ever spawned, an
//! enforced wall-time limit kills calls that overrun it, and every outcome
//! comes back as a uniform `{status, stdout, stderr, result, resource_usage}`
//! shape regardless of which registered tool produced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxViolationKind {
    Timeout,
    Memory,
    Forbidden,
}

#[derive(Debug, Clone)]
pub enum SandboxError {
    Violation {
        kind: SandboxViolationKind,
        detail: String,
    },
    UnknownTool(String),
    SchemaMismatch(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Violation { kind, detail } => {
                write!(f, "sandbox violation ({kind:?}): {detail}")
            }
            SandboxError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            SandboxError::SchemaMismatch(msg) => write!(f, "schema mismatch: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// A declared function-call parameter, used to validate arguments before
/// the sandbox ever spawns the callable.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub name: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolSchema {
    pub params: Vec<ParamSchema>,
}

impl ToolSchema {
    pub fn validate(&self, arguments: &Value) -> Result<(), SandboxError> {
        let obj = arguments.as_object().ok_or_else(|| {
            SandboxError::SchemaMismatch("arguments must be a JSON object".to_string())
        })?;
        for param in &self.params {
            if param.required && !obj.contains_key(&param.name) {
                return Err(SandboxError::SchemaMismatch(format!(
                    "missing required parameter '{}'",
                    param.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub mem_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub status: String,
    pub stdout: String,
    pub stderr: String,
    pub result: Value,
    pub resource_usage: ResourceUsage,
}

pub type ToolCallable = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

struct RegisteredTool {
    schema: ToolSchema,
    callable: ToolCallable,
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub wall_ms: u64,
    pub mem_mb: u64,
    pub cpu_ms: u64,
}

impl From<crate::config::SandboxLimits> for SandboxLimits {
    fn from(cfg: crate::config::SandboxLimits) -> Self {
        Self {
            wall_ms: cfg.wall_ms,
            mem_mb: cfg.mem_mb,
            cpu_ms: cfg.cpu_ms,
        }
    }
}

/// Executes schema-validated function-calls with enforced wall-time limits
/// and a forbidden-signature prefilter. Never executes free-form LLM text —
/// only calls that already named a registered tool and matched its schema.
pub struct Sandbox {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    forbidden_signatures: Vec<String>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            forbidden_signatures: default_forbidden_signatures(),
            limits,
        }
    }

    pub fn with_forbidden_signature(mut self, signature: impl Into<String>) -> Self {
        self.forbidden_signatures.push(signature.into());
        self
    }

    pub async fn register_tool(&self, name: impl Into<String>, schema: ToolSchema, callable: ToolCallable) {
        self.tools
            .write()
            .await
            .insert(name.into(), RegisteredTool { schema, callable });
    }

    /// Reject calls whose argument payload contains a forbidden signature
    /// before ever spawning the callable.
    fn check_forbidden(&self, name: &str, arguments: &Value) -> Result<(), SandboxError> {
        let haystack = format!("{name} {arguments}");
        for signature in &self.forbidden_signatures {
            if haystack.contains(signature.as_str()) {
                return Err(SandboxError::Violation {
                    kind: SandboxViolationKind::Forbidden,
                    detail: format!("matched forbidden signature '{signature}'"),
                });
            }
        }
        Ok(())
    }

    pub async fn execute(&self, name: &str, arguments: Value) -> Result<SandboxOutcome, SandboxError> {
        self.check_forbidden(name, &arguments)?;

        let (schema, callable) = {
            let tools = self.tools.read().await;
            let tool = tools
                .get(name)
                .ok_or_else(|| SandboxError::UnknownTool(name.to_string()))?;
            (tool.schema.clone(), tool.callable.clone())
        };

        schema.validate(&arguments)?;

        let wall_limit = Duration::from_millis(self.limits.wall_ms);
        let start = Instant::now();

        let call_result = tokio::time::timeout(
            wall_limit,
            tokio::task::spawn_blocking(move || callable(arguments)),
        )
        .await;

        let elapsed = start.elapsed();

        let joined = match call_result {
            Err(_) => {
                return Err(SandboxError::Violation {
                    kind: SandboxViolationKind::Timeout,
                    detail: format!("exceeded {} ms wall-time limit", self.limits.wall_ms),
                });
            }
            Ok(join_result) => join_result.map_err(|e| SandboxError::Violation {
                kind: SandboxViolationKind::Forbidden,
                detail: format!("tool task panicked: {e}"),
            })?,
        };

        match joined {
            Ok(result) => Ok(SandboxOutcome {
                status: "success".to_string(),
                stdout: String::new(),
                stderr: String::new(),
                result,
                resource_usage: ResourceUsage {
                    wall_ms: elapsed.as_millis() as u64,
                    cpu_ms: elapsed.as_millis() as u64,
                    mem_mb: 0,
                },
            }),
            Err(err) => Ok(SandboxOutcome {
                status: "error".to_string(),
                stdout: String::new(),
                stderr: err,
                result: Value::Null,
                resource_usage: ResourceUsage {
                    wall_ms: elapsed.as_millis() as u64,
                    cpu_ms: elapsed.as_millis() as u64,
                    mem_mb: 0,
                },
            }),
        }
    }
}

fn default_forbidden_signatures() -> Vec<String> {
    vec![
        "rm -rf /".to_string(),
        "mkfs".to_string(),
        ":(){ :|:& };:".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxLimits {
            wall_ms: 200,
            mem_mb: 256,
            cpu_ms: 200,
        })
    }

    #[tokio::test]
    async fn executes_a_registered_tool_and_reports_success() {
        let sandbox = sandbox();
        sandbox
            .register_tool(
                "add",
                ToolSchema {
                    params: vec![
                        ParamSchema { name: "a".into(), required: true },
                        ParamSchema { name: "b".into(), required: true },
                    ],
                },
                Arc::new(|args| {
                    let a = args["a"].as_f64().unwrap_or(0.0);
                    let b = args["b"].as_f64().unwrap_or(0.0);
                    Ok(serde_json::json!({ "sum": a + b }))
                }),
            )
            .await;

        let outcome = sandbox
            .execute("add", serde_json::json!({ "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert_eq!(outcome.status, "success");
        assert_eq!(outcome.result["sum"], 5.0);
    }

    #[tokio::test]
    async fn missing_required_parameter_is_rejected_before_execution() {
        let sandbox = sandbox();
        sandbox
            .register_tool(
                "add",
                ToolSchema {
                    params: vec![ParamSchema { name: "a".into(), required: true }],
                },
                Arc::new(|_args| Ok(Value::Null)),
            )
            .await;

        let result = sandbox.execute("add", serde_json::json!({})).await;
        assert!(matches!(result, Err(SandboxError::SchemaMismatch(_))));
    }

    #[tokio::test]
    async fn forbidden_signature_is_rejected_before_spawning() {
        let sandbox = sandbox();
        sandbox
            .register_tool(
                "shell",
                ToolSchema::default(),
                Arc::new(|_args| Ok(Value::Null)),
            )
            .await;

        let result = sandbox
            .execute("shell", serde_json::json!({ "cmd": "rm -rf /" }))
            .await;
        assert!(matches!(
            result,
            Err(SandboxError::Violation {
                kind: SandboxViolationKind::Forbidden,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn slow_tool_is_killed_by_wall_time_limit() {
        let sandbox = Sandbox::new(SandboxLimits {
            wall_ms: 20,
            mem_mb: 256,
            cpu_ms: 20,
        });
        sandbox
            .register_tool(
                "slow",
                ToolSchema::default(),
                Arc::new(|_args| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(Value::Null)
                }),
            )
            .await;

        let result = sandbox.execute("slow", serde_json::json!({})).await;
        assert!(matches!(
            result,
            Err(SandboxError::Violation {
                kind: SandboxViolationKind::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let sandbox = sandbox();
        let result = sandbox.execute("nope", Value::Null).await;
        assert!(matches!(result, Err(SandboxError::UnknownTool(_))));
    }
}
