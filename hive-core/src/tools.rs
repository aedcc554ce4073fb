//! Tool registry and invocation contract.
//!
//! Tools are named async operations with a JSON input and a JSON result.
//! The engine advertises each node's permitted tools to the model and
//! funnels invocations through [`ToolRegistry::invoke`], which enforces
//! the per-tool timeout and converts failures into error-flagged results
//! the model can react to.
//!
//! Two synthetic tools are advertised for every node but never dispatched
//! to an implementation: `set_output` writes a declared output key, and
//! `escalate_to_coder` aborts the node with an escalation. The event loop
//! intercepts both before they reach the registry, so the prompts that
//! advertise them stay truthful.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;

/// Name of the synthetic output-writing tool.
pub const SET_OUTPUT: &str = "set_output";
/// Name of the synthetic escalation tool.
pub const ESCALATE_TO_CODER: &str = "escalate_to_coder";

/// Default per-tool invocation timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    #[diagnostic(code(hive::tools::unknown))]
    Unknown(String),

    #[error("tool {name} timed out after {timeout:?}")]
    #[diagnostic(code(hive::tools::timeout))]
    Timeout { name: String, timeout: Duration },

    #[error("tool {name} failed: {message}")]
    #[diagnostic(code(hive::tools::failed))]
    Failed { name: String, message: String },

    #[error("invalid input for tool {name}: {message}")]
    #[diagnostic(code(hive::tools::invalid_input))]
    InvalidInput { name: String, message: String },
}

impl ToolError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// What the model sees when a tool is advertised.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// An invokable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn invoke(&self, input: Value) -> Result<Value, ToolError>;
}

/// Result of one tool invocation as seen by the node's model: either the
/// tool's output, or an error payload with `is_error` set.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub result: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: json!({"error": message.into()}),
            is_error: true,
        }
    }
}

/// Name → tool map shared by all executors in a session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors for the named tools plus the synthetic pair, in the
    /// order the node declared them. Unknown names are skipped.
    pub fn descriptors_for(&self, allowed: &[String]) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        descriptors.extend(synthetic_descriptors());
        descriptors
    }

    /// Invoke a tool, enforcing its timeout. Failures never propagate as
    /// `Err`: the outcome carries `is_error` so the model sees the failure
    /// as a tool result and can react.
    pub async fn invoke(&self, name: &str, input: Value) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome::error(format!("unknown tool: {name}"));
        };
        let timeout = tool.timeout();
        match tokio::time::timeout(timeout, tool.invoke(input)).await {
            Ok(Ok(result)) => ToolOutcome::ok(result),
            Ok(Err(error)) => ToolOutcome::error(error.to_string()),
            Err(_) => ToolOutcome::error(
                ToolError::Timeout {
                    name: name.to_string(),
                    timeout,
                }
                .to_string(),
            ),
        }
    }
}

/// Returns true for tool names the event loop short-circuits into the
/// runtime instead of dispatching.
pub fn is_synthetic(name: &str) -> bool {
    name == SET_OUTPUT || name == ESCALATE_TO_CODER
}

/// Descriptors for the two synthetic tools, advertised with every node.
pub fn synthetic_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: SET_OUTPUT.to_string(),
            description: "Record one of this node's declared output values. \
                          Call once per output key before finishing."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                    "value": {}
                },
                "required": ["key", "value"]
            }),
        },
        ToolDescriptor {
            name: ESCALATE_TO_CODER.to_string(),
            description: "Hand this task to a human engineer when you are \
                          blocked. Include what you tried and why it failed."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"},
                    "context": {"type": "string"}
                },
                "required": ["reason"]
            }),
        },
    ]
}
