//! Tool-call pipeline: extraction, validation, execution
//!
//! LLM output text flows through [`extract::ToolCallExtractor`] into
//! [`validate::ToolCallValidator`] and finally [`execute::ToolCallExecutor`],
//! which talks to subprocess tool servers over their stdin/stdout.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod execute;
pub mod extract;
pub mod schema;
pub mod validate;

/// A structured tool invocation extracted from free-form text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Pipeline stage at which a tool call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validation,
    Routing,
    Execution,
    Exception,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Validation => write!(f, "validation"),
            Stage::Routing => write!(f, "routing"),
            Stage::Execution => write!(f, "execution"),
            Stage::Exception => write!(f, "exception"),
        }
    }
}

/// Outcome of one tool call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Tool name, when known at the point of failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Result value reported by the server on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ExecutionResult {
    pub fn success(tool: &str, result: Value) -> Self {
        Self {
            success: true,
            tool: Some(tool.to_string()),
            result: Some(result),
            error: None,
            stage: None,
        }
    }

    pub fn failure(tool: &str, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tool: Some(tool.to_string()),
            result: None,
            error: Some(error.into()),
            stage: Some(stage),
        }
    }
}
