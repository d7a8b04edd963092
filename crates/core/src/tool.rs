//! Tool executor and catalog traits.
//!
//! Execution (`ToolExecutor`) and description (`ToolCatalog`) are separate
//! seams: the dispatcher needs both, but a test can stub one without the
//! other. The catalog is also where independence and required-parameter
//! metadata live, so batching and argument validation never hard-code a
//! tool list.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model, with parsed arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id from the model, echoed back in the result message
    pub id: String,

    /// The tool to invoke
    pub name: String,

    /// Parsed JSON arguments
    pub arguments: Value,
}

/// The result of executing a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the invocation succeeded
    pub success: bool,

    /// Tool output (stdout, file contents, listing, ...)
    pub output: String,

    /// Error description when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
        }
    }

    /// The text that goes back to the model as the tool-result message.
    pub fn as_result_text(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

/// Executes tool calls against the environment (sandbox, filesystem, network).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one tool call to completion.
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError>;
}

/// Static description of a tool: schema plus dispatch metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// The tool name
    pub name: String,

    /// Description sent to the model
    pub description: String,

    /// JSON Schema for the arguments object
    pub parameters: Value,

    /// Whether calls to this tool can run concurrently with other
    /// independent calls in the same batch
    pub independent: bool,

    /// Argument keys that must be present before the tool is invoked
    #[serde(default)]
    pub required_params: Vec<String>,
}

impl ToolSpec {
    /// The definition shape the chat service expects.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// The set of tools available to a run.
pub trait ToolCatalog: Send + Sync {
    /// All tool specs, in a stable order.
    fn specs(&self) -> Vec<ToolSpec>;

    /// Look up a single tool by name.
    fn get(&self, name: &str) -> Option<ToolSpec> {
        self.specs().into_iter().find(|s| s.name == name)
    }

    /// Whether a tool may run concurrently with other independent calls.
    /// Unknown tools are treated as dependent so they serialize.
    fn is_independent(&self, name: &str) -> bool {
        self.get(name).map(|s| s.independent).unwrap_or(false)
    }

    /// Definitions for the chat request.
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs().iter().map(ToolSpec::to_definition).collect()
    }
}

/// A catalog backed by a fixed list of specs.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    specs: Vec<ToolSpec>,
}

impl StaticCatalog {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }
}

impl ToolCatalog for StaticCatalog {
    fn specs(&self) -> Vec<ToolSpec> {
        self.specs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, independent: bool, required: &[&str]) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: json!({ "type": "object" }),
            independent,
            required_params: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn outcome_result_text() {
        assert_eq!(ToolOutcome::ok("listing").as_result_text(), "listing");
        assert_eq!(
            ToolOutcome::failed("no such file").as_result_text(),
            "Error: no such file"
        );
    }

    #[test]
    fn catalog_lookup_and_independence() {
        let catalog = StaticCatalog::new(vec![
            spec("file_read", true, &["path"]),
            spec("shell", false, &["command"]),
        ]);

        assert!(catalog.is_independent("file_read"));
        assert!(!catalog.is_independent("shell"));
        // unknown tools serialize
        assert!(!catalog.is_independent("no_such_tool"));

        let shell = catalog.get("shell").unwrap();
        assert_eq!(shell.required_params, vec!["command".to_string()]);
    }

    #[test]
    fn definitions_match_specs() {
        let catalog = StaticCatalog::new(vec![spec("file_list", true, &[])]);
        let defs = catalog.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "file_list");
    }
}
