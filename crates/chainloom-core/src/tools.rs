use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::messages::ContentPart;

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run alongside other calls in the same batch.
    Concurrent,
    /// Runs alone, in call order.
    Sequential,
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    /// Caller-supplied data shared by every tool in a chain.
    pub custom_context: Arc<Value>,
    pub cancel: CancellationToken,
}

/// Normalized successful tool return value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ContentPart>,
    pub display_text: Option<String>,
    /// Structured value kept alongside the text sent back to the model.
    pub processed_content: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            ..Self::default()
        }
    }

    pub fn parts(parts: Vec<ContentPart>) -> Self {
        Self {
            content: parts,
            ..Self::default()
        }
    }

    pub fn with_display_text(mut self, text: impl Into<String>) -> Self {
        self.display_text = Some(text.into());
        self
    }

    pub fn with_processed_content(mut self, value: Value) -> Self {
        self.processed_content = Some(value);
        self
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

/// Strings pass through as text; other values are sent as JSON text and
/// kept structured in `processed_content`.
impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::text(text),
            other => Self::text(other.to_string()).with_processed_content(other),
        }
    }
}

impl From<Vec<ContentPart>> for ToolOutput {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::parts(parts)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("Tool call made to {0} but tool not found")]
    NotFound(String),
    #[error("tool timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("tool panicked: {0}")]
    Panicked(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::MissingParameters(_) => "missing_parameters",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panicked",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Tool definition sent to the model alongside the conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Names listed under the schema's `required` key.
    fn required_parameters(&self) -> Vec<String> {
        self.parameters_schema()
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

type ToolFn = dyn Fn(Map<String, Value>, ToolContext) -> BoxFuture<'static, Result<ToolOutput, ToolError>>
    + Send
    + Sync;

/// A tool backed by a closure.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    mode: ExecutionMode,
    function: Arc<ToolFn>,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, function: F) -> Self
    where
        F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({ "type": "object", "properties": {} }),
            mode: ExecutionMode::Concurrent,
            function: Arc::new(
                move |args: Map<String, Value>, ctx: ToolContext| -> BoxFuture<'static, Result<ToolOutput, ToolError>> {
                    Box::pin(function(args, ctx))
                },
            ),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.mode = ExecutionMode::Sequential;
        self
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        (self.function)(args, ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext {
            call_id: "call_1".into(),
            tool_name: "echo".into(),
            custom_context: Arc::new(json!({"user": "ada"})),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn output_from_plain_values() {
        assert_eq!(ToolOutput::from("hi").content, vec![ContentPart::text("hi")]);
        let out = ToolOutput::from(json!({"n": 1}));
        assert_eq!(out.content, vec![ContentPart::text("{\"n\":1}")]);
        assert_eq!(out.processed_content, Some(json!({"n": 1})));
        assert_eq!(ToolOutput::from(json!("s")).processed_content, None);
    }

    #[test]
    fn required_parameters_from_schema() {
        let tool = FunctionTool::new("t", "d", |_, _| async { Ok(ToolOutput::default()) }).with_schema(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }));
        assert_eq!(tool.required_parameters(), vec!["a", "b"]);
    }

    #[test]
    fn no_required_key_means_none() {
        let tool = FunctionTool::new("t", "d", |_, _| async { Ok(ToolOutput::default()) });
        assert!(tool.required_parameters().is_empty());
        assert_eq!(tool.execution_mode(), ExecutionMode::Concurrent);
        assert_eq!(tool.clone().sequential().execution_mode(), ExecutionMode::Sequential);
    }

    #[tokio::test]
    async fn function_tool_receives_args_and_context() {
        let tool = FunctionTool::new("echo", "echoes", |args, ctx| async move {
            let user = ctx.custom_context["user"].as_str().unwrap_or_default().to_string();
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            Ok(ToolOutput::text(format!("{user}: {text}")))
        });
        let mut args = Map::new();
        args.insert("text".into(), json!("hello"));
        let out = tool.execute(args, &ctx()).await.unwrap();
        assert_eq!(out.content, vec![ContentPart::text("ada: hello")]);
    }

    #[test]
    fn definition_carries_schema() {
        let def = FunctionTool::new("t", "desc", |_, _| async { Ok(ToolOutput::default()) }).to_definition();
        assert_eq!(def.name, "t");
        assert_eq!(def.description, "desc");
        assert_eq!(def.parameters_schema["type"], "object");
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ToolError::MissingParameters(vec!["a".into(), "b".into()]).to_string(),
            "missing required parameters: a, b"
        );
        assert_eq!(
            ToolError::NotFound("grep".into()).to_string(),
            "Tool call made to grep but tool not found"
        );
        assert_eq!(ToolError::Timeout(Duration::from_secs(2)).error_kind(), "timeout");
    }
}
