//! Supervised tool execution.
//!
//! Every call runs under a timeout and a panic boundary. Whatever happens
//! inside the tool comes back as a [`ToolResult`]; nothing escapes as a
//! fault.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use chainloom_core::messages::{ToolCall, ToolResult};
use chainloom_core::settings::DEFAULT_TOOL_TIMEOUT_MS;
use chainloom_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolOutput};
use chainloom_telemetry::MetricsRecorder;

use crate::registry::ToolRegistry;

pub struct ToolExecutor {
    timeout: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS))
    }
}

impl ToolExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every call and return one result per call, in call order.
    ///
    /// Concurrent tools run together first; sequential tools then run one
    /// at a time. Calls to unknown tools resolve to a not-found error.
    pub async fn execute_batch(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCall],
        custom_context: &Arc<Value>,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut concurrent = Vec::new();
        let mut sequential = Vec::new();

        for (i, call) in calls.iter().enumerate() {
            match registry.get(&call.name) {
                None => {
                    warn!(tool = %call.name, call_id = %call.call_id, "tool call to unregistered tool");
                    results[i] = Some(error_result(call, &ToolError::NotFound(call.name.clone())));
                }
                Some(tool) => match tool.execution_mode() {
                    ExecutionMode::Concurrent => concurrent.push((i, tool)),
                    ExecutionMode::Sequential => sequential.push((i, tool)),
                },
            }
        }

        let batch = concurrent
            .into_iter()
            .map(|(i, tool)| async move { (i, self.execute_one(tool, &calls[i], custom_context, cancel).await) });
        for (i, result) in join_all(batch).await {
            results[i] = Some(result);
        }

        for (i, tool) in sequential {
            results[i] = Some(self.execute_one(tool, &calls[i], custom_context, cancel).await);
        }

        results.into_iter().flatten().collect()
    }

    async fn execute_one(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCall,
        custom_context: &Arc<Value>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let started = Instant::now();
        let outcome = match missing_parameters(tool.as_ref(), call) {
            Some(missing) => Err(ToolError::MissingParameters(missing)),
            None => self.invoke(tool.as_ref(), call, custom_context, cancel).await,
        };
        let elapsed = started.elapsed();

        let status = if outcome.is_ok() { "ok" } else { "error" };
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("chain_tool_calls_total", &[("tool", &call.name), ("status", status)], 1);
            metrics.histogram_observe("chain_tool_duration_ms", &[("tool", &call.name)], elapsed.as_millis() as f64);
        }
        debug!(tool = %call.name, call_id = %call.call_id, status, duration_ms = elapsed.as_millis() as u64, "tool finished");

        match outcome {
            Ok(output) => success_result(call, output),
            Err(e) => error_result(call, &e),
        }
    }

    async fn invoke(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        custom_context: &Arc<Value>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let ctx = ToolContext {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            custom_context: custom_context.clone(),
            cancel: cancel.child_token(),
        };

        let guarded = tokio::time::timeout(
            self.timeout,
            AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = guarded => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let msg = panic_message(&panic);
                    error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                    Err(ToolError::Panicked(msg))
                }
                Err(_) => {
                    warn!(tool = %call.name, timeout_ms = self.timeout.as_millis() as u64, "tool timed out");
                    Err(ToolError::Timeout(self.timeout))
                }
            },
        }
    }
}

fn missing_parameters(tool: &dyn Tool, call: &ToolCall) -> Option<Vec<String>> {
    let missing: Vec<String> = tool
        .required_parameters()
        .into_iter()
        .filter(|name| call.arguments.get(name).map_or(true, Value::is_null))
        .collect();
    (!missing.is_empty()).then_some(missing)
}

fn success_result(call: &ToolCall, output: ToolOutput) -> ToolResult {
    ToolResult {
        display_text: output.display_text,
        processed_content: output.processed_content,
        ..ToolResult::success(&call.call_id, &call.name, output.content)
    }
}

fn error_result(call: &ToolCall, error: &ToolError) -> ToolResult {
    let mut result = ToolResult::error(&call.call_id, &call.name, error.to_string());
    result.options.insert("error_kind".into(), error.error_kind().into());
    result
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
