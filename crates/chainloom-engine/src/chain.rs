//! Conversation state and the operations that mutate it.
//!
//! A [`Chain`] is owned by one task. Every mutation goes through `&mut self`,
//! so there is no shared state to guard.

mod run;

pub use run::{BeforeFallback, RunMode, RunOptions, RunResult, StepOutcome};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use chainloom_core::delta::{merge, MessageDelta};
use chainloom_core::finalize::{finalize, finalize_cancelled};
use chainloom_core::ids::ChainId;
use chainloom_core::messages::{Message, MessageStatus, Role, ToolCall};
use chainloom_core::settings::ChainSettings;
use chainloom_core::tools::Tool;
use chainloom_core::usage::{add_usage, TokenUsage};
use chainloom_llm::ChatModel;
use chainloom_telemetry::MetricsRecorder;

use crate::callbacks::{ChainCallbacks, ChainEvent};
use crate::error::ChainError;
use crate::executor::{panic_message, ToolExecutor};
use crate::processors::{MessageProcessor, ProcessorOutcome};
use crate::registry::ToolRegistry;

/// What folding one fragment did to the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The delta is still in progress.
    Pending,
    /// A message was finalized and appended.
    Finalized,
    /// A message was finalized but a processor halted it.
    Halted,
}

/// Counts for one executed tool batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolBatch {
    pub calls: usize,
    pub errors: usize,
}

pub struct Chain {
    id: ChainId,
    llm: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    messages: Vec<Message>,
    exchanged_messages: Vec<Message>,
    delta: Option<MessageDelta>,
    needs_response: bool,
    current_failure_count: u32,
    settings: ChainSettings,
    callbacks: ChainCallbacks,
    processors: Vec<Arc<dyn MessageProcessor>>,
    custom_context: Arc<Value>,
    executor: ToolExecutor,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Chain {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        let settings = ChainSettings::default();
        Self {
            id: ChainId::new(),
            llm,
            tools: ToolRegistry::new(),
            messages: Vec::new(),
            exchanged_messages: Vec::new(),
            delta: None,
            needs_response: false,
            current_failure_count: 0,
            executor: ToolExecutor::new(settings.tool_timeout()),
            settings,
            callbacks: ChainCallbacks::new(),
            processors: Vec::new(),
            custom_context: Arc::new(Value::Null),
            metrics: None,
        }
    }

    pub fn with_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = settings;
        self.rebuild_executor();
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        for tool in tools {
            self.tools.register(tool);
        }
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_callbacks(mut self, callbacks: ChainCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Caller data handed to every tool as `ToolContext::custom_context`.
    pub fn with_custom_context(mut self, context: Value) -> Self {
        self.custom_context = Arc::new(context);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self.rebuild_executor();
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.add_message(message);
        self
    }

    fn rebuild_executor(&mut self) {
        let mut executor = ToolExecutor::new(self.settings.tool_timeout());
        if let Some(metrics) = &self.metrics {
            executor = executor.with_metrics(metrics.clone());
        }
        self.executor = executor;
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> &ChainId {
        &self.id
    }

    pub fn llm(&self) -> &Arc<dyn ChatModel> {
        &self.llm
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages appended since the current run started.
    pub fn exchanged_messages(&self) -> &[Message] {
        &self.exchanged_messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn delta(&self) -> Option<&MessageDelta> {
        self.delta.as_ref()
    }

    pub fn needs_response(&self) -> bool {
        self.needs_response
    }

    pub fn current_failure_count(&self) -> u32 {
        self.current_failure_count
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn custom_context(&self) -> &Value {
        &self.custom_context
    }

    /// Tool calls on the last message that have not been answered yet.
    pub fn pending_tool_calls(&self) -> Option<&[ToolCall]> {
        self.last_message()
            .filter(|m| m.role == Role::Assistant && m.has_tool_calls())
            .map(|m| m.tool_calls.as_slice())
    }

    // ── operations ──────────────────────────────────────────────────────

    /// Append a message. The chain then needs a response when the message
    /// is from the user or a tool, or carries unanswered tool calls.
    pub fn add_message(&mut self, message: Message) {
        self.needs_response = message.needs_response();
        self.messages.push(message.clone());
        self.exchanged_messages.push(message);
    }

    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.add_message(message);
        }
    }

    /// Swap the whole history, e.g. from a `before_fallback` hook.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.needs_response = messages.last().is_some_and(Message::needs_response);
        self.messages = messages;
    }

    /// Fold a streamed fragment into the in-progress delta.
    ///
    /// On a terminal status the delta is finalized, post-processed and
    /// appended. A finalize failure drops the delta, counts as one failure
    /// and is returned so the caller can ask for the response again.
    pub fn merge_delta(&mut self, fragment: MessageDelta) -> Result<MergeOutcome, ChainError> {
        if is_usage_only(&fragment) {
            if let Some(usage) = fragment.metadata.usage {
                self.merge_usage(usage);
            }
            return Ok(MergeOutcome::Pending);
        }
        if let Some(usage) = &fragment.metadata.usage {
            self.callbacks.emit(&ChainEvent::TokenUsage { usage });
        }

        let merged = merge(self.delta.take(), fragment);
        self.callbacks.emit(&ChainEvent::DeltaMerged { delta: &merged });
        if !merged.is_terminal() {
            self.delta = Some(merged);
            return Ok(MergeOutcome::Pending);
        }

        match finalize(merged) {
            Ok(message) => Ok(if self.accept_response(message) {
                MergeOutcome::Halted
            } else {
                MergeOutcome::Finalized
            }),
            Err(e) => {
                self.record_processing_error(&e.to_string());
                Err(ChainError::Finalize(e))
            }
        }
    }

    /// Add usage to the in-progress delta, or to the assistant message it
    /// became when usage trails the terminal fragment.
    pub fn merge_usage(&mut self, usage: TokenUsage) {
        self.callbacks.emit(&ChainEvent::TokenUsage { usage: &usage });

        if let Some(delta) = self.delta.as_mut() {
            delta.metadata.usage = add_usage(delta.metadata.usage.take(), Some(usage));
            return;
        }

        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.metadata.usage = add_usage(last.metadata.usage.take(), Some(usage));
                let updated = last.metadata.usage.clone();
                if let Some(exchanged) = self.exchanged_messages.last_mut().filter(|m| m.role == Role::Assistant) {
                    exchanged.metadata.usage = updated;
                }
            }
            _ => self.delta = Some(MessageDelta::usage(usage)),
        }
    }

    /// Finalize the in-progress delta as cancelled. Partially streamed tool
    /// calls are dropped. Returns false when nothing was in progress.
    pub fn cancel_delta(&mut self, reason: &str) -> bool {
        let Some(delta) = self.delta.take() else {
            return false;
        };
        let message = finalize_cancelled(delta);
        debug!(chain_id = %self.id, reason, "cancelled in-progress message");
        self.callbacks.emit(&ChainEvent::Interrupted { reason });
        self.callbacks.emit(&ChainEvent::MessageFinalized { message: &message });
        self.add_message(message);
        true
    }

    /// Run the tool calls on the last message and append one `tool`
    /// message holding every result. Returns `None` when nothing is pending.
    pub async fn execute_tool_calls(&mut self) -> Option<ToolBatch> {
        self.execute_tool_calls_with(&CancellationToken::new()).await
    }

    #[instrument(skip_all, fields(chain_id = %self.id))]
    pub(crate) async fn execute_tool_calls_with(&mut self, cancel: &CancellationToken) -> Option<ToolBatch> {
        let calls = self.pending_tool_calls()?.to_vec();
        for call in &calls {
            self.callbacks.emit(&ChainEvent::ToolExecutionStarted { call });
        }

        let results = self
            .executor
            .execute_batch(&self.tools, &calls, &self.custom_context, cancel)
            .await;

        let errors = results.iter().filter(|r| r.is_error).count();
        if errors == 0 {
            self.current_failure_count = 0;
        } else {
            self.current_failure_count += errors as u32;
            warn!(
                errors,
                calls = calls.len(),
                failure_count = self.current_failure_count,
                "tool calls failed"
            );
        }

        let message = Message::tool(results);
        self.callbacks.emit(&ChainEvent::ToolResponseCreated { message: &message });
        self.add_message(message);
        Some(ToolBatch {
            calls: calls.len(),
            errors,
        })
    }

    /// Post-process and append a finalized response. Returns true when a
    /// processor halted.
    fn accept_response(&mut self, message: Message) -> bool {
        self.callbacks.emit(&ChainEvent::MessageFinalized { message: &message });

        if message.role != Role::Assistant || message.status == MessageStatus::Cancelled {
            self.add_message(message);
            return false;
        }

        let mut current = message;
        let processors = self.processors.clone();
        for processor in processors {
            let input = current.clone();
            match catch_unwind(AssertUnwindSafe(|| processor.process(input))) {
                Ok(ProcessorOutcome::Continue(updated)) => current = updated,
                Ok(ProcessorOutcome::Halt(replacement)) => {
                    self.halt(processor.name(), current, replacement);
                    return true;
                }
                Err(panic) => {
                    let msg = panic_message(&panic);
                    error!(processor = processor.name(), panic = %msg, "message processor panicked");
                    let replacement = Message::user(format!("ERROR: An exception was raised! Exception: {msg}"));
                    self.halt(processor.name(), current, replacement);
                    return true;
                }
            }
        }

        self.callbacks.emit(&ChainEvent::MessageProcessed { message: &current });
        if !current.has_tool_calls() {
            self.current_failure_count = 0;
        }
        self.add_message(current);
        false
    }

    fn halt(&mut self, processor: &str, message: Message, replacement: Message) {
        self.add_message(message);
        let error = replacement.text_content();
        self.record_processing_error(&error);
        warn!(processor, error = %error, "message processor halted");
        self.add_message(replacement);
    }

    fn record_processing_error(&mut self, error: &str) {
        self.current_failure_count += 1;
        warn!(chain_id = %self.id, failure_count = self.current_failure_count, error, "message processing failed");
        self.callbacks.emit(&ChainEvent::ProcessingError { error });
    }
}

fn is_usage_only(fragment: &MessageDelta) -> bool {
    fragment.metadata.usage.is_some()
        && fragment.role.is_none()
        && fragment.content.is_none()
        && fragment.merged_content.is_empty()
        && fragment.tool_calls.is_empty()
        && !fragment.is_terminal()
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("llm", &self.llm.config().label())
            .field("tools", &self.tools)
            .field("messages", &self.messages.len())
            .field("needs_response", &self.needs_response)
            .field("current_failure_count", &self.current_failure_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainloom_core::delta::ToolCallDelta;
    use chainloom_core::messages::{ContentPart, ToolResult};
    use chainloom_core::tools::{FunctionTool, ToolError, ToolOutput};
    use chainloom_llm::mock::MockModel;
    use parking_lot::Mutex;
    use serde_json::json;

    fn chain() -> Chain {
        Chain::new(Arc::new(MockModel::new(vec![])))
    }

    fn adder() -> Arc<dyn Tool> {
        Arc::new(
            FunctionTool::new("add", "adds a and b", |args, _| async move {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
                Ok(ToolOutput::from(json!(a + b)))
            })
            .with_schema(json!({"type": "object", "required": ["a", "b"]})),
        )
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        match args {
            Value::Object(map) => ToolCall::new(id, name, map),
            _ => ToolCall::new(id, name, Default::default()),
        }
    }

    fn recorder() -> (ChainCallbacks, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (ChainCallbacks::new().on(move |e| sink.lock().push(e.name().to_string())), events)
    }

    #[test]
    fn add_message_sets_needs_response() {
        let mut c = chain();
        assert!(!c.needs_response());
        c.add_message(Message::user("hi"));
        assert!(c.needs_response());
        c.add_message(Message::assistant("hello"));
        assert!(!c.needs_response());
        c.add_message(Message::assistant_tool_calls(vec![call("c1", "add", json!({}))]));
        assert!(c.needs_response());
        c.add_message(Message::tool(vec![ToolResult::success("c1", "add", vec![])]));
        assert!(c.needs_response());
        c.add_message(Message::system("be brief"));
        assert!(!c.needs_response());
        assert_eq!(c.messages().len(), 5);
    }

    #[test]
    fn streamed_hello_finalizes() {
        let mut c = chain().with_message(Message::user("greet me"));
        assert_eq!(
            c.merge_delta(MessageDelta::text("Hel").role(Role::Assistant)).unwrap(),
            MergeOutcome::Pending
        );
        assert_eq!(c.delta().map(MessageDelta::text_so_far), Some("Hel".into()));
        assert_eq!(c.merge_delta(MessageDelta::text("lo")).unwrap(), MergeOutcome::Pending);
        assert_eq!(
            c.merge_delta(MessageDelta::with_status(MessageStatus::Complete)).unwrap(),
            MergeOutcome::Finalized
        );

        let last = c.last_message().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text_content(), "Hello");
        assert_eq!(last.status, MessageStatus::Complete);
        assert!(c.delta().is_none());
        assert!(!c.needs_response());
    }

    #[test]
    fn usage_only_fragment_keeps_status() {
        let mut c = chain();
        c.merge_delta(MessageDelta::text("a")).unwrap();
        c.merge_delta(MessageDelta::usage(TokenUsage::new(Some(3), None))).unwrap();
        c.merge_usage(TokenUsage::new(Some(1), Some(4)));
        let delta = c.delta().unwrap();
        assert_eq!(delta.status, MessageStatus::Incomplete);
        assert_eq!(delta.metadata.usage, Some(TokenUsage::new(Some(4), Some(4))));
    }

    #[test]
    fn trailing_usage_lands_on_finalized_message() {
        let mut c = chain();
        c.merge_delta(MessageDelta::text("done").status(MessageStatus::Complete)).unwrap();
        c.merge_delta(MessageDelta::usage(TokenUsage::new(Some(10), Some(2)))).unwrap();
        assert!(c.delta().is_none());
        assert_eq!(
            c.last_message().unwrap().metadata.usage,
            Some(TokenUsage::new(Some(10), Some(2)))
        );
        assert_eq!(c.exchanged_messages()[0].metadata.usage, c.last_message().unwrap().metadata.usage);
    }

    #[test]
    fn finalize_error_counts_one_failure() {
        let (callbacks, events) = recorder();
        let mut c = chain().with_callbacks(callbacks);
        c.merge_delta(MessageDelta::tool_call(ToolCallDelta::start(0, "c1", "add"))).unwrap();
        c.merge_delta(MessageDelta::tool_call(ToolCallDelta::arguments_at(0, "{\"a\":"))).unwrap();
        let err = c
            .merge_delta(MessageDelta::with_status(MessageStatus::Complete))
            .unwrap_err();
        assert!(matches!(err, ChainError::Finalize(_)));
        assert_eq!(c.current_failure_count(), 1);
        assert!(c.delta().is_none());
        assert!(c.messages().is_empty());
        assert!(events.lock().contains(&"processing_error".to_string()));
    }

    #[test]
    fn cancel_delta_keeps_content_and_drops_tool_calls() {
        let (callbacks, events) = recorder();
        let mut c = chain().with_callbacks(callbacks);
        assert!(!c.cancel_delta("nothing pending"));

        c.merge_delta(MessageDelta::text("partial answ")).unwrap();
        c.merge_delta(MessageDelta::tool_call(ToolCallDelta::start(0, "c1", "add"))).unwrap();
        assert!(c.cancel_delta("user stopped"));

        let last = c.last_message().unwrap();
        assert_eq!(last.status, MessageStatus::Cancelled);
        assert_eq!(last.text_content(), "partial answ");
        assert!(last.tool_calls.is_empty());
        assert!(c.delta().is_none());
        assert!(c.pending_tool_calls().is_none());
        assert!(events.lock().contains(&"interrupted".to_string()));
    }

    #[tokio::test]
    async fn execute_tool_calls_success_resets_counter() {
        let mut c = chain().with_tool(adder());
        c.current_failure_count = 2;
        c.add_message(Message::assistant_tool_calls(vec![
            call("c1", "add", json!({"a": 1, "b": 2})),
            call("c2", "add", json!({"a": 5, "b": 5})),
        ]));

        let batch = c.execute_tool_calls().await.unwrap();
        assert_eq!(batch, ToolBatch { calls: 2, errors: 0 });
        assert_eq!(c.current_failure_count(), 0);

        let last = c.last_message().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_results.len(), 2);
        assert_eq!(last.tool_results[0].content, vec![ContentPart::text("3")]);
        assert_eq!(last.tool_results[1].processed_content, Some(json!(10)));
        assert!(c.needs_response());
    }

    #[tokio::test]
    async fn execute_tool_calls_counts_each_failing_call() {
        let mut c = chain().with_tool(adder());
        c.add_message(Message::assistant_tool_calls(vec![
            call("c1", "add", json!({"a": 1, "b": 2})),
            call("c2", "add", json!({"a": 1})),
            call("c3", "missing_tool", json!({})),
        ]));

        let batch = c.execute_tool_calls().await.unwrap();
        assert_eq!(batch.errors, 2);
        assert_eq!(c.current_failure_count(), 2);

        let results = &c.last_message().unwrap().tool_results;
        assert!(!results[0].is_error);
        assert_eq!(results[1].text_content(), "missing required parameters: b");
        assert_eq!(results[2].text_content(), "Tool call made to missing_tool but tool not found");
    }

    #[tokio::test]
    async fn one_error_among_many_increments_by_one() {
        let flaky = Arc::new(FunctionTool::new("flaky", "fails on x", |args, _| async move {
            if args.contains_key("x") {
                Err(ToolError::ExecutionFailed("bad x".into()))
            } else {
                Ok(ToolOutput::text("fine"))
            }
        }));
        let mut c = chain().with_tool(flaky);
        c.add_message(Message::assistant_tool_calls(vec![
            call("c1", "flaky", json!({})),
            call("c2", "flaky", json!({"x": 1})),
            call("c3", "flaky", json!({})),
        ]));
        c.execute_tool_calls().await.unwrap();
        assert_eq!(c.current_failure_count(), 1);
    }

    #[tokio::test]
    async fn execute_tool_calls_without_pending_is_noop() {
        let mut c = chain().with_message(Message::user("hi"));
        assert!(c.execute_tool_calls().await.is_none());
        assert_eq!(c.messages().len(), 1);
    }

    #[tokio::test]
    async fn tools_receive_custom_context() {
        let tool = Arc::new(FunctionTool::new("whoami", "reads context", |_, ctx| async move {
            Ok(ToolOutput::text(ctx.custom_context["user"].as_str().unwrap_or("?").to_string()))
        }));
        let mut c = chain()
            .with_tool(tool)
            .with_custom_context(json!({"user": "grace"}))
            .with_message(Message::assistant_tool_calls(vec![call("c1", "whoami", json!({}))]));
        c.execute_tool_calls().await.unwrap();
        assert_eq!(c.last_message().unwrap().tool_results[0].text_content(), "grace");
    }

    #[test]
    fn processor_halt_appends_both_messages() {
        struct Reject;
        impl MessageProcessor for Reject {
            fn name(&self) -> &str {
                "reject"
            }
            fn process(&self, _message: Message) -> ProcessorOutcome {
                ProcessorOutcome::Halt(Message::user("try again"))
            }
        }

        let mut c = chain().with_processor(Arc::new(Reject));
        let outcome = c
            .merge_delta(MessageDelta::text("nope").status(MessageStatus::Complete))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Halted);
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[0].text_content(), "nope");
        assert_eq!(c.messages()[1].text_content(), "try again");
        assert_eq!(c.current_failure_count(), 1);
        assert!(c.needs_response());
    }

    #[test]
    fn processor_panic_is_a_halt() {
        struct Explodes;
        impl MessageProcessor for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }
            fn process(&self, _message: Message) -> ProcessorOutcome {
                panic!("bad regex state")
            }
        }

        let mut c = chain().with_processor(Arc::new(Explodes));
        let outcome = c
            .merge_delta(MessageDelta::text("hi").status(MessageStatus::Complete))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Halted);
        let last = c.last_message().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(last.text_content().contains("bad regex state"));
        assert_eq!(c.current_failure_count(), 1);
    }

    #[test]
    fn processors_chain_their_updates() {
        let mut c = chain()
            .with_processor(Arc::new(crate::processors::TrimText))
            .with_processor(Arc::new(crate::processors::JsonProcessor::new()));
        c.merge_delta(MessageDelta::text("  {\"ok\": true}\n").status(MessageStatus::Complete))
            .unwrap();
        let last = c.last_message().unwrap();
        assert_eq!(last.text_content(), "{\"ok\": true}");
        assert_eq!(last.processed_content, Some(json!({"ok": true})));
    }

    #[test]
    fn callbacks_see_the_lifecycle() {
        let (callbacks, events) = recorder();
        let mut c = chain().with_callbacks(callbacks);
        let mut fragment = MessageDelta::text("x");
        fragment.metadata.usage = Some(TokenUsage::new(Some(1), Some(1)));
        c.merge_delta(fragment).unwrap();
        c.merge_delta(MessageDelta::with_status(MessageStatus::Complete)).unwrap();
        assert_eq!(
            *events.lock(),
            vec![
                "token_usage",
                "delta_merged",
                "delta_merged",
                "message_finalized",
                "message_processed",
            ]
        );
    }
}
