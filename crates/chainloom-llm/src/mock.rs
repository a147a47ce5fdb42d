use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use chainloom_core::delta::{MessageDelta, ToolCallDelta};
use chainloom_core::errors::ProviderError;
use chainloom_core::messages::{Message, MessageStatus, ToolCall};
use chainloom_core::tools::ToolDefinition;

use crate::model::{output_stream, ChatModel, ModelConfig, ModelOutput, ModelStream};

/// Pre-programmed responses for deterministic testing without a backend.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these outputs, then end.
    Outputs(Vec<ModelOutput>),
    /// Fail the call itself.
    Error(ProviderError),
    /// Yield these outputs, then fail mid-stream.
    StreamError(Vec<ModelOutput>, ProviderError),
    /// Yield these outputs, then never yield again.
    Stall(Vec<ModelOutput>),
    /// Wait, then behave like the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete assistant message in one piece.
    pub fn text(text: &str) -> Self {
        Self::Outputs(vec![ModelOutput::Message(Message::assistant(text))])
    }

    /// One delta per fragment, then a terminal status.
    pub fn streamed_text(fragments: &[&str]) -> Self {
        let mut outputs: Vec<ModelOutput> = fragments
            .iter()
            .map(|f| ModelOutput::Delta(MessageDelta::text(*f)))
            .collect();
        outputs.push(ModelOutput::Delta(MessageDelta::with_status(MessageStatus::Complete)));
        Self::Outputs(outputs)
    }

    /// A complete assistant message requesting one tool call.
    pub fn tool_call(call_id: &str, name: &str, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        Self::Outputs(vec![ModelOutput::Message(Message::assistant_tool_calls(vec![
            ToolCall::new(call_id, name, arguments),
        ]))])
    }

    /// A streamed tool call with its raw argument text split in two.
    pub fn streamed_tool_call(call_id: &str, name: &str, raw_arguments: &str) -> Self {
        let mid = raw_arguments
            .char_indices()
            .map(|(i, _)| i)
            .nth(raw_arguments.chars().count() / 2)
            .unwrap_or(raw_arguments.len());
        let (head, tail) = raw_arguments.split_at(mid);
        Self::Outputs(vec![
            ModelOutput::Delta(MessageDelta::tool_call(ToolCallDelta::start(0, call_id, name))),
            ModelOutput::Delta(MessageDelta::tool_call(ToolCallDelta::arguments_at(0, head))),
            ModelOutput::Delta(MessageDelta::tool_call(ToolCallDelta::arguments_at(0, tail))),
            ModelOutput::Delta(MessageDelta::with_status(MessageStatus::Complete)),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Model that returns pre-programmed responses in sequence.
pub struct MockModel {
    config: ModelConfig,
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    received: Mutex<Vec<Vec<Message>>>,
}

impl MockModel {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::named("mock-model", responses)
    }

    pub fn named(model: &str, responses: Vec<MockResponse>) -> Self {
        Self {
            config: ModelConfig::new("mock", model),
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Conversation snapshots passed to each call, oldest first.
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    async fn call(&self, messages: &[Message], _tools: &[ToolDefinition]) -> Result<ModelStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.received.lock().push(messages.to_vec());

        let Some(mut response) = self.responses.lock().pop_front() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockModel: no response configured for call {idx}"
            )));
        };

        loop {
            return match response {
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                    continue;
                }
                MockResponse::Outputs(outputs) => Ok(output_stream(outputs)),
                MockResponse::Error(e) => Err(e),
                MockResponse::StreamError(outputs, e) => Ok(Box::pin(
                    stream::iter(outputs.into_iter().map(Ok)).chain(stream::once(async move { Err(e) })),
                )),
                MockResponse::Stall(outputs) => Ok(Box::pin(
                    stream::iter(outputs.into_iter().map(Ok)).chain(stream::pending()),
                )),
            };
        }
    }
}
