use std::pin::Pin;

use async_trait::async_trait;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chainloom_core::delta::MessageDelta;
use chainloom_core::errors::ProviderError;
use chainloom_core::messages::Message;
use chainloom_core::tools::ToolDefinition;
use chainloom_core::usage::TokenUsage;

/// One item produced by a model call.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutput {
    /// A complete, non-streamed message.
    Message(Message),
    /// A streamed fragment to merge into the in-progress message.
    Delta(MessageDelta),
    /// Usage reported outside of any fragment.
    Usage(TokenUsage),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelOutput, ProviderError>> + Send>>;

/// Wrap already-materialized outputs as a stream.
pub fn output_stream(outputs: Vec<ModelOutput>) -> ModelStream {
    Box::pin(stream::iter(outputs.into_iter().map(Ok)))
}

/// Backing-model settings a provider adapter is built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Provider-specific request fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

fn default_stream() -> bool {
    true
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            stream: true,
            temperature: None,
            max_tokens: None,
            extra: Map::new(),
        }
    }

    /// `provider:model`, used in logs and fallback events.
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// A backing model the chain controller can call. Implementations own the
/// transport; the controller only sees finalized messages or deltas.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    fn name(&self) -> &str {
        &self.config().model
    }

    async fn call(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<ModelStream, ProviderError>;
}
