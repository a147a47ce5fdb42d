//! Provider payload to delta mapping.
//!
//! A transformer turns one decoded provider event into the delta vocabulary
//! the merge engine understands. Content-part and tool-call indices are
//! taken from the provider, so interleaved text and tool blocks leave gap
//! placeholders that finalization drops.

use serde_json::{Map, Value};
use tracing::debug;

use chainloom_core::delta::{DeltaContent, MessageDelta, ToolCallDelta, MAX_CONTENT_PARTS};
use chainloom_core::errors::ProviderError;
use chainloom_core::messages::{ContentPart, MessageStatus, PartKind, Role};
use chainloom_core::usage::TokenUsage;

/// What a single payload contributes.
#[derive(Clone, Debug, PartialEq)]
pub enum Transformed {
    Delta(MessageDelta),
    Usage(TokenUsage),
    /// Keep-alives, block boundaries and other events with no content.
    Skip,
    /// The provider reported an error inside the stream.
    Error(ProviderError),
}

pub trait PayloadTransformer: Send + Sync {
    fn transform(&self, payload: &Value) -> Transformed;
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic-style message events
// ─────────────────────────────────────────────────────────────────────────────

/// Messages-API streaming events, as carried inside event-stream frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnthropicEventTransformer;

impl PayloadTransformer for AnthropicEventTransformer {
    fn transform(&self, payload: &Value) -> Transformed {
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "message_start" => {
                let message = payload.get("message").unwrap_or(&Value::Null);
                let mut delta = MessageDelta::default().role(Role::Assistant);
                // Output tokens here are a placeholder; message_delta reports the total.
                delta.metadata.usage = message.get("usage").map(|u| anthropic_usage(u, false));
                Transformed::Delta(delta)
            }
            "content_block_start" => {
                let index = match block_index(payload) {
                    Ok(index) => index,
                    Err(e) => return Transformed::Error(e),
                };
                let block = payload.get("content_block").unwrap_or(&Value::Null);
                content_block_start(index, block)
            }
            "content_block_delta" => {
                let index = match block_index(payload) {
                    Ok(index) => index,
                    Err(e) => return Transformed::Error(e),
                };
                let delta = payload.get("delta").unwrap_or(&Value::Null);
                content_block_delta(index, delta)
            }
            "message_delta" => {
                let stop_reason = payload
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str);
                let mut delta = MessageDelta::default();
                if let Some(reason) = stop_reason {
                    delta.status = anthropic_status(reason);
                }
                delta.metadata.usage = payload.get("usage").map(|u| anthropic_usage(u, true));
                Transformed::Delta(delta)
            }
            "message_stop" => match payload.get("amazon-bedrock-invocationMetrics") {
                Some(metrics) => Transformed::Usage(invocation_metrics(metrics)),
                None => Transformed::Skip,
            },
            "error" => {
                let error = payload.get("error").unwrap_or(&Value::Null);
                let kind = error.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                Transformed::Error(ProviderError::from_event_type(kind, message))
            }
            "content_block_stop" | "ping" => Transformed::Skip,
            other => {
                debug!(event_type = other, "skipping unknown event");
                Transformed::Skip
            }
        }
    }
}

fn block_index(payload: &Value) -> Result<u32, ProviderError> {
    payload.get("index").and_then(Value::as_u64).map_or(Ok(0), checked_index)
}

/// Provider indices address a dense vector, so anything past the content
/// part cap is rejected instead of padded.
fn checked_index(raw: u64) -> Result<u32, ProviderError> {
    u32::try_from(raw)
        .ok()
        .filter(|&i| (i as usize) < MAX_CONTENT_PARTS)
        .ok_or_else(|| ProviderError::MalformedResponse(format!("content index {raw} out of range")))
}

fn content_block_start(index: u32, block: &Value) -> Transformed {
    let at = index as usize;
    match block.get("type").and_then(Value::as_str).unwrap_or_default() {
        "text" => Transformed::Delta(MessageDelta::part(at, ContentPart::text(str_field(block, "text")))),
        "thinking" => Transformed::Delta(MessageDelta::part(
            at,
            ContentPart::thinking(str_field(block, "thinking")),
        )),
        "redacted_thinking" => Transformed::Delta(MessageDelta::part(
            at,
            ContentPart::empty(PartKind::Thinking).with_option("redacted_data", str_field(block, "data")),
        )),
        "tool_use" | "server_tool_use" => Transformed::Delta(MessageDelta::tool_call(ToolCallDelta::start(
            index,
            str_field(block, "id"),
            str_field(block, "name"),
        ))),
        other => {
            debug!(block_type = other, "skipping unknown content block");
            Transformed::Skip
        }
    }
}

fn content_block_delta(index: u32, delta: &Value) -> Transformed {
    let at = index as usize;
    match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
        "text_delta" => Transformed::Delta(MessageDelta::part(at, ContentPart::text(str_field(delta, "text")))),
        "thinking_delta" => Transformed::Delta(MessageDelta::part(
            at,
            ContentPart::thinking(str_field(delta, "thinking")),
        )),
        "signature_delta" => Transformed::Delta(MessageDelta::part(
            at,
            ContentPart::empty(PartKind::Thinking).with_option("signature", str_field(delta, "signature")),
        )),
        "input_json_delta" => Transformed::Delta(MessageDelta::tool_call(ToolCallDelta::arguments_at(
            index,
            str_field(delta, "partial_json"),
        ))),
        _ => Transformed::Skip,
    }
}

fn anthropic_status(stop_reason: &str) -> MessageStatus {
    match stop_reason {
        "max_tokens" | "model_context_window_exceeded" => MessageStatus::Length,
        _ => MessageStatus::Complete,
    }
}

/// `input_tokens`/`output_tokens` map to the typed counts, other numeric
/// fields (cache reads/writes) go to `raw`.
fn anthropic_usage(usage: &Value, include_output: bool) -> TokenUsage {
    let mut out = TokenUsage::default();
    let Some(fields) = usage.as_object() else {
        return out;
    };
    for (key, value) in fields {
        match key.as_str() {
            "input_tokens" if !include_output => out.input = value.as_u64(),
            "input_tokens" => {}
            "output_tokens" if include_output => out.output = value.as_u64(),
            "output_tokens" => {}
            _ if value.is_number() && !include_output => {
                out.raw.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    out
}

fn invocation_metrics(metrics: &Value) -> TokenUsage {
    let mut raw = Map::new();
    for (from, to) in [
        ("invocationLatency", "invocation_latency_ms"),
        ("firstByteLatency", "first_byte_latency_ms"),
    ] {
        if let Some(v) = metrics.get(from).filter(|v| v.is_number()) {
            raw.insert(to.to_string(), v.clone());
        }
    }
    TokenUsage::default().with_raw(raw)
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-style chat completion chunks
// ─────────────────────────────────────────────────────────────────────────────

/// `chat.completion.chunk` payloads. Only the first choice is read.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAiChunkTransformer;

impl PayloadTransformer for OpenAiChunkTransformer {
    fn transform(&self, payload: &Value) -> Transformed {
        if let Some(error) = payload.get("error") {
            let kind = error.get("type").and_then(Value::as_str).unwrap_or("unknown");
            let message = error.get("message").and_then(Value::as_str).unwrap_or("stream error");
            return Transformed::Error(ProviderError::from_event_type(kind, message.to_string()));
        }

        let usage = payload.get("usage").filter(|u| u.is_object()).map(openai_usage);
        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());

        let Some(choice) = choice else {
            return match usage {
                Some(usage) => Transformed::Usage(usage),
                None => Transformed::Skip,
            };
        };

        let body = choice.get("delta").unwrap_or(&Value::Null);
        let mut delta = MessageDelta::default();

        if body.get("role").and_then(Value::as_str) == Some("assistant") {
            delta.role = Some(Role::Assistant);
        }

        let reasoning = body
            .get("reasoning_content")
            .or_else(|| body.get("reasoning"))
            .and_then(Value::as_str);
        let text = body.get("content").and_then(Value::as_str);
        delta.content = match (reasoning, text) {
            (Some(r), Some(t)) => {
                delta.index = Some(0);
                Some(DeltaContent::Parts(vec![ContentPart::thinking(r), ContentPart::text(t)]))
            }
            (Some(r), None) => {
                delta.index = Some(0);
                Some(DeltaContent::Part(ContentPart::thinking(r)))
            }
            (None, Some(t)) => Some(DeltaContent::Text(t.to_string())),
            (None, None) => None,
        };

        if let Some(calls) = body.get("tool_calls").and_then(Value::as_array) {
            delta.tool_calls = match calls.iter().map(openai_tool_call).collect() {
                Ok(calls) => calls,
                Err(e) => return Transformed::Error(e),
            };
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            delta.status = match reason {
                "length" => MessageStatus::Length,
                _ => MessageStatus::Complete,
            };
        }

        delta.metadata.usage = usage;
        Transformed::Delta(delta)
    }
}

fn openai_tool_call(call: &Value) -> Result<ToolCallDelta, ProviderError> {
    let function = call.get("function").unwrap_or(&Value::Null);
    Ok(ToolCallDelta {
        index: call.get("index").and_then(Value::as_u64).map(checked_index).transpose()?,
        call_id: call.get("id").and_then(Value::as_str).map(str::to_string),
        name: function.get("name").and_then(Value::as_str).map(str::to_string),
        arguments: function.get("arguments").and_then(Value::as_str).map(str::to_string),
        ..ToolCallDelta::default()
    })
}

fn openai_usage(usage: &Value) -> TokenUsage {
    let mut out = TokenUsage::default();
    let Some(fields) = usage.as_object() else {
        return out;
    };
    for (key, value) in fields {
        match key.as_str() {
            "prompt_tokens" => out.input = value.as_u64(),
            "completion_tokens" => out.output = value.as_u64(),
            "total_tokens" => {}
            _ if !value.is_null() => {
                out.raw.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    out
}

fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}
