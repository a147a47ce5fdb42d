use serde_json::{Map, Value};

use crate::delta::{MessageDelta, ToolCallDelta};
use crate::ids::ToolCallId;
use crate::messages::{ContentPart, Message, MessageMetadata, MessageStatus, ToolCall};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FinalizeError {
    #[error("Cannot convert incomplete message")]
    Incomplete,
    /// One or more tool calls could not be finalized; the message is rejected.
    #[error("tool_calls: {0}")]
    ToolCalls(String),
}

/// Convert a terminal-status delta into an immutable [`Message`].
///
/// All tool calls must finalize for the message to finalize. A cancelled
/// delta keeps its content but drops its tool calls, which were never
/// fully streamed and must not run.
pub fn finalize(delta: MessageDelta) -> Result<Message, FinalizeError> {
    match delta.status {
        MessageStatus::Incomplete => Err(FinalizeError::Incomplete),
        MessageStatus::Cancelled => Ok(finalize_cancelled(delta)),
        MessageStatus::Complete | MessageStatus::Length => {
            let tool_calls = finalize_tool_calls(&delta.tool_calls)?;
            Ok(build_message(delta, tool_calls))
        }
    }
}

/// Finalize regardless of status, marking the result cancelled.
pub fn finalize_cancelled(delta: MessageDelta) -> Message {
    let mut message = build_message(delta, Vec::new());
    message.status = MessageStatus::Cancelled;
    message
}

fn build_message(delta: MessageDelta, tool_calls: Vec<ToolCall>) -> Message {
    let role = delta.effective_role();
    let content: Vec<ContentPart> = delta.merged_content.into_iter().flatten().collect();
    Message {
        status: delta.status,
        tool_calls,
        metadata: MessageMetadata {
            usage: delta.metadata.usage,
        },
        ..Message::new(role, content)
    }
}

fn finalize_tool_calls(calls: &[ToolCallDelta]) -> Result<Vec<ToolCall>, FinalizeError> {
    let mut finalized = Vec::with_capacity(calls.len());
    let mut errors = Vec::new();

    for call in calls {
        match finalize_tool_call(call) {
            Ok(call) => finalized.push(call),
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(finalized)
    } else {
        Err(FinalizeError::ToolCalls(errors.join("; ")))
    }
}

fn finalize_tool_call(call: &ToolCallDelta) -> Result<ToolCall, String> {
    let name = match call.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err("name: can't be blank".into()),
    };
    let arguments = parse_tool_arguments(call.arguments.as_deref()).map_err(|e| format!("arguments: {e}"))?;
    let call_id = call
        .call_id
        .clone()
        .unwrap_or_else(|| ToolCallId::new().into_string());
    Ok(ToolCall {
        call_id,
        name,
        arguments,
        index: call.index,
    })
}

/// Parse accumulated tool-call argument text into a JSON object.
/// Empty input is an empty object.
pub fn parse_tool_arguments(raw: Option<&str>) -> Result<Map<String, Value>, &'static str> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(Map::new()),
        Some(raw) => raw,
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("a json object is expected for tool arguments"),
        Err(_) => Err("invalid json"),
    }
}

impl MessageDelta {
    /// See [`finalize`].
    pub fn into_message(self) -> Result<Message, FinalizeError> {
        finalize(self)
    }
}
