use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::usage::TokenUsage;

/// Free-form per-part or per-result settings (cache control, signatures, ...).
pub type Options = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Incomplete,
    Complete,
    Cancelled,
    /// Generation stopped at the provider's output token limit.
    Length,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Incomplete)
    }

    /// Status only moves toward a terminal state. A later terminal status
    /// replaces an earlier one; an incomplete one never regresses it.
    pub fn advance(self, next: MessageStatus) -> MessageStatus {
        if next.is_terminal() {
            next
        } else {
            self
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Thinking,
    Image,
    File,
}

/// One ordered piece of message content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Options,
}

impl ContentPart {
    pub fn new(kind: PartKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: Some(content.into()),
            options: Options::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(PartKind::Text, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(PartKind::Thinking, content)
    }

    /// An image given as a URL or base64 payload.
    pub fn image(content: impl Into<String>) -> Self {
        Self::new(PartKind::Image, content)
    }

    pub fn file(content: impl Into<String>) -> Self {
        Self::new(PartKind::File, content)
    }

    /// A part with only options set, e.g. a thinking signature fragment.
    pub fn empty(kind: PartKind) -> Self {
        Self {
            kind,
            content: None,
            options: Options::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == PartKind::Text
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Fold a same-kind fragment into this part: content is concatenated and
    /// options are unioned with the incoming value winning, except that an
    /// incoming null never erases an existing value.
    pub fn absorb(&mut self, incoming: ContentPart) {
        if let Some(more) = incoming.content {
            match self.content.as_mut() {
                Some(existing) => existing.push_str(&more),
                None => self.content = Some(more),
            }
        }
        for (key, value) in incoming.options {
            if value.is_null() && self.options.contains_key(&key) {
                continue;
            }
            self.options.insert(key, value);
        }
    }
}

/// A finalized, model-requested function invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            index: None,
        }
    }
}

/// Outcome of one tool call. Exactly one is produced per call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Options,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, name: impl Into<String>, content: Vec<ContentPart>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content,
            is_error: false,
            display_text: None,
            processed_content: None,
            options: Options::new(),
        }
    }

    pub fn error(tool_call_id: impl Into<String>, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(tool_call_id, name, vec![ContentPart::text(reason)])
        }
    }

    pub fn text_content(&self) -> String {
        join_text(&self.content)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// A finalized conversation message. Content is always stored as a part
/// list; plain string content is migrated on deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<ContentPart>,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    /// Structured output attached by a message processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_content: Option<Value>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

fn default_status() -> MessageStatus {
    MessageStatus::Complete
}

// --- Convenience constructors ---

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            status: MessageStatus::Complete,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            processed_content: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, Vec::new())
        }
    }

    pub fn tool(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::new(Role::Tool, Vec::new())
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Concatenated text of all text parts, the legacy flattened view.
    pub fn text_content(&self) -> String {
        join_text(&self.content)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_tool_errors(&self) -> bool {
        self.tool_results.iter().any(|r| r.is_error)
    }

    pub fn tool_result_for(&self, tool_name: &str) -> Option<&ToolResult> {
        self.tool_results.iter().find(|r| r.name == tool_name)
    }

    /// Whether appending this message leaves the conversation waiting on
    /// the model.
    pub fn needs_response(&self) -> bool {
        matches!(self.role, Role::User | Role::Tool)
            || (self.role == Role::Assistant && self.has_tool_calls())
    }
}

fn join_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter(|p| p.is_text())
        .map(ContentPart::content_str)
        .collect()
}

/// Accepts either a bare string or a part list and always yields a part list.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentPart>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Parts(Vec<ContentPart>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::Text(text)) if text.is_empty() => Vec::new(),
        Some(Raw::Text(text)) => vec![ContentPart::text(text)],
        Some(Raw::Parts(parts)) => parts,
    })
}
