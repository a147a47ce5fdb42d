//! Incremental message state built from streamed fragments.
//!
//! Every fragment is a [`MessageDelta`]. [`merge`] folds one fragment into
//! the accumulated state and is a pure function of its two inputs, so
//! splitting a fragment stream at any point and continuing the fold from the
//! intermediate state gives the same result as folding it in one pass.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::messages::{ContentPart, MessageStatus, PartKind, Role};
use crate::usage::{add_usage, TokenUsage};

/// Upper bound on content-part positions a message may address. Parts
/// indexed at or past it are dropped instead of padding the gap.
pub const MAX_CONTENT_PARTS: usize = 1024;

/// Raw content carried by a single fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaContent {
    /// Legacy plain text, appended to the trailing text part.
    Text(String),
    Part(ContentPart),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Incomplete,
    Complete,
}

/// A tool call while its fields are still streaming in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw JSON text accumulated so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default)]
    pub status: ToolCallStatus,
}

impl ToolCallDelta {
    /// The opening fragment of a call: identity without arguments.
    pub fn start(index: u32, call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// An argument fragment addressed by index.
    pub fn arguments_at(index: u32, fragment: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            arguments: Some(fragment.into()),
            ..Self::default()
        }
    }

    fn matches(&self, incoming: &ToolCallDelta) -> bool {
        if let (Some(a), Some(b)) = (self.index, incoming.index) {
            if a == b {
                return true;
            }
        }
        matches!((&self.call_id, &incoming.call_id), (Some(a), Some(b)) if a == b)
    }

    /// Identity fields are set once and never cleared; arguments accumulate.
    fn absorb(&mut self, incoming: ToolCallDelta) {
        if self.index.is_none() {
            self.index = incoming.index;
        }
        if self.call_id.is_none() {
            self.call_id = incoming.call_id;
        }
        if self.name.is_none() {
            self.name = incoming.name;
        }
        if let Some(fragment) = incoming.arguments {
            match self.arguments.as_mut() {
                Some(existing) => existing.push_str(&fragment),
                None => self.arguments = Some(fragment),
            }
        }
        if incoming.status == ToolCallStatus::Complete {
            self.status = ToolCallStatus::Complete;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// A streamed fragment, and also the accumulated in-progress message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// The raw content of this fragment. Cleared once merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<DeltaContent>,
    /// Content accumulated so far. `None` entries are gap placeholders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_content: Vec<Option<ContentPart>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default)]
    pub status: MessageStatus,
    /// Position the fragment's content parts are addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default)]
    pub metadata: DeltaMetadata,
}

impl MessageDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(DeltaContent::Text(text.into())),
            ..Self::default()
        }
    }

    pub fn part(index: usize, part: ContentPart) -> Self {
        Self {
            content: Some(DeltaContent::Part(part)),
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn tool_call(call: ToolCallDelta) -> Self {
        Self {
            tool_calls: vec![call],
            ..Self::default()
        }
    }

    pub fn with_status(status: MessageStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            metadata: DeltaMetadata { usage: Some(usage) },
            ..Self::default()
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Role of the message being built. Streams without an explicit role
    /// are assistant output.
    pub fn effective_role(&self) -> Role {
        self.role.unwrap_or(Role::Assistant)
    }

    /// Text accumulated so far, for progress displays.
    pub fn text_so_far(&self) -> String {
        self.merged_content
            .iter()
            .flatten()
            .filter(|p| p.is_text())
            .map(ContentPart::content_str)
            .collect()
    }

    /// Fold `fragment` into this state.
    pub fn merge(mut self, fragment: MessageDelta) -> MessageDelta {
        self.apply(fragment);
        self
    }

    fn apply(&mut self, fragment: MessageDelta) {
        let MessageDelta {
            role,
            content,
            merged_content,
            tool_calls,
            status,
            index,
            metadata,
        } = fragment;

        if role.is_some() {
            self.role = role;
        }

        match content {
            None => {}
            Some(DeltaContent::Text(text)) => self.append_text(text),
            Some(DeltaContent::Part(part)) => {
                let at = self.target_index(index);
                self.merge_part_at(at, part);
            }
            Some(DeltaContent::Parts(parts)) => {
                let base = self.target_index(index);
                for (offset, part) in parts.into_iter().enumerate() {
                    self.merge_part_at(base.saturating_add(offset), part);
                }
            }
        }

        // An already-accumulated fragment carries its parts by position.
        for (at, part) in merged_content.into_iter().enumerate() {
            if let Some(part) = part {
                self.merge_part_at(at, part);
            }
        }

        for call in tool_calls {
            self.merge_tool_call(call);
        }

        if index.is_some() {
            self.index = index;
        }

        self.metadata.usage = add_usage(self.metadata.usage.take(), metadata.usage);

        self.status = self.status.advance(status);
        if self.status.is_terminal() {
            for call in &mut self.tool_calls {
                call.status = ToolCallStatus::Complete;
            }
        }
    }

    /// Where an unindexed part lands: the last occupied position, or 0.
    fn target_index(&self, index: Option<usize>) -> usize {
        index.unwrap_or_else(|| self.merged_content.len().saturating_sub(1))
    }

    fn append_text(&mut self, text: String) {
        match self.merged_content.last_mut() {
            Some(Some(part)) if part.kind == PartKind::Text => part.absorb(ContentPart::text(text)),
            _ => self.merged_content.push(Some(ContentPart::text(text))),
        }
    }

    fn merge_part_at(&mut self, at: usize, part: ContentPart) {
        if at >= MAX_CONTENT_PARTS {
            warn!(index = at, limit = MAX_CONTENT_PARTS, "dropping content part past the part limit");
            return;
        }
        if at >= self.merged_content.len() {
            self.merged_content.resize(at, None);
            self.merged_content.push(Some(part));
            return;
        }
        let slot = &mut self.merged_content[at];
        match slot {
            Some(existing) if existing.kind == part.kind => existing.absorb(part),
            // Empty placeholder, or a different kind: the newest part wins.
            _ => *slot = Some(part),
        }
    }

    fn merge_tool_call(&mut self, incoming: ToolCallDelta) {
        if let Some(existing) = self.tool_calls.iter_mut().find(|c| c.matches(&incoming)) {
            existing.absorb(incoming);
            return;
        }
        // An anonymous fragment continues the most recent call.
        if incoming.index.is_none() && incoming.call_id.is_none() {
            if let Some(last) = self.tool_calls.last_mut() {
                last.absorb(incoming);
                return;
            }
        }
        let position = match incoming.index {
            Some(i) => self
                .tool_calls
                .iter()
                .position(|c| c.index.is_some_and(|existing| existing > i))
                .unwrap_or(self.tool_calls.len()),
            None => self.tool_calls.len(),
        };
        let mut call = ToolCallDelta::default();
        call.absorb(incoming);
        self.tool_calls.insert(position, call);
    }
}

/// Fold `fragment` into `existing`, starting a new delta when there is none.
pub fn merge(existing: Option<MessageDelta>, fragment: MessageDelta) -> MessageDelta {
    existing.unwrap_or_default().merge(fragment)
}

/// Left fold of [`merge`] starting from no delta.
pub fn merge_deltas<I>(fragments: I) -> Option<MessageDelta>
where
    I: IntoIterator<Item = MessageDelta>,
{
    merge_deltas_from(None, fragments)
}

/// Continue a fold from an intermediate state.
pub fn merge_deltas_from<I>(state: Option<MessageDelta>, fragments: I) -> Option<MessageDelta>
where
    I: IntoIterator<Item = MessageDelta>,
{
    fragments
        .into_iter()
        .fold(state, |acc, fragment| Some(merge(acc, fragment)))
}
