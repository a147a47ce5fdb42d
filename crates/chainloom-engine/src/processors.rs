//! Post-processing of finalized assistant messages.
//!
//! Processors run in order. Each either hands an updated message to the
//! next one or halts the chain with a corrective message that is sent
//! back to the model.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use chainloom_core::messages::Message;

#[derive(Clone, Debug, PartialEq)]
pub enum ProcessorOutcome {
    Continue(Message),
    /// Stop processing; the replacement is appended after the message.
    Halt(Message),
}

pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, message: Message) -> ProcessorOutcome;
}

/// Trims surrounding whitespace from every text part.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrimText;

impl MessageProcessor for TrimText {
    fn name(&self) -> &str {
        "trim_text"
    }

    fn process(&self, mut message: Message) -> ProcessorOutcome {
        for part in message.content.iter_mut().filter(|p| p.is_text()) {
            if let Some(text) = part.content.as_mut() {
                let trimmed = text.trim();
                if trimmed.len() != text.len() {
                    *text = trimmed.to_string();
                }
            }
        }
        ProcessorOutcome::Continue(message)
    }
}

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("json fence pattern is valid"));

/// Parses the assistant's text as JSON into `processed_content`.
///
/// With a fence pattern the first capture group is parsed instead of the
/// whole text. Unparseable output halts with a user message asking the
/// model to correct itself.
#[derive(Clone, Debug, Default)]
pub struct JsonProcessor {
    fence: Option<Regex>,
}

impl JsonProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the body of a ```` ```json ```` fenced block before parsing.
    pub fn fenced() -> Self {
        Self {
            fence: Some(JSON_FENCE.clone()),
        }
    }

    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            fence: Some(Regex::new(pattern)?),
        })
    }

    fn extract<'t>(&self, text: &'t str) -> Option<&'t str> {
        match &self.fence {
            None => Some(text),
            Some(re) => re
                .captures(text)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_str()),
        }
    }
}

impl MessageProcessor for JsonProcessor {
    fn name(&self) -> &str {
        "json"
    }

    fn process(&self, mut message: Message) -> ProcessorOutcome {
        let text = message.text_content();
        let Some(body) = self.extract(&text) else {
            return ProcessorOutcome::Halt(Message::user(
                "ERROR: No JSON found in a ```json fenced block. Please reply with one.",
            ));
        };
        match serde_json::from_str::<Value>(body.trim()) {
            Ok(value) => {
                message.processed_content = Some(value);
                ProcessorOutcome::Continue(message)
            }
            Err(e) => ProcessorOutcome::Halt(Message::user(format!("ERROR: Invalid JSON data: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainloom_core::messages::{ContentPart, Role};
    use serde_json::json;

    fn unwrap_continue(outcome: ProcessorOutcome) -> Message {
        match outcome {
            ProcessorOutcome::Continue(m) => m,
            ProcessorOutcome::Halt(m) => panic!("unexpected halt: {}", m.text_content()),
        }
    }

    #[test]
    fn trim_text_only_touches_text() {
        let mut msg = Message::assistant("  hi \n");
        msg.content.push(ContentPart::thinking("  keep  "));
        let out = unwrap_continue(TrimText.process(msg));
        assert_eq!(out.content[0].content_str(), "hi");
        assert_eq!(out.content[1].content_str(), "  keep  ");
    }

    #[test]
    fn json_whole_text() {
        let out = unwrap_continue(JsonProcessor::new().process(Message::assistant(r#" {"a": [1, 2]} "#)));
        assert_eq!(out.processed_content, Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn json_fenced_block() {
        let text = "Here you go:\n```json\n{\"city\": \"Oslo\"}\n```\nAnything else?";
        let out = unwrap_continue(JsonProcessor::fenced().process(Message::assistant(text)));
        assert_eq!(out.processed_content, Some(json!({"city": "Oslo"})));
    }

    #[test]
    fn json_invalid_halts_with_user_message() {
        match JsonProcessor::new().process(Message::assistant("not json")) {
            ProcessorOutcome::Halt(m) => {
                assert_eq!(m.role, Role::User);
                assert!(m.text_content().starts_with("ERROR: Invalid JSON data"));
            }
            other => panic!("expected halt, got {other:?}"),
        }
    }

    #[test]
    fn json_missing_fence_halts() {
        let outcome = JsonProcessor::fenced().process(Message::assistant("{\"a\": 1}"));
        assert!(matches!(outcome, ProcessorOutcome::Halt(_)));
    }

    #[test]
    fn custom_pattern() {
        let p = JsonProcessor::with_pattern(r"<json>(.*)</json>").unwrap();
        let out = unwrap_continue(p.process(Message::assistant("<json>[1]</json>")));
        assert_eq!(out.processed_content, Some(json!([1])));
        assert!(JsonProcessor::with_pattern("(").is_err());
    }
}
