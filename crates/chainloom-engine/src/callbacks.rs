use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use chainloom_core::delta::MessageDelta;
use chainloom_core::errors::ProviderError;
use chainloom_core::messages::{Message, ToolCall};
use chainloom_core::usage::TokenUsage;

use crate::executor::panic_message;

/// Something observable that happened while a chain was running.
#[derive(Debug)]
pub enum ChainEvent<'a> {
    /// A fragment was folded into the in-progress delta; carries the merged state.
    DeltaMerged { delta: &'a MessageDelta },
    MessageFinalized { message: &'a Message },
    /// An assistant message passed every processor and was appended.
    MessageProcessed { message: &'a Message },
    ToolExecutionStarted { call: &'a ToolCall },
    ToolResponseCreated { message: &'a Message },
    ProcessingError { error: &'a str },
    RetriesExceeded { failure_count: u32 },
    FallbackActivated { from: &'a str, to: &'a str, error: &'a ProviderError },
    TokenUsage { usage: &'a TokenUsage },
    Interrupted { reason: &'a str },
}

impl ChainEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeltaMerged { .. } => "delta_merged",
            Self::MessageFinalized { .. } => "message_finalized",
            Self::MessageProcessed { .. } => "message_processed",
            Self::ToolExecutionStarted { .. } => "tool_execution_started",
            Self::ToolResponseCreated { .. } => "tool_response_created",
            Self::ProcessingError { .. } => "processing_error",
            Self::RetriesExceeded { .. } => "retries_exceeded",
            Self::FallbackActivated { .. } => "fallback_activated",
            Self::TokenUsage { .. } => "token_usage",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

pub type ChainHandler = Arc<dyn Fn(&ChainEvent<'_>) + Send + Sync>;

/// Synchronous observers. A panicking handler is logged and skipped; the
/// remaining handlers still run.
#[derive(Clone, Default)]
pub struct ChainCallbacks {
    handlers: Vec<ChainHandler>,
}

impl ChainCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, handler: impl Fn(&ChainEvent<'_>) + Send + Sync + 'static) -> Self {
        self.push(handler);
        self
    }

    pub fn push(&mut self, handler: impl Fn(&ChainEvent<'_>) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn emit(&self, event: &ChainEvent<'_>) {
        for handler in &self.handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(event = event.name(), panic = %panic_message(&panic), "chain callback panicked");
            }
        }
    }
}

impl fmt::Debug for ChainCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainCallbacks")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
