//! Conversation orchestration: the chain controller, tool execution,
//! message processors and lifecycle callbacks.

pub mod callbacks;
pub mod chain;
pub mod error;
pub mod executor;
pub mod processors;
pub mod registry;

pub use callbacks::{ChainCallbacks, ChainEvent, ChainHandler};
pub use chain::{BeforeFallback, Chain, MergeOutcome, RunMode, RunOptions, RunResult, StepOutcome, ToolBatch};
pub use error::ChainError;
pub use executor::ToolExecutor;
pub use processors::{JsonProcessor, MessageProcessor, ProcessorOutcome, TrimText};
pub use registry::ToolRegistry;
