pub mod assembler;
pub mod delta;
pub mod errors;
pub mod finalize;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod settings;
pub mod tools;
pub mod usage;

pub use assembler::{decode_chunk, FrameStream, StreamAssembler};
pub use delta::{merge, merge_deltas, DeltaContent, MessageDelta, ToolCallDelta, ToolCallStatus};
pub use errors::ProviderError;
pub use finalize::{finalize, finalize_cancelled, FinalizeError};
pub use frame::{decode_frame, FrameError};
pub use messages::{ContentPart, Message, MessageStatus, PartKind, Role, ToolCall, ToolResult};
pub use settings::ChainSettings;
pub use tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};
pub use usage::TokenUsage;
