pub mod model;
pub mod pipeline;
pub mod reliable;
pub mod transform;

pub mod mock;

pub use model::{output_stream, ChatModel, ModelConfig, ModelOutput, ModelStream};
pub use pipeline::deltas_from_bytes;
pub use reliable::{ReliableModel, RetryPolicy};
pub use transform::{AnthropicEventTransformer, OpenAiChunkTransformer, PayloadTransformer, Transformed};
