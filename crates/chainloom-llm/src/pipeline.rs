use std::sync::Arc;

use futures::{future, Stream, StreamExt};
use tracing::trace;

use chainloom_core::assembler::FrameStream;
use chainloom_core::errors::ProviderError;

use crate::model::{ModelOutput, ModelStream};
use crate::transform::{PayloadTransformer, Transformed};

/// Turn a raw event-stream byte transport into model outputs.
///
/// Frames are reassembled across chunk boundaries, each payload is mapped
/// by `transformer`, and keep-alives are dropped. Transport errors surface
/// as [`ProviderError::Network`].
pub fn deltas_from_bytes<S, B, E>(bytes: S, transformer: Arc<dyn PayloadTransformer>) -> ModelStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = FrameStream::new(bytes).filter_map(move |item| {
        let out = match item {
            Ok(payload) => match transformer.transform(&payload) {
                Transformed::Delta(delta) => Some(Ok(ModelOutput::Delta(delta))),
                Transformed::Usage(usage) => Some(Ok(ModelOutput::Usage(usage))),
                Transformed::Skip => {
                    trace!("skipping payload without content");
                    None
                }
                Transformed::Error(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(ProviderError::Network(e.to_string()))),
        };
        future::ready(out)
    });
    Box::pin(stream)
}
