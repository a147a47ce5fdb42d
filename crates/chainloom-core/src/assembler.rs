use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::{ready, Stream};
use pin_project_lite::pin_project;
use serde_json::Value;
use tracing::{trace, warn};

use crate::frame::{decode_event_payload, decode_frame, frame_len_hint, ChecksumPart, FrameError};

/// Per-connection frame buffer. Feed it raw chunks in arrival order; it
/// yields every payload that became complete and keeps the partial tail.
///
/// A corrupt frame never aborts the stream: a frame whose message checksum
/// or payload fails is skipped, and a buffer whose prelude cannot be trusted
/// is dropped entirely.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: BytesMut,
    frames_decoded: u64,
    frames_dropped: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from bytes carried over from an earlier connection read.
    pub fn with_buffer(seed: &[u8]) -> Self {
        Self {
            buffer: BytesMut::from(seed),
            ..Self::default()
        }
    }

    /// Append `chunk` and decode as many frames as possible.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while !self.buffer.is_empty() {
            let result = decode_frame(&self.buffer).map(|frame| {
                (frame.frame_len, decode_event_payload(frame.body))
            });
            match result {
                Ok((consumed, payload)) => {
                    // A frame always consumes at least its prelude and trailer,
                    // so this only trips on a decoder bug.
                    if consumed == 0 || consumed > self.buffer.len() {
                        warn!(consumed, buffered = self.buffer.len(), "frame decoder made no progress");
                        self.drop_buffer();
                        break;
                    }
                    self.buffer.advance(consumed);
                    match payload {
                        Ok(value) => {
                            self.frames_decoded += 1;
                            payloads.push(value);
                        }
                        Err(e) => {
                            self.frames_dropped += 1;
                            warn!(error = %e, frame_len = consumed, "dropping undecodable frame payload");
                        }
                    }
                }
                Err(FrameError::Incomplete { needed, have }) => {
                    trace!(needed, have, "waiting for more frame bytes");
                    break;
                }
                Err(FrameError::Checksum { part: ChecksumPart::Message }) => {
                    // The prelude checked out, so the declared length is usable.
                    let skip = frame_len_hint(&self.buffer).unwrap_or(self.buffer.len());
                    self.frames_dropped += 1;
                    warn!(part = "message", frame_len = skip, "dropping frame with bad checksum");
                    self.buffer.advance(skip.min(self.buffer.len()));
                }
                Err(e) => {
                    warn!(error = %e, dropped_bytes = self.buffer.len(), "dropping unparseable stream tail");
                    self.drop_buffer();
                    break;
                }
            }
        }

        payloads
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    fn drop_buffer(&mut self) {
        self.frames_dropped += 1;
        self.buffer.clear();
    }
}

/// Stateless form: decode `chunk` on top of a carried-over `buffer` and
/// return the payloads plus the new carry-over.
pub fn decode_chunk(buffer: &[u8], chunk: &[u8]) -> (Vec<Value>, Vec<u8>) {
    let mut assembler = StreamAssembler::with_buffer(buffer);
    let payloads = assembler.push(chunk);
    (payloads, assembler.into_buffer())
}

pin_project! {
    /// Adapts a stream of raw byte chunks into a stream of decoded payloads.
    pub struct FrameStream<S> {
        #[pin]
        inner: S,
        assembler: StreamAssembler,
        pending: VecDeque<Value>,
        done: bool,
    }
}

impl<S> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            assembler: StreamAssembler::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn assembler(&self) -> &StreamAssembler {
        &self.assembler
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    type Item = Result<Value, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(value) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(value)));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.pending.extend(this.assembler.push(chunk.as_ref())),
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    if !this.assembler.is_empty() {
                        warn!(
                            leftover = this.assembler.buffered().len(),
                            "byte stream ended inside a frame"
                        );
                    }
                    *this.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, encode_payload_frame, standard_headers};
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn two_frames() -> (Vec<u8>, Value, Value) {
        let a = json!({"n": 1});
        let b = json!({"n": 2});
        let mut bytes = encode_payload_frame(&a);
        bytes.extend_from_slice(&encode_payload_frame(&b));
        (bytes, a, b)
    }

    #[test]
    fn whole_frames_in_one_chunk() {
        let (bytes, a, b) = two_frames();
        let mut asm = StreamAssembler::new();
        assert_eq!(asm.push(&bytes), vec![a, b]);
        assert!(asm.is_empty());
        assert_eq!(asm.frames_decoded(), 2);
    }

    #[test]
    fn byte_at_a_time() {
        let (bytes, a, b) = two_frames();
        let mut asm = StreamAssembler::new();
        let mut out = Vec::new();
        for byte in &bytes {
            out.extend(asm.push(std::slice::from_ref(byte)));
        }
        assert_eq!(out, vec![a, b]);
        assert!(asm.is_empty());
    }

    #[test]
    fn partial_tail_is_carried_over() {
        let (bytes, a, b) = two_frames();
        let split = bytes.len() - 5;
        let (payloads, carry) = decode_chunk(&[], &bytes[..split]);
        assert_eq!(payloads, vec![a]);
        assert_eq!(carry.len(), bytes.len() / 2 - 5);
        let (payloads, carry) = decode_chunk(&carry, &bytes[split..]);
        assert_eq!(payloads, vec![b]);
        assert!(carry.is_empty());
    }

    #[test]
    fn bad_message_checksum_skips_one_frame() {
        let (mut bytes, _, b) = two_frames();
        bytes[PRELUDE_BODY_OFFSET] ^= 0xff;
        let mut asm = StreamAssembler::new();
        assert_eq!(asm.push(&bytes), vec![b]);
        assert_eq!(asm.frames_dropped(), 1);
    }

    #[test]
    fn bad_prelude_drops_tail() {
        let (mut bytes, _, _) = two_frames();
        bytes[0] ^= 0x01;
        let mut asm = StreamAssembler::new();
        assert!(asm.push(&bytes).is_empty());
        assert!(asm.is_empty());
    }

    #[test]
    fn undecodable_payload_is_skipped() {
        let junk = encode_frame(&standard_headers(), b"not an envelope");
        let good = json!({"ok": true});
        let mut bytes = junk;
        bytes.extend_from_slice(&encode_payload_frame(&good));
        let mut asm = StreamAssembler::new();
        assert_eq!(asm.push(&bytes), vec![good]);
        assert_eq!(asm.frames_dropped(), 1);
    }

    #[test]
    fn seeded_buffer_is_used() {
        let (bytes, a, _) = two_frames();
        let first_len = bytes.len() / 2;
        let mut asm = StreamAssembler::with_buffer(&bytes[..10]);
        assert_eq!(asm.push(&bytes[10..first_len]), vec![a]);
    }

    #[tokio::test]
    async fn frame_stream_yields_payloads() {
        let (bytes, a, b) = two_frames();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();
        let stream = FrameStream::new(tokio_stream::iter(chunks));
        let out: Vec<Value> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec![a, b]);
    }

    #[tokio::test]
    async fn frame_stream_propagates_transport_errors() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Err("reset".into())];
        let mut stream = Box::pin(FrameStream::new(tokio_stream::iter(chunks)));
        assert_eq!(stream.next().await, Some(Err("reset".to_string())));
        assert_eq!(stream.next().await, None);
    }

    /// Offset of the first body/header byte of the first frame.
    const PRELUDE_BODY_OFFSET: usize = crate::frame::PRELUDE_LEN + 1;
}
