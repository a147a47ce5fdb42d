//! Binary event-stream frame codec.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [total_len:u32][headers_len:u32][prelude_crc:u32][headers][body][message_crc:u32]
//! ```
//!
//! `prelude_crc` covers the first 8 bytes and `message_crc` covers every
//! byte before it. Headers are skipped, never interpreted. The body is a
//! JSON envelope `{"bytes": "<base64>"}` wrapping the actual event payload.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

/// Bytes before the headers: two lengths and the prelude checksum.
pub const PRELUDE_LEN: usize = 12;
/// Trailing message checksum.
pub const TRAILER_LEN: usize = 4;
/// Smallest legal frame: empty headers and body.
pub const MIN_FRAME_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
/// Frames claiming more than this are rejected instead of buffered.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumPart {
    Prelude,
    Message,
}

impl fmt::Display for ChecksumPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prelude => f.write_str("prelude"),
            Self::Message => f.write_str("message"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// More bytes are needed before the frame can be decoded.
    #[error("incomplete frame: need {needed} bytes, have {have}")]
    Incomplete { needed: usize, have: usize },
    #[error("{part} checksum mismatch")]
    Checksum { part: ChecksumPart },
    #[error("frame decode error: {0}")]
    Decode(String),
}

impl FrameError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// One frame split out of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub body: &'a [u8],
    pub remaining: &'a [u8],
    /// Bytes consumed from the input.
    pub frame_len: usize,
}

/// Decode the first frame in `buf`.
pub fn decode_frame(buf: &[u8]) -> Result<DecodedFrame<'_>, FrameError> {
    if buf.len() < PRELUDE_LEN {
        let needed = read_u32(buf, 0).map_or(MIN_FRAME_LEN, |n| (n as usize).max(MIN_FRAME_LEN));
        return Err(FrameError::Incomplete {
            needed,
            have: buf.len(),
        });
    }

    let total_len = frame_len_hint(buf).ok_or_else(|| FrameError::Decode("short prelude".into()))?;
    let headers_len = read_u32(buf, 4).ok_or_else(|| FrameError::Decode("short prelude".into()))? as usize;
    let prelude_crc = read_u32(buf, 8).ok_or_else(|| FrameError::Decode("short prelude".into()))?;

    if crc32fast::hash(&buf[..8]) != prelude_crc {
        return Err(FrameError::Checksum {
            part: ChecksumPart::Prelude,
        });
    }
    if total_len < MIN_FRAME_LEN {
        return Err(FrameError::Decode(format!(
            "frame length {total_len} below minimum {MIN_FRAME_LEN}"
        )));
    }
    if total_len > MAX_FRAME_LEN {
        return Err(FrameError::Decode(format!(
            "frame length {total_len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    if headers_len > total_len - MIN_FRAME_LEN {
        return Err(FrameError::Decode(format!(
            "headers length {headers_len} does not fit frame of {total_len} bytes"
        )));
    }
    if buf.len() < total_len {
        return Err(FrameError::Incomplete {
            needed: total_len,
            have: buf.len(),
        });
    }

    let crc_offset = total_len - TRAILER_LEN;
    let message_crc = read_u32(buf, crc_offset).ok_or_else(|| FrameError::Decode("short trailer".into()))?;
    if crc32fast::hash(&buf[..crc_offset]) != message_crc {
        return Err(FrameError::Checksum {
            part: ChecksumPart::Message,
        });
    }

    Ok(DecodedFrame {
        body: &buf[PRELUDE_LEN + headers_len..crc_offset],
        remaining: &buf[total_len..],
        frame_len: total_len,
    })
}

/// Declared total length of the frame at the start of `buf`, if readable.
pub fn frame_len_hint(buf: &[u8]) -> Option<usize> {
    read_u32(buf, 0).map(|n| n as usize)
}

/// Build a frame around `headers` (already encoded) and `body`.
pub fn encode_frame(headers: &[u8], body: &[u8]) -> Vec<u8> {
    let total_len = MIN_FRAME_LEN + headers.len() + body.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&out);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(headers);
    out.extend_from_slice(body);
    let message_crc = crc32fast::hash(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

/// Encode string-valued headers in the event-stream header format.
pub fn encode_headers(headers: &[(&str, &str)]) -> Vec<u8> {
    const STRING_TYPE: u8 = 7;
    let mut out = Vec::new();
    for (name, value) in headers {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(STRING_TYPE);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// The header triple every payload frame carries.
pub fn standard_headers() -> Vec<u8> {
    encode_headers(&[
        (":event-type", "chunk"),
        (":content-type", "application/json"),
        (":message-type", "event"),
    ])
}

/// Unwrap the `{"bytes": base64}` envelope and parse the inner JSON.
pub fn decode_event_payload(body: &[u8]) -> Result<Value, FrameError> {
    let envelope: Value = serde_json::from_slice(body)
        .map_err(|e| FrameError::Decode(format!("invalid envelope json: {e}")))?;
    let encoded = match envelope.get("bytes").and_then(Value::as_str) {
        Some(encoded) => encoded,
        None => {
            let detail = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("missing bytes field");
            return Err(FrameError::Decode(format!("envelope without payload: {detail}")));
        }
    };
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| FrameError::Decode(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| FrameError::Decode(format!("invalid payload json: {e}")))
}

/// Inverse of [`decode_event_payload`].
pub fn encode_event_payload(payload: &Value) -> Vec<u8> {
    let inner = payload.to_string();
    let envelope = serde_json::json!({ "bytes": STANDARD.encode(inner.as_bytes()) });
    envelope.to_string().into_bytes()
}

/// A complete payload frame as a provider would send it.
pub fn encode_payload_frame(payload: &Value) -> Vec<u8> {
    encode_frame(&standard_headers(), &encode_event_payload(payload))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
