//! Newline-delimited JSON framing for the session stream.
//!
//! Wire format: each frame is one JSON object serialized to UTF-8 and
//! terminated by `\n`. A reader accumulates bytes until it sees the
//! delimiter, then parses the line. TCP gives no message boundaries, so the
//! [`FrameDecoder`] buffers partial frames across reads and can return
//! several messages from a single read.
//!
//! Two hard rules guard the framing layer:
//!
//! - Frames longer than [`MAX_FRAME_LEN`] are a protocol violation in both
//!   directions. The encoder refuses to produce one and the decoder refuses
//!   to keep buffering past the ceiling, so a misbehaving peer cannot make
//!   us hold unbounded memory.
//! - An unrecognized `type` value is a protocol violation. Unknown
//!   *top-level keys* inside a known message are ignored for forward
//!   compatibility.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::{WireMessage, MAX_FRAME_LEN};

/// Errors from framing, encoding, or decoding. All of them are protocol
/// violations that close the session.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// A frame exceeded [`MAX_FRAME_LEN`] bytes.
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge { len: usize },

    /// The line was not a JSON object of a known shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The `type` field named a message kind we do not know.
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
}

/// Encodes one message as a newline-terminated JSON frame.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] if the serialized frame would
/// exceed [`MAX_FRAME_LEN`], and [`CodecError::Malformed`] if serialization
/// itself fails (which only happens for non-finite floats).
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf =
        serde_json::to_vec(msg).map_err(|e| CodecError::Malformed(e.to_string()))?;
    buf.push(b'\n');
    if buf.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: buf.len() });
    }
    Ok(buf)
}

/// Incremental frame decoder: feed it raw reads, get complete messages out.
///
/// One decoder instance exists per socket direction; it owns the partial
/// frame between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every complete message now available.
    ///
    /// Empty lines are skipped. After any error the decoder must be
    /// discarded along with its session; no resynchronization is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] when the unterminated tail
    /// grows past the ceiling, and [`CodecError::Malformed`] /
    /// [`CodecError::UnknownType`] for unparseable lines.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<WireMessage>, CodecError> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.len() + 1 > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge { len: line.len() + 1 });
            }
            if line.is_empty() {
                continue;
            }
            messages.push(decode_line(line)?);
        }

        // No delimiter yet: keep buffering, but never past the frame limit.
        if self.buf.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len: self.buf.len() });
        }
        Ok(messages)
    }
}

/// Decodes a single frame (without its trailing newline).
fn decode_line(line: &[u8]) -> Result<WireMessage, CodecError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("missing \"type\" field".to_string()))?;
    if !matches!(kind, "handshake" | "auth_response" | "event" | "bye") {
        return Err(CodecError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}
