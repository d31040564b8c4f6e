//! Wire codec: splitting the byte stream into JSON objects.
//!
//! The protocol has no length prefix or delimiter; each message is one
//! top-level JSON object written back to back with the next. The framer scans
//! for balanced braces, ignoring braces inside strings, so one malformed
//! object never desynchronises the objects that follow it.

use base64::{engine::general_purpose, Engine as _};
use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use crate::error::ClientError;
use crate::message::Message;

const INITIAL_CAPACITY: usize = 4096;
const READ_CHUNK: usize = 1024;

/// One unit cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete top-level object. It may still fail to parse.
    Object(Bytes),
    /// Bytes found between objects.
    Garbage { len: usize },
    /// An object left unterminated at end of stream.
    Truncated { len: usize },
}

impl Frame {
    pub fn decode(self) -> Result<Message, ClientError> {
        match self {
            Frame::Object(bytes) => decode_message(&bytes),
            Frame::Garbage { len } => Err(ClientError::Decode(format!(
                "{len} unexpected bytes outside a JSON object"
            ))),
            Frame::Truncated { len } => Err(ClientError::Decode(format!(
                "stream ended inside a {len} byte JSON object"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct JsonFramer {
    buf: BytesMut,
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    garbage: usize,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            pos: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            garbage: 0,
        }
    }

    /// Buffer to read into; new bytes must only be appended.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// A run of garbage is held back until the next object starts, so a run
    /// split across reads is still reported once. See [`Self::take_garbage`]
    /// and [`Self::finish`] for the tail of the stream.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];

            if self.depth == 0 {
                if b == b'{' {
                    if let Some(frame) = self.take_garbage() {
                        return Some(frame);
                    }
                    self.depth = 1;
                    self.pos += 1;
                } else if b.is_ascii_whitespace() && self.garbage == 0 {
                    self.buf.advance(1);
                } else {
                    self.garbage += 1;
                    self.buf.advance(1);
                }
                continue;
            }

            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => self.depth -= 1,
                _ => {}
            }

            if self.depth == 0 {
                let frame = self.buf.split_to(self.pos).freeze();
                self.pos = 0;
                return Some(Frame::Object(frame));
            }
        }

        None
    }

    /// Flush whatever is left at end of stream. Call until it returns `None`.
    pub fn finish(&mut self) -> Option<Frame> {
        if let Some(frame) = self.next_frame().or_else(|| self.take_garbage()) {
            return Some(frame);
        }
        if self.depth > 0 {
            let len = self.buf.len();
            self.buf.clear();
            self.pos = 0;
            self.depth = 0;
            self.in_string = false;
            self.escaped = false;
            return Some(Frame::Truncated { len });
        }
        None
    }

    /// The garbage run seen so far, if any.
    pub fn take_garbage(&mut self) -> Option<Frame> {
        if self.garbage == 0 {
            return None;
        }
        let len = std::mem::take(&mut self.garbage);
        Some(Frame::Garbage { len })
    }
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, ClientError> {
    serde_json::from_slice(bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

/// The `nonce` of an object that does not decode as a [`Message`], if it is
/// still valid JSON carrying a base64 nonce.
pub fn peek_nonce(bytes: &[u8]) -> Option<Vec<u8>> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let nonce = value.get("nonce")?.as_str()?;
    general_purpose::STANDARD.decode(nonce).ok()
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(msg).map_err(|e| ClientError::Encode(e.to_string()))
}
