//! gRPC message framing.
//!
//! gRPC messages are length-prefixed with the following format:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload

use crate::status::Status;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the gRPC message header (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Default receive limit (4MB, matches gRPC default).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced while deframing a message stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The stream ended part way through a frame.
    #[error("stream truncated: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },
    /// The declared length exceeds the receive limit.
    #[error("received message larger than max ({size} vs. {limit})")]
    MessageTooLarge { size: usize, limit: usize },
    /// The compressed flag carried a value other than 0 or 1.
    #[error("invalid compressed flag {0}")]
    InvalidFlag(u8),
}

impl From<FrameError> for Status {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::MessageTooLarge { .. } => Status::resource_exhausted(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Encode a message into gRPC wire format.
///
/// Returns the encoded message with the length prefix.
pub fn encode_message(data: &[u8]) -> Bytes {
    encode_message_with_compression(data, false)
}

/// Encode a message with explicit compression flag.
pub fn encode_message_with_compression(data: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    write_frame(&mut buf, data, compressed);
    buf.freeze()
}

/// Append a framed message to `buf`.
pub fn write_frame(buf: &mut BytesMut, data: &[u8], compressed: bool) {
    buf.reserve(HEADER_SIZE + data.len());
    buf.put_u8(u8::from(compressed));
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Decode a single message from gRPC wire format.
///
/// Returns `Ok(Some((message, compressed)))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. Nothing is
/// consumed from `buf` unless a full frame is available.
pub fn decode_message(buf: &mut BytesMut, limit: usize) -> Result<Option<(Bytes, bool)>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let compressed = match buf[0] {
        0 => false,
        1 => true,
        flag => return Err(FrameError::InvalidFlag(flag)),
    };
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if length > limit {
        return Err(FrameError::MessageTooLarge {
            size: length,
            limit,
        });
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let message = buf.split_to(length).freeze();

    Ok(Some((message, compressed)))
}

/// Stateful decoder for gRPC messages.
///
/// Data chunks arrive from the transport at arbitrary boundaries; the decoder
/// buffers them until whole frames are available.
#[derive(Debug)]
pub struct MessageDecoder {
    /// Buffer for incomplete messages.
    buffer: BytesMut,
    /// Largest accepted payload.
    limit: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    /// Create a decoder with the default receive limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE)
    }

    /// Create a decoder that rejects payloads larger than `limit`.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            limit,
        }
    }

    /// Feed data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message.
    pub fn decode(&mut self) -> Result<Option<(Bytes, bool)>, FrameError> {
        decode_message(&mut self.buffer, self.limit)
    }

    /// Signal end of stream. Any buffered bytes are a truncated frame.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let expected = if self.buffer.len() >= HEADER_SIZE {
            HEADER_SIZE
                + u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]])
                    as usize
        } else {
            HEADER_SIZE
        };
        Err(FrameError::Truncated {
            expected,
            available: self.buffer.len(),
        })
    }

    /// Check if there's any buffered data.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get the amount of buffered data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
