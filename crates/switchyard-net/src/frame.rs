//! Fixed-header framing for the switchyard wire protocol.
//!
//! Every message on the wire is a self-delimiting frame:
//!
//! ```text
//! +--------------+--------------+--------------+------------------+
//! | protocol id  | message tag  | payload size |     payload      |
//! | u16 LE       | u16 LE       | u16 LE       | (payload size B) |
//! +--------------+--------------+--------------+------------------+
//! ```
//!
//! All header integers are little-endian. The payload size does **not**
//! include the 6 header bytes. Both ends agree on the payload size ceiling
//! out of band; a declared size above that ceiling is a protocol violation
//! that terminates the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 6;

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A payload (declared or actual) exceeds the agreed maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    MessageOverflow {
        /// The offending payload size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// A frame does not fit into the outbound train buffer.
    #[error("frame of {frame} bytes does not fit remaining train capacity {remaining}")]
    TrainOverflow {
        /// Total frame size (header + payload).
        frame: usize,
        /// Free bytes left in the train buffer.
        remaining: usize,
    },

    /// The peer closed the connection mid-frame (or between frames).
    #[error("connection closed")]
    ConnectionClosed,

    /// A payload field read ran past the end of the payload.
    #[error("payload ended after {available} of {requested} requested bytes")]
    ShortPayload {
        /// Bytes the read asked for.
        requested: usize,
        /// Bytes actually left.
        available: usize,
    },

    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidText,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The decoded 6-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol the message belongs to.
    pub protocol_id: u16,
    /// Message tag within the protocol.
    pub tag: u16,
    /// Payload length in bytes.
    pub payload_len: u16,
}

impl FrameHeader {
    /// Create a header from its three fields.
    pub fn new(protocol_id: u16, tag: u16, payload_len: u16) -> Self {
        Self {
            protocol_id,
            tag,
            payload_len,
        }
    }

    /// Encode the header into its 6-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.protocol_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..6].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    /// Decode a header from its 6-byte wire form.
    pub fn decode(bytes: [u8; HEADER_SIZE]) -> Self {
        Self {
            protocol_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            tag: u16::from_le_bytes([bytes[2], bytes[3]]),
            payload_len: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }

    /// Check the declared payload size against the agreed ceiling.
    pub fn validate(&self, max_message_size: usize) -> Result<(), FrameError> {
        if usize::from(self.payload_len) > max_message_size {
            return Err(FrameError::MessageOverflow {
                size: usize::from(self.payload_len),
                max: max_message_size,
            });
        }
        Ok(())
    }
}

/// Cursor over a received payload.
///
/// Handlers read typed fields through this; whatever is left after the
/// handler returns is the unconsumed remainder the dispatcher checks.
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    /// Wrap a complete payload.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn check(&self, requested: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < requested {
            return Err(FrameError::ShortPayload {
                requested,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        self.check(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        self.check(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        self.check(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, FrameError> {
        self.check(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, FrameError> {
        self.check(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, FrameError> {
        let len = usize::from(self.read_u16()?);
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidText)
    }

    /// Discard everything still unread.
    pub fn drain(&mut self) {
        let left = self.buf.remaining();
        self.buf.advance(left);
    }
}

/// Builder for outbound payloads, mirroring [`PayloadReader`].
#[derive(Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Append a little-endian u16.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Append a little-endian u32.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Append a little-endian u64.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Append a u16-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, v: &str) {
        self.write_u16(v.len() as u16);
        self.buf.put_slice(v.as_bytes());
    }

    /// Finish and take the payload bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
