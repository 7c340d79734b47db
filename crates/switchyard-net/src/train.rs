//! Outbound coalescing: the train buffer.
//!
//! Small frames are expensive to write one syscall at a time, so outgoing
//! frames board a shared buffer and leave together. The buffer departs
//! (is flushed to the socket) when it crosses a fill threshold, or when the
//! boarding window elapses after the first frame boarded, whichever comes
//! first. Only the connection's writer task performs the flush; everyone
//! else just appends and signals.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{FrameError, FrameHeader, HEADER_SIZE};

/// Train capacity as a multiple of the maximum message size.
pub const CAPACITY_FACTOR: usize = 6;

/// Flush threshold as a multiple of the maximum message size.
pub const THRESHOLD_FACTOR: usize = 4;

/// Why the writer task was asked to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The buffer crossed the fill threshold (or a frame needs the room).
    Threshold,
    /// A frame boarded an empty buffer; flush when the boarding window ends.
    Boarding,
    /// The endpoint is closing; drain whatever is aboard, then shut down.
    Shutdown,
}

/// Accumulates encoded frames between flushes.
///
/// Not synchronized itself; the owning endpoint serializes access.
pub struct TrainBuffer {
    buf: BytesMut,
    capacity: usize,
    threshold: usize,
}

impl TrainBuffer {
    /// Create a buffer sized for the given maximum message size:
    /// capacity 6x, flush threshold 4x.
    pub fn for_message_size(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_message_size * CAPACITY_FACTOR),
            capacity: max_message_size * CAPACITY_FACTOR,
            threshold: max_message_size * THRESHOLD_FACTOR,
        }
    }

    /// Bytes currently aboard.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no frames.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether a payload of `payload_len` bytes would not fit.
    pub fn would_overflow(&self, payload_len: usize) -> bool {
        self.buf.len() + HEADER_SIZE + payload_len > self.capacity
    }

    /// Append one encoded frame.
    ///
    /// The caller must flush and retry when the frame does not fit; the
    /// buffer is left untouched in that case.
    pub fn append(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), FrameError> {
        if self.would_overflow(payload.len()) {
            return Err(FrameError::TrainOverflow {
                frame: HEADER_SIZE + payload.len(),
                remaining: self.capacity - self.buf.len(),
            });
        }
        self.buf.put_slice(&header.encode());
        self.buf.put_slice(payload);
        Ok(())
    }

    /// Whether the fill threshold has been reached.
    pub fn should_flush_now(&self) -> bool {
        self.buf.len() >= self.threshold
    }

    /// Take everything aboard and reset the buffer to empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}
