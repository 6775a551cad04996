//! Frame buffer for reassembling partial reads.
//!
//! TCP delivers an arbitrary byte stream: one read may carry several
//! back-to-back frames, a fraction of one frame, or the tail of one frame
//! plus the head of the next. The buffer accumulates input in a
//! `bytes::BytesMut` and runs a two-state machine:
//! - `AwaitingLength`: need the 4-byte big-endian length prefix
//! - `AwaitingBody`: prefix parsed, need `length` more bytes (type byte
//!   plus payload)
//!
//! Consumed bytes are never re-parsed and input bytes are never dropped.

use bytes::{Buf, BytesMut};

use super::frame::{Frame, DEFAULT_MAX_PAYLOAD_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete 4-byte length prefix.
    AwaitingLength,
    /// Prefix consumed; `remaining` counts the type byte plus payload.
    AwaitingBody { remaining: usize },
}

/// Accumulates inbound bytes and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a frame buffer with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::AwaitingLength,
            max_payload_size,
        }
    }

    /// Push a chunk of inbound bytes and extract all complete frames.
    ///
    /// Partial frame state carries over to the next push. The returned
    /// frames are in wire order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a corrupt length prefix (zero, or a
    /// payload above the configured maximum). The connection is unusable
    /// after that: there is no way to resynchronize with the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes still required to complete the in-progress frame, if any.
    pub fn bytes_awaited(&self) -> usize {
        match self.state {
            State::AwaitingLength => 0,
            State::AwaitingBody { remaining } => remaining.saturating_sub(self.buffer.len()),
        }
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::AwaitingLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let length = self.buffer.get_u32() as usize;

                // The length field counts the type byte, so zero means the
                // stream is corrupt; likewise anything over the limit.
                if length == 0 {
                    return Err(Error::Protocol("Frame length prefix is zero".to_string()));
                }
                if length - 1 > self.max_payload_size as usize {
                    return Err(Error::Protocol(format!(
                        "Payload size {} exceeds maximum {}",
                        length - 1,
                        self.max_payload_size
                    )));
                }

                self.state = State::AwaitingBody { remaining: length };
                self.try_extract_one()
            }

            State::AwaitingBody { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let mut body = self.buffer.split_to(remaining);
                let code = body.get_u8();
                self.state = State::AwaitingLength;

                Ok(Some(Frame::new(code, body.freeze())))
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
