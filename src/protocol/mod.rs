//! Protocol module - message catalog, frame type, and framing.
//!
//! Implements the binary protocol for the wire:
//! - catalog of message-type codes and canonical names
//! - 4-byte big-endian length-prefixed frame encoding
//! - frame buffer for accumulating partial reads

pub mod catalog;
mod frame;
mod frame_buffer;

pub use frame::{encode_request, Frame, DEFAULT_MAX_PAYLOAD_SIZE, LENGTH_PREFIX_SIZE};
pub use frame_buffer::FrameBuffer;
