//! Frame type and wire encoding.
//!
//! One protocol unit on the wire:
//!
//! ```text
//! ┌───────────┬───────────┬─────────────┐
//! │ Length    │ Type code │ Payload     │
//! │ 4 bytes   │ 1 byte    │ N bytes     │
//! │ uint32 BE │           │             │
//! └───────────┴───────────┴─────────────┘
//! ```
//!
//! The length field counts the type byte plus the payload,
//! so `length = 1 + payload.len()` and the minimum valid length is 1.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// One decoded protocol frame: type code plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message-type code (see [`crate::protocol::catalog`]).
    pub code: u8,
    /// Payload bytes (may be empty).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(code: u8, payload: Bytes) -> Self {
        Self { code, payload }
    }
}

/// Encode a request frame ready for transmission.
///
/// # Example
///
/// ```
/// use kvpbc::protocol::encode_request;
///
/// let bytes = encode_request(1, &[]);
/// assert_eq!(&bytes[..], &[0, 0, 0, 1, 1]);
/// ```
pub fn encode_request(code: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + 1 + payload.len());
    buf.put_u32(payload.len() as u32 + 1);
    buf.put_u8(code);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_layout() {
        let bytes = encode_request(9, b"abc");

        // Length = 1 (type byte) + 3 (payload), big endian.
        assert_eq!(&bytes[..4], &[0, 0, 0, 4]);
        assert_eq!(bytes[4], 9);
        assert_eq!(&bytes[5..], b"abc");
    }

    #[test]
    fn test_encode_request_empty_payload() {
        let bytes = encode_request(1, &[]);
        assert_eq!(bytes.len(), 5);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(bytes[4], 1);
    }
}
