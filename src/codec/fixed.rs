//! Fixed-length framing.

use super::{Codec, Decoded};
use crate::error::CodecError;
use bytes::Bytes;

/// Every frame is exactly `frame_len` bytes; no header on the wire.
#[derive(Debug, Clone, Copy)]
pub struct FixedLengthCodec {
    frame_len: usize,
}

impl FixedLengthCodec {
    /// Create a codec for `frame_len`-byte frames. A zero length would
    /// never produce a frame, so it is rejected.
    pub fn new(frame_len: usize) -> Result<Self, CodecError> {
        if frame_len == 0 {
            return Err(CodecError::ZeroFixedLength);
        }
        Ok(Self { frame_len })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl Codec for FixedLengthCodec {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() != self.frame_len {
            return Err(CodecError::InvalidFixedLength {
                expected: self.frame_len,
                actual: payload.len(),
            });
        }
        Ok(Bytes::copy_from_slice(payload))
    }

    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError> {
        if input.len() < self.frame_len {
            return Ok(Decoded::Incomplete);
        }
        Ok(Decoded::Frame {
            frame: Bytes::copy_from_slice(&input[..self.frame_len]),
            consumed: self.frame_len,
        })
    }
}
