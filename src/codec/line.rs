//! Delimiter-terminated framing.

use super::{Codec, Decoded};
use crate::error::CodecError;
use bytes::{BufMut, Bytes, BytesMut};

/// Frames terminated by a single delimiter byte.
///
/// The delimiter is stripped on decode and appended on encode.
#[derive(Debug, Clone, Copy)]
pub struct DelimiterCodec {
    delimiter: u8,
    strip_cr: bool,
}

impl DelimiterCodec {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            strip_cr: false,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl Codec for DelimiterCodec {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::with_capacity(payload.len() + 1);
        out.put_slice(payload);
        out.put_u8(self.delimiter);
        Ok(out.freeze())
    }

    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError> {
        let Some(pos) = input.iter().position(|&b| b == self.delimiter) else {
            return Ok(Decoded::Incomplete);
        };

        let mut end = pos;
        if self.strip_cr && end > 0 && input[end - 1] == b'\r' {
            end -= 1;
        }

        Ok(Decoded::Frame {
            frame: Bytes::copy_from_slice(&input[..end]),
            consumed: pos + 1,
        })
    }
}

/// Line framing: `\n`-terminated, with an optional `\r` before it.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec(DelimiterCodec);

impl LineCodec {
    pub fn new() -> Self {
        Self(DelimiterCodec {
            delimiter: b'\n',
            strip_cr: true,
        })
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for LineCodec {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        self.0.encode(payload)
    }

    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError> {
        self.0.decode(input)
    }
}
