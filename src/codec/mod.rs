//! Frame codecs.
//!
//! A codec is a stateless framing strategy. `decode` looks at the bytes a
//! connection has buffered so far and either extracts one frame (reporting
//! how many bytes it consumed) or reports that more data is needed, in which
//! case nothing is consumed. The event loop calls `decode` repeatedly until
//! it reports [`Decoded::Incomplete`].
//!
//! ## Available codecs
//! - [`RawCodec`]: every buffered byte is one frame (default)
//! - [`LineCodec`]: `\n`-terminated lines, trailing `\r` stripped
//! - [`DelimiterCodec`]: frames terminated by a configurable byte
//! - [`FixedLengthCodec`]: frames of exactly N bytes
//! - [`LengthFieldCodec`]: length-prefixed frames

mod fixed;
mod length_field;
mod line;

pub use fixed::FixedLengthCodec;
pub use length_field::{ByteOrder, DecoderConfig, EncoderConfig, LengthFieldCodec};
pub use line::{DelimiterCodec, LineCodec};

use crate::error::CodecError;
use bytes::Bytes;
use std::fmt;

/// Outcome of a single decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame, plus the number of input bytes it occupied.
    Frame { frame: Bytes, consumed: usize },
    /// The input does not hold a complete frame yet. Nothing was consumed.
    Incomplete,
}

/// Byte-level framing strategy shared by every connection of a server.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Wrap a payload for the wire.
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError>;

    /// Try to extract one frame from the front of `input`.
    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError>;
}

/// Pass-through codec: no framing at all.
///
/// Whatever has been read is handed to the handler as one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError> {
        if input.is_empty() {
            return Ok(Decoded::Incomplete);
        }
        Ok(Decoded::Frame {
            frame: Bytes::copy_from_slice(input),
            consumed: input.len(),
        })
    }
}
