//! Length-prefixed framing.
//!
//! ## Wire format
//!
//! ```text
//! +--------------+----------------+----------------------+
//! | offset bytes | length (w)     | frame body           |
//! +--------------+----------------+----------------------+
//! ```
//!
//! The length field is `w` bytes wide (1, 2, 3, 4 or 8) in the configured
//! byte order. Its value is the body length, optionally shifted by a length
//! adjustment and optionally counting the field itself. Encoding always
//! writes the field at offset 0; the offset only matters when decoding
//! frames produced by some other peer.
//!
//! For `decode(encode(p)) == p` the decoder adjustment must be the negation
//! of the encoder adjustment and the decoder must strip `offset + w` bytes.

use super::{Codec, Decoded};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// How lengths are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub byte_order: ByteOrder,
    /// Width of the length field in bytes.
    pub length_field_length: usize,
    /// Added to the payload length before it is written.
    pub length_adjustment: i64,
    /// Count the length field itself in the written value.
    pub length_includes_length_field: bool,
}

/// How lengths are read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub byte_order: ByteOrder,
    /// Bytes preceding the length field.
    pub length_field_offset: usize,
    /// Width of the length field in bytes.
    pub length_field_length: usize,
    /// Added to the field value to get the body length.
    pub length_adjustment: i64,
    /// The field value counts the field itself.
    pub length_includes_length_field: bool,
    /// Leading bytes removed from the returned frame.
    pub initial_bytes_to_strip: usize,
}

/// Length-field based frame codec.
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldCodec {
    encoder: EncoderConfig,
    decoder: DecoderConfig,
}

impl LengthFieldCodec {
    /// Create a codec, rejecting field widths other than 1, 2, 3, 4 or 8.
    pub fn new(encoder: EncoderConfig, decoder: DecoderConfig) -> Result<Self, CodecError> {
        check_width(encoder.length_field_length)?;
        check_width(decoder.length_field_length)?;
        Ok(Self { encoder, decoder })
    }

    /// Symmetric codec: `width`-byte length at offset 0, header stripped on decode.
    pub fn with_width(width: usize, byte_order: ByteOrder) -> Result<Self, CodecError> {
        Self::new(
            EncoderConfig {
                byte_order,
                length_field_length: width,
                length_adjustment: 0,
                length_includes_length_field: false,
            },
            DecoderConfig {
                byte_order,
                length_field_offset: 0,
                length_field_length: width,
                length_adjustment: 0,
                length_includes_length_field: false,
                initial_bytes_to_strip: width,
            },
        )
    }

    pub fn encoder_config(&self) -> &EncoderConfig {
        &self.encoder
    }

    pub fn decoder_config(&self) -> &DecoderConfig {
        &self.decoder
    }
}

fn check_width(width: usize) -> Result<(), CodecError> {
    match width {
        1 | 2 | 3 | 4 | 8 => Ok(()),
        other => Err(CodecError::UnsupportedWidth(other)),
    }
}

impl Codec for LengthFieldCodec {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let cfg = &self.encoder;
        let width = cfg.length_field_length;

        let mut length = payload.len() as i128 + cfg.length_adjustment as i128;
        if cfg.length_includes_length_field {
            length += width as i128;
        }
        if length < 0 {
            return Err(CodecError::NegativeLength);
        }

        let capacity: i128 = 1 << (8 * width);
        if length >= capacity {
            return Err(CodecError::ExceedsCapacity {
                width,
                length: u64::try_from(length).unwrap_or(u64::MAX),
            });
        }

        let mut out = BytesMut::with_capacity(width + payload.len());
        match cfg.byte_order {
            ByteOrder::Big => out.put_uint(length as u64, width),
            ByteOrder::Little => out.put_uint_le(length as u64, width),
        }
        out.put_slice(payload);
        Ok(out.freeze())
    }

    fn decode(&self, input: &[u8]) -> Result<Decoded, CodecError> {
        let cfg = &self.decoder;
        let width = cfg.length_field_length;
        let header_end = cfg.length_field_offset + width;
        if input.len() < header_end {
            return Ok(Decoded::Incomplete);
        }

        let mut field = &input[cfg.length_field_offset..header_end];
        let value = match cfg.byte_order {
            ByteOrder::Big => field.get_uint(width),
            ByteOrder::Little => field.get_uint_le(width),
        };

        let mut body_len = value as i128 + cfg.length_adjustment as i128;
        if cfg.length_includes_length_field {
            body_len -= width as i128;
        }
        if body_len < 0 {
            return Err(CodecError::NegativeLength);
        }

        let total = usize::try_from(header_end as i128 + body_len).map_err(|_| {
            CodecError::ExceedsCapacity {
                width,
                length: value,
            }
        })?;
        if input.len() < total {
            return Ok(Decoded::Incomplete);
        }
        if cfg.initial_bytes_to_strip > total {
            return Err(CodecError::StripExceedsFrame {
                strip: cfg.initial_bytes_to_strip,
                frame: total,
            });
        }

        Ok(Decoded::Frame {
            frame: Bytes::copy_from_slice(&input[cfg.initial_bytes_to_strip..total]),
            consumed: total,
        })
    }
}
