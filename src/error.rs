//! Error types for the engine and its frame codecs.
//!
//! Startup failures (`serve` rejecting a scheme, a bind that fails) are
//! reported synchronously before any event loop starts. Per-connection I/O
//! faults never surface here; they close the connection and reach the
//! handler through `on_closed`.

use std::io;
use thiserror::Error;

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The address scheme is not one of `tcp://`, `udp://` or `unix://`.
    #[error("unsupported network scheme: {0}")]
    UnsupportedNetwork(String),

    /// The address could not be parsed for the selected network.
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// A requested feature is not available on this platform.
    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(&'static str),

    /// Binding or listening on the configured address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The operation is not valid for this kind of connection.
    #[error("{0} is not supported on this connection")]
    Unsupported(&'static str),

    /// The owning event loop has already exited.
    #[error("event loop is closed")]
    LoopClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Framing errors.
///
/// Encode-time errors are returned to the caller so that an unrepresentable
/// frame is never written. An incomplete frame at decode time is not an
/// error; see [`crate::codec::Decoded::Incomplete`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Payload handed to a fixed-length codec has the wrong size.
    #[error("wrong fixed length: expected {expected} bytes, got {actual}")]
    InvalidFixedLength { expected: usize, actual: usize },

    /// Fixed-length codec configured with a zero frame length.
    #[error("fixed-length frames need a non-zero length")]
    ZeroFixedLength,

    /// Length value does not fit into the configured length field.
    #[error("length {length} exceeds the capacity of a {width}-byte length field")]
    ExceedsCapacity { width: usize, length: u64 },

    /// Length adjustment produced a negative frame length.
    #[error("adjusted frame length is negative")]
    NegativeLength,

    /// Length field width is not one of 1, 2, 3, 4 or 8.
    #[error("unsupported length field width: {0}")]
    UnsupportedWidth(usize),

    /// More header bytes would be stripped than the frame contains.
    #[error("cannot strip {strip} bytes from a {frame}-byte frame")]
    StripExceedsFrame { strip: usize, frame: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
