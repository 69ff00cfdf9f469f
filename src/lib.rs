//! loopnet: a multi-reactor, non-blocking network engine.
//!
//! An application implements [`EventHandler`] and calls [`serve`] with an
//! address such as `tcp://127.0.0.1:9000`, `udp://0.0.0.0:5353` or
//! `unix:///tmp/app.sock`. The engine runs one or more event loops, each on
//! its own thread, frames inbound bytes with a [`Codec`] and calls the
//! handler for every decoded frame.
//!
//! ```no_run
//! use loopnet::{serve, Action, Conn, EventHandler, LineCodec, Options};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
//!         (frame.map(<[u8]>::to_vec), Action::None)
//!     }
//! }
//!
//! let options = Options::default().with_multicore(true).with_codec(LineCodec::default());
//! serve(Echo, "tcp://127.0.0.1:9000", options).unwrap();
//! ```

pub mod codec;
pub mod config;
mod error;
mod handler;
mod options;
mod runtime;
mod server;

pub use codec::{
    ByteOrder, Codec, Decoded, DecoderConfig, DelimiterCodec, EncoderConfig, FixedLengthCodec,
    LengthFieldCodec, LineCodec, RawCodec,
};
pub use error::{CodecError, Error, Result};
pub use handler::{Action, EventHandler};
pub use options::{parse_address, LoadBalancing, Network, Options};
pub use runtime::{Conn, ConnHandle, RingBuffer, SockAddr};
pub use server::{serve, Server, ServerState};
