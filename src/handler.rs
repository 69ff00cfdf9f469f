//! Application callbacks.

use crate::runtime::Conn;
use crate::server::Server;
use std::io;
use std::time::Duration;

/// What the engine should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    /// Close the connection the callback ran for.
    Close,
    /// Stop the whole server.
    Shutdown,
}

/// Callbacks invoked by the engine.
///
/// Every method has a no-op default, so implementors override only what
/// they need. Connection callbacks run on the event loop thread that owns
/// the connection and must not block; `on_init_complete`, `on_shutdown` and
/// `tick` run on other threads, hence `Send + Sync`.
///
/// A panic inside `on_opened` or `react` closes that connection; a panic
/// inside `tick` shuts the server down.
pub trait EventHandler: Send + Sync + 'static {
    /// Listeners are bound and loops are about to start.
    fn on_init_complete(&self, _server: &Server) -> Action {
        Action::None
    }

    /// Every loop has exited.
    fn on_shutdown(&self, _server: &Server) {}

    /// A stream connection was accepted. Returned bytes are written as-is,
    /// without going through the codec.
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// A stream connection was closed; `err` is the reason, if any.
    fn on_closed(&self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// Called right before encoded reply bytes are written.
    fn pre_write(&self) {}

    /// A frame was decoded, a datagram arrived (`frame` holds it raw), or a
    /// wake-up was requested (`frame` is `None`). Returned bytes are encoded
    /// with the server codec for streams and sent raw for datagrams.
    fn react(&self, _frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Periodic timer, when the ticker is enabled. Returns the delay before
    /// the next tick.
    fn tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
