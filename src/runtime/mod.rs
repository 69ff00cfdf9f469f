//! Reactor runtime.
//!
//! Readiness-based model: a poller tells a loop which sockets are ready,
//! then the loop performs non-blocking reads and writes on them. Uses
//! epoll on Linux and kqueue on BSD/macOS, both through mio.
//!
//! - `RingBuffer`: per-connection inbound/outbound bytes
//! - `Poller`: readiness plus a cross-thread task queue
//! - `Conn`: connection state seen by the handler
//! - `EventLoop`: one thread driving a set of connections
//! - `Acceptor`: shared-listener accept thread with a load balancer

mod acceptor;
mod balancer;
mod buffer;
mod connection;
mod event_loop;
mod listener;
mod poller;

pub use buffer::RingBuffer;
pub use connection::{Conn, ConnHandle};
pub use listener::SockAddr;

pub(crate) use acceptor::Acceptor;
pub(crate) use event_loop::{guarded, EventLoop, LoopShared, Task};
pub(crate) use listener::{reuse_port_supported, Listener};
pub(crate) use poller::{Notifier, Poller};
