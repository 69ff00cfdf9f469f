//! Per-connection state owned by an event loop.
//!
//! A `Conn` is only ever touched by the thread of the loop that owns it.
//! Other threads reach it through a [`ConnHandle`], which queues work on that
//! loop instead of touching the connection directly.

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::runtime::buffer::RingBuffer;
use crate::runtime::event_loop::Task;
use crate::runtime::listener::{SockAddr, Stream};
use crate::runtime::poller::Notifier;
use mio::Token;
use slab::Slab;
use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Underlying socket of a connection.
pub(crate) enum Transport {
    Stream(Stream),
    /// Reply path for a single datagram.
    Datagram(Arc<std::net::UdpSocket>),
}

/// A client connection as seen by the event handler.
pub struct Conn {
    id: u64,
    token: Token,
    loop_index: usize,
    pub(crate) transport: Transport,
    local_addr: SockAddr,
    remote_addr: SockAddr,
    pub(crate) opened: bool,
    /// WRITABLE interest is registered.
    pub(crate) write_armed: bool,
    context: Option<Box<dyn Any + Send>>,
    codec: Arc<dyn Codec>,
    pub(crate) inbound: RingBuffer,
    pub(crate) outbound: RingBuffer,
    notifier: Option<Arc<Notifier<Task>>>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("loop", &self.loop_index)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("opened", &self.opened)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stream(
        id: u64,
        token: Token,
        loop_index: usize,
        stream: Stream,
        local_addr: SockAddr,
        remote_addr: SockAddr,
        codec: Arc<dyn Codec>,
        notifier: Arc<Notifier<Task>>,
    ) -> Self {
        Self {
            id,
            token,
            loop_index,
            transport: Transport::Stream(stream),
            local_addr,
            remote_addr,
            opened: false,
            write_armed: false,
            context: None,
            codec,
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            notifier: Some(notifier),
        }
    }

    /// Ephemeral connection wrapping one received datagram.
    pub(crate) fn datagram(
        loop_index: usize,
        socket: Arc<std::net::UdpSocket>,
        local_addr: SockAddr,
        remote_addr: SockAddr,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            id: 0,
            token: Token(usize::MAX),
            loop_index,
            transport: Transport::Datagram(socket),
            local_addr,
            remote_addr,
            opened: true,
            write_armed: false,
            context: None,
            codec,
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            notifier: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// Index of the event loop that owns this connection.
    pub fn loop_index(&self) -> usize {
        self.loop_index
    }

    pub fn local_addr(&self) -> &SockAddr {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &SockAddr {
        &self.remote_addr
    }

    /// Whether this connection wraps a single datagram.
    pub fn is_datagram(&self) -> bool {
        matches!(self.transport, Transport::Datagram(_))
    }

    // ---- user context ----

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref()
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut()
    }

    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.context = Some(Box::new(ctx));
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.context.take()
    }

    // ---- inbound buffer ----

    /// Every unconsumed inbound byte. Reading does not consume.
    pub fn read(&mut self) -> &[u8] {
        self.inbound.make_contiguous()
    }

    /// The first `n` unconsumed bytes; all of them when `n` is 0 or larger
    /// than what is buffered.
    pub fn read_n(&mut self, n: usize) -> &[u8] {
        let buffered = self.inbound.make_contiguous();
        if n == 0 || n > buffered.len() {
            buffered
        } else {
            &buffered[..n]
        }
    }

    /// Consume `n` inbound bytes and return how many were consumed. A zero
    /// or oversized `n` discards everything.
    pub fn shift_n(&mut self, n: usize) -> usize {
        let len = self.inbound.len();
        if n == 0 || n >= len {
            self.inbound.reset();
            return len;
        }
        self.inbound.shift(n)
    }

    pub fn buffer_len(&self) -> usize {
        self.inbound.len()
    }

    /// Discard all unconsumed inbound bytes.
    pub fn reset_buffer(&mut self) {
        self.inbound.reset();
    }

    // ---- outbound ----

    /// Encode `data` with the server codec and queue it on the owning loop.
    ///
    /// Safe to call from any thread via [`Conn::handle`]; this form is for
    /// callers already holding the connection.
    pub fn async_write(&self, data: &[u8]) -> Result<()> {
        self.handle()
            .ok_or(Error::Unsupported("async_write"))?
            .async_write(data)
    }

    /// Send `data` to the datagram peer right away, without framing.
    pub fn send_to(&self, data: &[u8]) -> Result<usize> {
        match (&self.transport, self.remote_addr.as_inet()) {
            (Transport::Datagram(socket), Some(peer)) => Ok(socket.send_to(data, peer)?),
            _ => Err(Error::Unsupported("send_to")),
        }
    }

    /// Ask the owning loop to call `react` with no frame.
    pub fn wake(&self) -> Result<()> {
        self.handle().ok_or(Error::Unsupported("wake"))?.wake()
    }

    /// Ask the owning loop to close this connection.
    pub fn close(&self) -> Result<()> {
        self.handle().ok_or(Error::Unsupported("close"))?.close()
    }

    /// Thread-safe handle for writing to, waking or closing this connection
    /// later. `None` for datagram connections, which do not outlive the
    /// callback.
    pub fn handle(&self) -> Option<ConnHandle> {
        let notifier = self.notifier.as_ref()?;
        Some(ConnHandle {
            id: self.id,
            token: self.token,
            codec: Arc::clone(&self.codec),
            notifier: Arc::clone(notifier),
        })
    }

    // ---- loop-side I/O ----

    /// Write `data` to the socket, buffering whatever it does not take.
    ///
    /// Data goes behind anything already buffered so ordering holds. Fails
    /// if buffering would push the outbound backlog past `max_outbound`
    /// (0 means no limit).
    pub(crate) fn write(&mut self, data: &[u8], max_outbound: usize) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Transport::Stream(stream) = &mut self.transport else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream write on a datagram connection",
            ));
        };

        let mut written = 0;
        if self.outbound.is_empty() {
            while written < data.len() {
                match stream.write(&data[written..]) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let rest = &data[written..];
        if rest.is_empty() {
            return Ok(());
        }
        if max_outbound > 0 && self.outbound.len() + rest.len() > max_outbound {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "outbound buffer limit exceeded",
            ));
        }
        self.outbound.write(rest);
        Ok(())
    }

    /// Push buffered outbound bytes until the socket would block.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Stream(stream) => self.outbound.write_to(stream),
            Transport::Datagram(_) => Ok(0),
        }
    }

    /// One bounded read from the socket into the inbound buffer.
    pub(crate) fn fill(&mut self, max: usize) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Stream(stream) => self.inbound.read_from(stream, max),
            Transport::Datagram(_) => Ok(0),
        }
    }

    pub(crate) fn take_error(&self) -> Option<io::Error> {
        match &self.transport {
            Transport::Stream(stream) => match stream.take_error() {
                Ok(err) => err,
                Err(e) => Some(e),
            },
            Transport::Datagram(_) => None,
        }
    }
}

/// Cross-thread handle to a stream connection.
///
/// Every operation is queued on the owning loop. If the connection has
/// closed by the time the loop runs it, the operation is dropped.
#[derive(Clone)]
pub struct ConnHandle {
    id: u64,
    token: Token,
    codec: Arc<dyn Codec>,
    notifier: Arc<Notifier<Task>>,
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

impl ConnHandle {
    /// Encode on the calling thread, then hand the bytes to the loop.
    pub fn async_write(&self, data: &[u8]) -> Result<()> {
        let data = self.codec.encode(data)?;
        self.notifier.trigger(Task::Write {
            token: self.token,
            id: self.id,
            data,
        })
    }

    pub fn wake(&self) -> Result<()> {
        self.notifier.trigger(Task::Wake {
            token: self.token,
            id: self.id,
        })
    }

    pub fn close(&self) -> Result<()> {
        self.notifier.trigger(Task::Close {
            token: self.token,
            id: self.id,
        })
    }
}

/// Registry of active connections using slab allocation.
///
/// The slab key doubles as the poll token.
pub(crate) struct ConnectionRegistry {
    connections: Slab<Conn>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert the connection built by `make` for the next free token.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with<F>(&mut self, make: F) -> Option<Token>
    where
        F: FnOnce(Token) -> Conn,
    {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        entry.insert(make(token));
        Some(token)
    }

    pub fn get(&self, token: Token) -> Option<&Conn> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Conn> {
        self.connections.get_mut(token.0)
    }

    /// Look up a connection, ignoring a slot reused since `id` was issued.
    pub fn get_live(&mut self, token: Token, id: u64) -> Option<&mut Conn> {
        self.connections.get_mut(token.0).filter(|c| c.id == id)
    }

    pub fn remove(&mut self, token: Token) -> Option<Conn> {
        self.connections.try_remove(token.0)
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.connections.iter().map(|(key, _)| Token(key)).collect()
    }
}
