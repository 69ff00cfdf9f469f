//! Event loop: one thread, one poller, the connections it owns.
//!
//! Readiness is edge-triggered, so every event is followed through until
//! the socket would block or a per-event budget runs out. A connection that
//! exhausted its budget goes on the backlog and the next poll does not
//! block, which keeps one busy peer from starving the others.
//!
//! ## Backpressure
//!
//! While a connection has unsent outbound bytes the loop stops reading from
//! it and waits for writability. Once the backlog drains, reading resumes.

use crate::codec::{Codec, Decoded};
use crate::handler::{Action, EventHandler};
use crate::options::Options;
use crate::runtime::balancer::LoopLoad;
use crate::runtime::connection::{Conn, ConnectionRegistry, Transport};
use crate::runtime::listener::{Listener, SockAddr, Stream};
use crate::runtime::poller::{Notifier, Poller, Ready};
use crate::server::ServerShared;
use bytes::Bytes;
use mio::{Interest, Token};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Largest UDP payload.
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Datagrams handled per readiness event before yielding.
const DATAGRAM_BUDGET: usize = 64;

/// Work queued on a loop from another thread.
pub(crate) enum Task {
    /// A connection accepted elsewhere, to be owned by this loop.
    Register { stream: Stream, remote: SockAddr },
    /// Already-encoded bytes for a connection.
    Write { token: Token, id: u64, data: Bytes },
    /// Call `react` with no frame.
    Wake { token: Token, id: u64 },
    Close { token: Token, id: u64 },
    /// Exit at the next iteration.
    Shutdown,
}

/// The part of a loop other threads may see.
pub(crate) struct LoopShared {
    pub index: usize,
    pub notifier: Arc<Notifier<Task>>,
    connections: AtomicUsize,
}

impl LoopShared {
    pub fn new(index: usize, notifier: Arc<Notifier<Task>>) -> Self {
        Self {
            index,
            notifier,
            connections: AtomicUsize::new(0),
        }
    }

    /// Count a connection that is on its way to this loop or opened here.
    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Queue a shutdown for this loop; a closed loop needs none.
    pub fn request_shutdown(&self) {
        let _ = self.notifier.trigger(Task::Shutdown);
    }

    /// Account for tasks that will never run.
    pub fn discard(&self, task: Task) {
        if let Task::Register { .. } = task {
            self.remove_connection();
        }
    }
}

impl LoopLoad for LoopShared {
    fn load(&self) -> usize {
        self.connection_count()
    }
}

/// Run a handler callback, turning a panic into `None`.
pub(crate) fn guarded<R>(callback: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(callback, panic = %panic_message(&*payload), "Event handler panicked");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn callback_panicked(callback: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{callback} panicked"))
}

/// Update the registered interest of a stream connection.
fn set_interest(poller: &Poller<Task>, conn: &mut Conn, writable: bool) -> io::Result<()> {
    let token = conn.token();
    if let Transport::Stream(stream) = &mut conn.transport {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        poller.modify(stream, token, interest)?;
    }
    conn.write_armed = writable;
    Ok(())
}

pub(crate) struct EventLoop {
    index: usize,
    poller: Poller<Task>,
    listener: Option<Listener>,
    connections: ConnectionRegistry,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn Codec>,
    shared: Arc<LoopShared>,
    server: Arc<ServerShared>,
    read_buffer_cap: usize,
    max_outbound_buffer: usize,
    tcp_keep_alive: Option<Duration>,
    next_conn_id: u64,
    ready: Vec<(Token, Ready)>,
    backlog: Vec<Token>,
    datagram_buf: Box<[u8]>,
}

impl EventLoop {
    /// Build a loop around `poller`. If `listener` is given, this loop
    /// accepts (or receives) on it directly.
    pub fn new(
        poller: Poller<Task>,
        mut listener: Option<Listener>,
        handler: Arc<dyn EventHandler>,
        shared: Arc<LoopShared>,
        server: Arc<ServerShared>,
        options: &Options,
    ) -> io::Result<Self> {
        if let Some(listener) = listener.as_mut() {
            poller.register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;
        }
        let datagram_buf = match listener {
            Some(Listener::Udp(_)) => vec![0u8; DATAGRAM_BUFFER_SIZE].into_boxed_slice(),
            _ => Box::default(),
        };

        Ok(Self {
            index: shared.index,
            poller,
            listener,
            connections: ConnectionRegistry::new(options.max_connections),
            handler,
            codec: Arc::clone(&options.codec),
            shared,
            server,
            read_buffer_cap: options.read_buffer_cap.max(1),
            max_outbound_buffer: options.max_outbound_buffer,
            tcp_keep_alive: options.tcp_keep_alive,
            next_conn_id: 1,
            ready: Vec::with_capacity(options.events_capacity),
            backlog: Vec::new(),
            datagram_buf,
        })
    }

    /// Serve until the server shuts down, then close every connection.
    pub fn run(mut self) -> io::Result<()> {
        debug!(loop_id = self.index, "Event loop started");
        let result = self.run_until_shutdown();
        if let Err(ref e) = result {
            error!(loop_id = self.index, error = %e, "Event loop failed");
        }

        self.close_all();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poller.deregister(listener.source());
        }
        for task in self.shared.notifier.close() {
            self.shared.discard(task);
        }
        debug!(loop_id = self.index, "Event loop exited");
        result
    }

    fn run_until_shutdown(&mut self) -> io::Result<()> {
        while !self.server.is_shutting_down() {
            let timeout = if self.backlog.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            let mut ready = std::mem::take(&mut self.ready);
            self.poller
                .poll(timeout, |token, r| ready.push((token, r)))?;
            for (token, r) in ready.drain(..) {
                self.handle_event(token, r);
            }
            self.ready = ready;

            self.run_tasks();
            self.run_backlog();
        }
        Ok(())
    }

    fn handle_event(&mut self, token: Token, ready: Ready) {
        if token == LISTENER_TOKEN {
            self.on_listener_ready();
            return;
        }
        let Some(conn) = self.connections.get(token) else {
            return;
        };

        if ready.error {
            let err = conn
                .take_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            self.close_connection(token, Some(err));
            return;
        }

        if !conn.outbound.is_empty() {
            if ready.writable {
                self.handle_writable(token);
            }
        } else if ready.readable {
            self.handle_readable(token);
        }

        if ready.hangup && !ready.readable {
            self.close_connection(token, None);
        }
    }

    fn run_tasks(&mut self) {
        for task in self.poller.drain_tasks() {
            match task {
                Task::Register { stream, remote } => {
                    if self.server.is_shutting_down() {
                        self.shared.remove_connection();
                    } else {
                        self.register(stream, remote);
                    }
                }
                Task::Write { token, id, data } => {
                    if self.is_live(token, id) {
                        self.write(token, &data);
                    }
                }
                Task::Wake { token, id } => {
                    if self.is_live(token, id) {
                        self.react(token, None);
                    }
                }
                Task::Close { token, id } => {
                    if self.is_live(token, id) {
                        self.close_connection(token, None);
                    }
                }
                Task::Shutdown => {}
            }
        }
    }

    fn run_backlog(&mut self) {
        for token in std::mem::take(&mut self.backlog) {
            if token == LISTENER_TOKEN {
                self.on_listener_ready();
            } else if self
                .connections
                .get(token)
                .is_some_and(|c| c.outbound.is_empty())
            {
                self.handle_readable(token);
            }
        }
    }

    fn is_live(&mut self, token: Token, id: u64) -> bool {
        self.connections
            .get_live(token, id)
            .is_some_and(|c| c.opened)
    }

    fn on_listener_ready(&mut self) {
        match self.listener {
            Some(Listener::Udp(_)) => self.receive_datagrams(),
            Some(_) => self.accept_connections(),
            None => {}
        }
    }

    fn accept_connections(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, remote)) => {
                    self.shared.add_connection();
                    self.register(stream, remote);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(loop_id = self.index, error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    /// Take ownership of an accepted stream. The caller has already counted
    /// it against this loop.
    fn register(&mut self, stream: Stream, remote: SockAddr) {
        if let Some(period) = self.tcp_keep_alive {
            if let Err(e) = stream.set_keepalive(period) {
                debug!(loop_id = self.index, error = %e, "Failed to enable keep-alive");
            }
        }
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(loop_id = self.index, error = %e, "Dropping connection without local address");
                self.shared.remove_connection();
                return;
            }
        };

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let index = self.index;
        let codec = Arc::clone(&self.codec);
        let notifier = Arc::clone(&self.shared.notifier);
        let inserted = self.connections.insert_with(|token| {
            Conn::stream(id, token, index, stream, local, remote, codec, notifier)
        });
        let Some(token) = inserted else {
            warn!(loop_id = self.index, "Connection limit reached");
            self.shared.remove_connection();
            return;
        };

        let registered = match self.connections.get_mut(token).map(|c| &mut c.transport) {
            Some(Transport::Stream(stream)) => {
                self.poller.register(stream, token, Interest::READABLE)
            }
            _ => Ok(()),
        };
        if let Err(e) = registered {
            warn!(loop_id = self.index, error = %e, "Failed to register connection");
            self.connections.remove(token);
            self.shared.remove_connection();
            return;
        }

        self.open(token);
    }

    fn open(&mut self, token: Token) {
        let handler = Arc::clone(&self.handler);
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        conn.opened = true;
        debug!(
            loop_id = self.index,
            conn_id = conn.id(),
            remote = %conn.remote_addr(),
            "Connection opened"
        );

        let Some((out, action)) = guarded("on_opened", || handler.on_opened(conn)) else {
            self.close_connection(token, Some(callback_panicked("on_opened")));
            return;
        };
        // Greeting bytes bypass the codec.
        if let Some(out) = out {
            if !self.write(token, &out) {
                return;
            }
        }
        self.apply(token, action);
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };

        let mut budget = self.read_buffer_cap;
        let mut received = 0;
        let mut outcome = Ok(false);
        loop {
            match conn.fill(budget) {
                Ok(0) => {
                    outcome = Ok(true);
                    break;
                }
                Ok(n) => {
                    received += n;
                    budget -= n.min(budget);
                    if budget == 0 {
                        self.backlog.push(token);
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if received > 0 {
            self.process_inbound(token);
        }
        match outcome {
            Ok(false) => {}
            Ok(true) => self.close_connection(token, None),
            Err(e) => self.close_connection(token, Some(e)),
        }
    }

    /// Decode and dispatch every complete frame in the inbound buffer.
    fn process_inbound(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(token) else {
                return;
            };
            if !conn.opened || conn.inbound.is_empty() {
                return;
            }

            match self.codec.decode(conn.inbound.make_contiguous()) {
                Ok(Decoded::Incomplete) => return,
                Ok(Decoded::Frame { frame, consumed }) => {
                    conn.inbound.shift(consumed);
                    if !self.react(token, Some(&frame[..])) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(loop_id = self.index, conn_id = conn.id(), error = %e, "Undecodable input");
                    self.close_connection(token, Some(io::Error::new(io::ErrorKind::InvalidData, e)));
                    return;
                }
            }
        }
    }

    /// Hand `frame` to the handler. Returns whether the connection is still
    /// open for further frames.
    fn react(&mut self, token: Token, frame: Option<&[u8]>) -> bool {
        let handler = Arc::clone(&self.handler);
        let Some(conn) = self.connections.get_mut(token) else {
            return false;
        };

        let Some((out, action)) = guarded("react", || handler.react(frame, conn)) else {
            self.close_connection(token, Some(callback_panicked("react")));
            return false;
        };
        if let Some(out) = out {
            match self.codec.encode(&out) {
                Ok(encoded) => {
                    guarded("pre_write", || handler.pre_write());
                    if !self.write(token, &encoded) {
                        return false;
                    }
                }
                Err(e) => {
                    warn!(loop_id = self.index, error = %e, "Dropping reply that cannot be encoded");
                }
            }
        }
        self.apply(token, action)
    }

    /// Write to a connection, closing it on failure. Returns whether the
    /// connection is still open.
    fn write(&mut self, token: Token, data: &[u8]) -> bool {
        let max_outbound = self.max_outbound_buffer;
        let Some(conn) = self.connections.get_mut(token) else {
            return false;
        };
        if let Err(e) = conn.write(data, max_outbound) {
            self.close_connection(token, Some(e));
            return false;
        }
        if !conn.outbound.is_empty() && !conn.write_armed {
            if let Err(e) = set_interest(&self.poller, conn, true) {
                self.close_connection(token, Some(e));
                return false;
            }
        }
        true
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        if let Err(e) = conn.flush() {
            self.close_connection(token, Some(e));
            return;
        }
        if conn.outbound.is_empty() {
            if let Err(e) = set_interest(&self.poller, conn, false) {
                self.close_connection(token, Some(e));
                return;
            }
            // Input that arrived while paused has no edge of its own.
            self.backlog.push(token);
        }
    }

    /// Carry out a callback's action. Returns whether the connection is
    /// still open.
    fn apply(&mut self, token: Token, action: Action) -> bool {
        match action {
            Action::None => self.connections.get(token).is_some_and(|c| c.opened),
            Action::Close => {
                self.close_connection(token, None);
                false
            }
            Action::Shutdown => {
                self.server.signal_shutdown();
                false
            }
        }
    }

    fn close_connection(&mut self, token: Token, err: Option<io::Error>) {
        let Some(mut conn) = self.connections.remove(token) else {
            return;
        };
        // One last attempt at whatever is still queued.
        if !conn.outbound.is_empty() {
            if let Err(e) = conn.flush() {
                debug!(loop_id = self.index, conn_id = conn.id(), error = %e, "Final flush failed");
            }
        }
        if let Transport::Stream(stream) = &mut conn.transport {
            let _ = self.poller.deregister(stream);
        }
        conn.opened = false;
        self.shared.remove_connection();

        match &err {
            Some(e) => debug!(loop_id = self.index, conn_id = conn.id(), error = %e, "Connection closed"),
            None => debug!(loop_id = self.index, conn_id = conn.id(), "Connection closed"),
        }

        let handler = Arc::clone(&self.handler);
        let action = guarded("on_closed", || handler.on_closed(&mut conn, err.as_ref()));
        if action == Some(Action::Shutdown) {
            self.server.signal_shutdown();
        }
    }

    fn close_all(&mut self) {
        for token in self.connections.tokens() {
            let err = io::Error::new(io::ErrorKind::Other, "server is shutting down");
            self.close_connection(token, Some(err));
        }
    }

    fn receive_datagrams(&mut self) {
        for _ in 0..DATAGRAM_BUDGET {
            let received = match &self.listener {
                Some(Listener::Udp(dgram)) => dgram.socket.recv_from(&mut self.datagram_buf),
                _ => return,
            };
            match received {
                Ok((n, peer)) => {
                    self.react_datagram(n, SockAddr::Inet(peer));
                    if self.server.is_shutting_down() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(loop_id = self.index, error = %e, "Datagram receive failed");
                    return;
                }
            }
        }
        self.backlog.push(LISTENER_TOKEN);
    }

    /// Give one datagram to `react` on a throwaway connection and send back
    /// whatever it returns, unframed.
    fn react_datagram(&mut self, len: usize, peer: SockAddr) {
        let Some(Listener::Udp(dgram)) = &self.listener else {
            return;
        };
        let local = match dgram.socket.local_addr() {
            Ok(addr) => SockAddr::Inet(addr),
            Err(_) => SockAddr::Unix(None),
        };
        let mut conn = Conn::datagram(
            self.index,
            Arc::clone(&dgram.sender),
            local,
            peer,
            Arc::clone(&self.codec),
        );

        let handler = Arc::clone(&self.handler);
        let frame = &self.datagram_buf[..len];
        let Some((out, action)) = guarded("react", || handler.react(Some(frame), &mut conn)) else {
            return;
        };
        if let Some(out) = out {
            guarded("pre_write", || handler.pre_write());
            if let Err(e) = conn.send_to(&out) {
                debug!(loop_id = self.index, peer = %conn.remote_addr(), error = %e, "Datagram reply failed");
            }
        }
        if action == Action::Shutdown {
            self.server.signal_shutdown();
        }
    }
}
