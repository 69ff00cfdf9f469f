//! Server lifecycle: bind, start the loops, wait for shutdown.
//!
//! `serve` binds every listener up front, so address and bind errors are
//! returned before any thread starts. After that it blocks until the server
//! shuts down, either from a handler `Action::Shutdown`, a panicking tick,
//! a failed loop, or [`Server::shutdown`] called from any thread.
//!
//! ## Listener placement
//!
//! - UDP: every loop receives on the socket (a clone, or its own
//!   reuse-port socket).
//! - TCP with reuse-port: every loop owns a listener bound to the same
//!   address and the kernel balances between them.
//! - One loop: that loop owns the listener.
//! - Otherwise an acceptor thread owns the listener and hands accepted
//!   streams to loops using the configured load-balancing strategy.

use crate::error::{Error, Result};
use crate::handler::{Action, EventHandler};
use crate::options::{parse_address, Network, Options};
use crate::runtime::{
    guarded, reuse_port_supported, Acceptor, EventLoop, Listener, LoopShared, Notifier, Poller,
    SockAddr, Task,
};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

/// Lifecycle stage of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServerState {
    Initializing = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Initializing,
            1 => ServerState::Running,
            2 => ServerState::ShuttingDown,
            _ => ServerState::Stopped,
        }
    }
}

/// State shared by every thread of one server.
pub(crate) struct ServerShared {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
    loops: Vec<Arc<LoopShared>>,
    acceptor: Option<Arc<Notifier<Task>>>,
}

impl ServerShared {
    fn new(loops: Vec<Arc<LoopShared>>, acceptor: Option<Arc<Notifier<Task>>>) -> Self {
        Self {
            state: AtomicU8::new(ServerState::Initializing as u8),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            loops,
            acceptor,
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() >= ServerState::ShuttingDown
    }

    /// Move to `ShuttingDown` and wake every thread. Idempotent.
    pub fn signal_shutdown(&self) {
        let prev = self
            .state
            .fetch_max(ServerState::ShuttingDown as u8, Ordering::AcqRel);
        if prev >= ServerState::ShuttingDown as u8 {
            return;
        }
        info!("Server shutting down");

        {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
        for shared in &self.loops {
            shared.request_shutdown();
        }
        if let Some(acceptor) = &self.acceptor {
            let _ = acceptor.trigger(Task::Shutdown);
        }
    }

    /// Sleep up to `timeout`; returns whether shutdown was signalled.
    fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.is_shutting_down() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.is_shutting_down()
    }

    fn count_connections(&self) -> usize {
        self.loops.iter().map(|l| l.connection_count()).sum()
    }
}

/// Signals shutdown when its thread ends, panics included.
struct ShutdownOnExit(Arc<ServerShared>);

impl Drop for ShutdownOnExit {
    fn drop(&mut self) {
        self.0.signal_shutdown();
    }
}

/// Handle to a running server, handed to `on_init_complete` and
/// `on_shutdown`. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Server {
    addr: SockAddr,
    network: Network,
    multicore: bool,
    num_event_loop: usize,
    reuse_port: bool,
    tcp_keep_alive: Option<Duration>,
    shared: Arc<ServerShared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("network", &self.network)
            .field("num_event_loop", &self.num_event_loop)
            .field("state", &self.state())
            .finish()
    }
}

impl Server {
    /// Bound listen address; carries the real port when binding port 0.
    pub fn addr(&self) -> &SockAddr {
        &self.addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn multicore(&self) -> bool {
        self.multicore
    }

    pub fn num_event_loop(&self) -> usize {
        self.num_event_loop
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    pub fn tcp_keep_alive(&self) -> Option<Duration> {
        self.tcp_keep_alive
    }

    /// Live stream connections across all loops.
    pub fn count_connections(&self) -> usize {
        self.shared.count_connections()
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Ask the server to stop. Returns immediately; `serve` returns once
    /// every loop has closed its connections.
    pub fn shutdown(&self) {
        self.shared.signal_shutdown();
    }
}

/// Listeners for each loop, plus one for the acceptor thread if needed.
type Placement = (Vec<Option<Listener>>, Option<Listener>);

fn bind_listeners(
    network: Network,
    address: &str,
    reuse_port: bool,
    num_loops: usize,
) -> Result<Placement> {
    let first = Listener::bind(network, address, reuse_port)?;
    if num_loops == 1 {
        return Ok((vec![Some(first)], None));
    }

    match network {
        Network::Tcp | Network::Udp if reuse_port => {
            // Later binds reuse the resolved address so port 0 stays shared.
            let resolved = first.local_addr()?.to_string();
            let mut listeners = vec![Some(first)];
            for _ in 1..num_loops {
                listeners.push(Some(Listener::bind(network, &resolved, true)?));
            }
            Ok((listeners, None))
        }
        Network::Udp => {
            let mut listeners = Vec::with_capacity(num_loops);
            for _ in 1..num_loops {
                listeners.push(Some(first.try_clone_datagram()?));
            }
            listeners.insert(0, Some(first));
            Ok((listeners, None))
        }
        Network::Tcp | Network::Unix => Ok(((0..num_loops).map(|_| None).collect(), Some(first))),
    }
}

/// Run a server for `handler` on `addr` (`tcp://host:port`,
/// `udp://host:port` or `unix:///path`) until it shuts down.
pub fn serve<H: EventHandler>(handler: H, addr: &str, options: Options) -> Result<()> {
    let (network, address) = parse_address(addr)?;
    let num_loops = options.event_loop_count();
    let reuse_port = options.reuse_port && network != Network::Unix;
    if reuse_port && !reuse_port_supported() {
        return Err(Error::UnsupportedPlatform("SO_REUSEPORT"));
    }

    let (loop_listeners, acceptor_listener) =
        bind_listeners(network, &address, reuse_port, num_loops)?;
    let bound = match loop_listeners.iter().flatten().next().or(acceptor_listener.as_ref()) {
        Some(listener) => listener.local_addr()?,
        None => return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "no listener"))),
    };

    let mut pollers = Vec::with_capacity(num_loops);
    for _ in 0..num_loops {
        pollers.push(Poller::<Task>::new(options.events_capacity)?);
    }
    let loops: Vec<Arc<LoopShared>> = pollers
        .iter()
        .enumerate()
        .map(|(index, poller)| Arc::new(LoopShared::new(index, poller.notifier())))
        .collect();
    let acceptor_poller = match acceptor_listener {
        Some(_) => Some(Poller::<Task>::new(options.events_capacity)?),
        None => None,
    };
    let shared = Arc::new(ServerShared::new(
        loops.clone(),
        acceptor_poller.as_ref().map(|p| p.notifier()),
    ));

    let handler: Arc<dyn EventHandler> = Arc::new(handler);
    let mut event_loops = Vec::with_capacity(num_loops);
    for ((poller, listener), loop_shared) in pollers.into_iter().zip(loop_listeners).zip(&loops) {
        event_loops.push(EventLoop::new(
            poller,
            listener,
            Arc::clone(&handler),
            Arc::clone(loop_shared),
            Arc::clone(&shared),
            &options,
        )?);
    }
    let acceptor = match (acceptor_poller, acceptor_listener) {
        (Some(poller), Some(listener)) => Some(Acceptor::new(
            poller,
            listener,
            options.load_balancing,
            loops.clone(),
            Arc::clone(&shared),
        )?),
        _ => None,
    };

    let server = Server {
        addr: bound,
        network,
        multicore: options.multicore,
        num_event_loop: num_loops,
        reuse_port,
        tcp_keep_alive: options.tcp_keep_alive,
        shared: Arc::clone(&shared),
    };

    info!(
        network = %network,
        addr = %server.addr,
        loops = num_loops,
        reuse_port,
        acceptor = acceptor.is_some(),
        lb = ?options.load_balancing,
        codec = ?options.codec,
        "Server listening"
    );

    if handler.on_init_complete(&server) == Action::Shutdown {
        shared.state.store(ServerState::Stopped as u8, Ordering::Release);
        info!("Server stopped before start");
        return Ok(());
    }
    // A shutdown signalled during init wins.
    let _ = shared.state.compare_exchange(
        ServerState::Initializing as u8,
        ServerState::Running as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    let mut workers: Vec<JoinHandle<io::Result<()>>> = Vec::with_capacity(num_loops + 2);
    let mut first_error: Option<Error> = None;
    let spawned = spawn_workers(event_loops, acceptor, &options, &handler, &shared, &mut workers);
    if let Err(e) = spawned {
        error!(error = %e, "Failed to start worker thread");
        shared.signal_shutdown();
        first_error = Some(e.into());
    }

    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e.into());
            }
            Err(_) => error!("Worker thread panicked"),
        }
    }

    // Streams handed over after a loop stopped draining.
    for loop_shared in &loops {
        for task in loop_shared.notifier.close() {
            loop_shared.discard(task);
        }
    }
    shared.state.store(ServerState::Stopped as u8, Ordering::Release);
    handler.on_shutdown(&server);
    info!("Server stopped");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn spawn_workers(
    event_loops: Vec<EventLoop>,
    acceptor: Option<Acceptor>,
    options: &Options,
    handler: &Arc<dyn EventHandler>,
    shared: &Arc<ServerShared>,
    workers: &mut Vec<JoinHandle<io::Result<()>>>,
) -> io::Result<()> {
    for (index, event_loop) in event_loops.into_iter().enumerate() {
        let exit = ShutdownOnExit(Arc::clone(shared));
        workers.push(
            thread::Builder::new()
                .name(format!("event-loop-{index}"))
                .spawn(move || {
                    let _exit = exit;
                    event_loop.run()
                })?,
        );
    }

    if let Some(acceptor) = acceptor {
        let exit = ShutdownOnExit(Arc::clone(shared));
        workers.push(thread::Builder::new().name("acceptor".to_string()).spawn(
            move || {
                let _exit = exit;
                acceptor.run()
            },
        )?);
    }

    if options.ticker {
        let handler = Arc::clone(handler);
        let shared = Arc::clone(shared);
        workers.push(thread::Builder::new().name("ticker".to_string()).spawn(
            move || {
                run_ticker(&*handler, &shared);
                Ok(())
            },
        )?);
    }
    Ok(())
}

fn run_ticker(handler: &dyn EventHandler, shared: &ServerShared) {
    while !shared.is_shutting_down() {
        let Some((delay, action)) = guarded("tick", || handler.tick()) else {
            shared.signal_shutdown();
            return;
        };
        if action == Action::Shutdown {
            shared.signal_shutdown();
            return;
        }
        if shared.wait_for_shutdown(delay) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, FixedLengthCodec, LengthFieldCodec, LineCodec};
    use crate::options::LoadBalancing;
    use crate::runtime::{Conn, ConnHandle};
    use crate::ByteOrder;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Forwards every callback and reports the `Server` handle on start.
    struct Started<H> {
        inner: H,
        tx: Mutex<Option<mpsc::Sender<Server>>>,
    }

    impl<H: EventHandler> EventHandler for Started<H> {
        fn on_init_complete(&self, server: &Server) -> Action {
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(server.clone());
            }
            self.inner.on_init_complete(server)
        }

        fn on_shutdown(&self, server: &Server) {
            self.inner.on_shutdown(server)
        }

        fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            self.inner.on_opened(conn)
        }

        fn on_closed(&self, conn: &mut Conn, err: Option<&io::Error>) -> Action {
            self.inner.on_closed(conn, err)
        }

        fn pre_write(&self) {
            self.inner.pre_write()
        }

        fn react(&self, frame: Option<&[u8]>, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            self.inner.react(frame, conn)
        }

        fn tick(&self) -> (Duration, Action) {
            self.inner.tick()
        }
    }

    fn start<H: EventHandler>(
        handler: H,
        addr: &str,
        options: Options,
    ) -> (Server, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel();
        let handler = Started {
            inner: handler,
            tx: Mutex::new(Some(tx)),
        };
        let addr = addr.to_string();
        let join = thread::spawn(move || serve(handler, &addr, options));
        let server = rx.recv_timeout(TIMEOUT).expect("server did not start");
        (server, join)
    }

    fn stop(server: &Server, join: JoinHandle<Result<()>>) {
        server.shutdown();
        join.join().unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    fn connect(server: &Server) -> TcpStream {
        let stream = TcpStream::connect(server.addr().as_inet().unwrap()).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    struct Echo;

    impl EventHandler for Echo {
        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (frame.map(<[u8]>::to_vec), Action::None)
        }
    }

    #[test]
    fn test_line_echo_across_partial_writes() {
        let options = Options::default().with_codec(LineCodec::default());
        let (server, join) = start(Echo, "tcp://127.0.0.1:0", options);
        assert_eq!(server.network(), Network::Tcp);
        assert_eq!(server.num_event_loop(), 1);

        let mut client = connect(&server);
        client.write_all(b"hel").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"lo\r\nworld\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "hello\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "world\n");

        stop(&server, join);
    }

    /// Records every frame it sees.
    #[derive(Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<u32>>>,
    }

    impl EventHandler for Recorder {
        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            if let Some(frame) = frame {
                let mut seq = [0u8; 4];
                seq.copy_from_slice(frame);
                self.frames.lock().push(u32::from_be_bytes(seq));
            }
            (None, Action::None)
        }
    }

    #[test]
    fn test_frames_reach_react_in_order_once() {
        const FRAMES: u32 = 2000;
        let recorder = Recorder::default();
        let frames = Arc::clone(&recorder.frames);
        let options = Options::default().with_codec(FixedLengthCodec::new(4).unwrap());
        let (server, join) = start(recorder, "tcp://127.0.0.1:0", options);

        let mut client = connect(&server);
        let payload: Vec<u8> = (0..FRAMES).flat_map(u32::to_be_bytes).collect();
        client.write_all(&payload).unwrap();

        wait_until("all frames", || frames.lock().len() == FRAMES as usize);
        assert!(frames.lock().iter().copied().eq(0..FRAMES));

        stop(&server, join);
    }

    /// Greets raw on open and counts closes.
    #[derive(Default)]
    struct Greeter {
        closed: Arc<AtomicUsize>,
        pre_writes: Arc<AtomicUsize>,
    }

    impl EventHandler for Greeter {
        fn on_opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (Some(b"welcome".to_vec()), Action::None)
        }

        fn on_closed(&self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Action::None
        }

        fn pre_write(&self) {
            self.pre_writes.fetch_add(1, Ordering::SeqCst);
        }

        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            match frame {
                Some(b"bye") => (Some(b"bye".to_vec()), Action::Close),
                Some(frame) => (Some(frame.to_vec()), Action::None),
                None => (None, Action::None),
            }
        }
    }

    #[test]
    fn test_open_greeting_is_raw_and_close_action() {
        let handler = Greeter::default();
        let closed = Arc::clone(&handler.closed);
        let pre_writes = Arc::clone(&handler.pre_writes);
        let options = Options::default().with_codec(LineCodec::default());
        let (server, join) = start(handler, "tcp://127.0.0.1:0", options);

        let mut client = connect(&server);
        let mut greeting = [0u8; 7];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"welcome");
        wait_until("connection count", || server.count_connections() == 1);

        client.write_all(b"bye\n").unwrap();
        assert_eq!(read_to_eof(&mut client), b"bye\n");
        wait_until("on_closed", || closed.load(Ordering::SeqCst) == 1);
        assert_eq!(server.count_connections(), 0);
        // The greeting skips pre_write; the reply does not.
        assert_eq!(pre_writes.load(Ordering::SeqCst), 1);

        stop(&server, join);
    }

    #[test]
    fn test_peer_close_reaches_on_closed() {
        let handler = Greeter::default();
        let closed = Arc::clone(&handler.closed);
        let (server, join) = start(handler, "tcp://127.0.0.1:0", Options::default());

        let mut client = connect(&server);
        let mut greeting = [0u8; 7];
        client.read_exact(&mut greeting).unwrap();
        drop(client);

        wait_until("on_closed", || closed.load(Ordering::SeqCst) == 1);
        wait_until("connection count", || server.count_connections() == 0);
        stop(&server, join);
    }

    /// Publishes each connection's handle and answers wake-ups.
    struct Pusher {
        handles: mpsc::Sender<ConnHandle>,
    }

    impl EventHandler for Pusher {
        fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            if let Some(handle) = conn.handle() {
                let _ = self.handles.send(handle);
            }
            (None, Action::None)
        }

        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            match frame {
                None => (Some(b"woke".to_vec()), Action::None),
                Some(_) => (None, Action::None),
            }
        }
    }

    #[test]
    fn test_async_write_wake_and_close_from_other_thread() {
        let (tx, rx) = mpsc::channel();
        let options = Options::default().with_codec(LineCodec::default());
        let (server, join) = start(Pusher { handles: tx }, "tcp://127.0.0.1:0", options);

        let mut client = connect(&server);
        let handle = rx.recv_timeout(TIMEOUT).unwrap();

        let pusher = thread::spawn(move || {
            handle.async_write(b"pushed").unwrap();
            handle.wake().unwrap();
            handle
        });
        let handle = pusher.join().unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "pushed\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "woke\n");

        handle.close().unwrap();
        assert!(read_to_eof(&mut client).is_empty());
        wait_until("connection count", || server.count_connections() == 0);

        // Operations on a closed connection are dropped quietly.
        handle.async_write(b"late").unwrap();

        stop(&server, join);
    }

    /// Records which loop each connection landed on.
    struct LoopRecorder {
        loops: Arc<Mutex<Vec<usize>>>,
    }

    impl EventHandler for LoopRecorder {
        fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            self.loops.lock().push(conn.loop_index());
            (Some(b"ok".to_vec()), Action::None)
        }

        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (frame.map(<[u8]>::to_vec), Action::None)
        }
    }

    #[test]
    fn test_acceptor_spreads_by_least_connections() {
        let loops = Arc::new(Mutex::new(Vec::new()));
        let options = Options::default()
            .with_num_event_loop(4)
            .with_load_balancing(LoadBalancing::LeastConnections);
        let (server, join) = start(
            LoopRecorder {
                loops: Arc::clone(&loops),
            },
            "tcp://127.0.0.1:0",
            options,
        );
        assert_eq!(server.num_event_loop(), 4);

        let mut clients = Vec::new();
        for _ in 0..8 {
            let mut client = connect(&server);
            let mut ok = [0u8; 2];
            client.read_exact(&mut ok).unwrap();
            clients.push(client);
        }
        assert_eq!(server.count_connections(), 8);

        let mut per_loop = [0usize; 4];
        for &index in loops.lock().iter() {
            per_loop[index] += 1;
        }
        assert_eq!(per_loop, [2, 2, 2, 2]);

        for client in &mut clients {
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
        }

        stop(&server, join);
        assert_eq!(server.count_connections(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reuse_port_loops_share_address() {
        let options = Options::default()
            .with_num_event_loop(3)
            .with_reuse_port(true);
        let (server, join) = start(Echo, "tcp://127.0.0.1:0", options);
        assert!(server.reuse_port());

        for _ in 0..6 {
            let mut client = connect(&server);
            client.write_all(b"abc").unwrap();
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"abc");
        }
        stop(&server, join);
    }

    #[test]
    fn test_length_field_framing_end_to_end() {
        let codec = LengthFieldCodec::with_width(2, ByteOrder::Big).unwrap();
        let options = Options::default().with_codec(codec.clone());
        let (server, join) = start(Echo, "tcp://127.0.0.1:0", options);

        let mut client = connect(&server);
        let frame = codec.encode(b"hello").unwrap();
        assert_eq!(&frame[..], b"\x00\x05hello");
        // Header and body in separate segments.
        client.write_all(&frame[..1]).unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(&frame[1..]).unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"\x00\x05hello");
        stop(&server, join);
    }

    struct Fragile;

    impl EventHandler for Fragile {
        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            if frame == Some(&b"boom"[..]) {
                panic!("handler blew up");
            }
            (frame.map(<[u8]>::to_vec), Action::None)
        }
    }

    #[test]
    fn test_react_panic_closes_only_that_connection() {
        let (server, join) = start(Fragile, "tcp://127.0.0.1:0", Options::default());

        let mut healthy = connect(&server);
        let mut doomed = connect(&server);
        doomed.write_all(b"boom").unwrap();
        assert!(read_to_eof(&mut doomed).is_empty());

        healthy.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        healthy.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
        assert_eq!(server.state(), ServerState::Running);

        stop(&server, join);
    }

    struct Flood {
        errors: mpsc::Sender<io::ErrorKind>,
    }

    impl EventHandler for Flood {
        fn on_closed(&self, _conn: &mut Conn, err: Option<&io::Error>) -> Action {
            if let Some(e) = err {
                let _ = self.errors.send(e.kind());
            }
            Action::None
        }

        fn react(&self, _frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (Some(vec![b'x'; 32 << 20]), Action::None)
        }
    }

    #[test]
    fn test_outbound_limit_closes_slow_reader() {
        let (tx, rx) = mpsc::channel();
        let options = Options::default().with_max_outbound_buffer(1 << 20);
        let (server, join) = start(Flood { errors: tx }, "tcp://127.0.0.1:0", options);

        let mut client = connect(&server);
        client.write_all(b"go").unwrap();
        let kind = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(kind, io::ErrorKind::OutOfMemory);
        wait_until("connection count", || server.count_connections() == 0);

        stop(&server, join);
    }

    #[derive(Default)]
    struct Lifecycle {
        ticks: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl EventHandler for Lifecycle {
        fn on_shutdown(&self, server: &Server) {
            assert_eq!(server.state(), ServerState::Stopped);
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn tick(&self) -> (Duration, Action) {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            let action = if n >= 3 { Action::Shutdown } else { Action::None };
            (Duration::from_millis(10), action)
        }
    }

    #[test]
    fn test_tick_shutdown_stops_server() {
        let handler = Lifecycle::default();
        let ticks = Arc::clone(&handler.ticks);
        let shutdowns = Arc::clone(&handler.shutdowns);

        let options = Options::default().with_ticker(true).with_num_event_loop(2);
        serve(handler, "tcp://127.0.0.1:0", options).unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    struct Quitter;

    impl EventHandler for Quitter {
        fn on_init_complete(&self, server: &Server) -> Action {
            assert_eq!(server.state(), ServerState::Initializing);
            Action::Shutdown
        }
    }

    #[test]
    fn test_init_complete_shutdown_returns_immediately() {
        serve(Quitter, "tcp://127.0.0.1:0", Options::default()).unwrap();
    }

    #[test]
    fn test_serve_rejects_unknown_scheme() {
        assert!(matches!(
            serve(Echo, "sctp://127.0.0.1:0", Options::default()),
            Err(Error::UnsupportedNetwork(_))
        ));
    }

    /// Remembers close errors and stops the server from a frame.
    struct Stopper {
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl EventHandler for Stopper {
        fn on_closed(&self, _conn: &mut Conn, err: Option<&io::Error>) -> Action {
            self.errors
                .lock()
                .push(err.map(|e| e.to_string()).unwrap_or_default());
            Action::None
        }

        fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            match frame {
                Some(b"stop") => (None, Action::Shutdown),
                _ => (None, Action::None),
            }
        }
    }

    #[test]
    fn test_shutdown_action_closes_all_connections() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let options = Options::default().with_num_event_loop(2);
        let (server, join) = start(
            Stopper {
                errors: Arc::clone(&errors),
            },
            "tcp://127.0.0.1:0",
            options,
        );

        let mut bystander = connect(&server);
        let mut trigger = connect(&server);
        wait_until("connections", || server.count_connections() == 2);
        trigger.write_all(b"stop").unwrap();

        join.join().unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.count_connections(), 0);
        assert!(read_to_eof(&mut bystander).is_empty());
        assert!(read_to_eof(&mut trigger).is_empty());

        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e == "server is shutting down"));
    }

    #[test]
    fn test_udp_echo_without_codec() {
        let options = Options::default()
            .with_codec(LineCodec::default())
            .with_num_event_loop(2);
        let (server, join) = start(Echo, "udp://127.0.0.1:0", options);
        assert_eq!(server.network(), Network::Udp);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(TIMEOUT)).unwrap();
        let target = server.addr().as_inet().unwrap();
        for payload in [&b"first"[..], &b"second\n"[..]] {
            client.send_to(payload, target).unwrap();
            let mut buf = [0u8; 64];
            let (n, from) = client.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], payload);
            assert_eq!(from, target);
        }
        assert_eq!(server.count_connections(), 0);

        stop(&server, join);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_echo_and_cleanup() {
        use std::os::unix::net::UnixStream;

        let path = std::env::temp_dir().join(format!("loopnet-serve-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let addr = format!("unix://{}", path.display());

        let options = Options::default().with_num_event_loop(2);
        let (server, join) = start(Echo, &addr, options);
        assert_eq!(server.network(), Network::Unix);
        assert!(path.exists());

        let mut client = UnixStream::connect(&path).unwrap();
        client.set_read_timeout(Some(TIMEOUT)).unwrap();
        client.write_all(b"over unix").unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"over unix");

        stop(&server, join);
        assert!(!path.exists());
    }
}
