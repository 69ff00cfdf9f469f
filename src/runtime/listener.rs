//! Listening sockets, accepted streams and peer addresses.
//!
//! TCP and UDP sockets are built with socket2 so address reuse and
//! `SO_REUSEPORT` can be set before bind, then handed to mio. Unix sockets
//! go straight through mio.

use crate::error::Error;
use crate::options::Network;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const LISTEN_BACKLOG: i32 = 1024;

/// Address of either end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet(SocketAddr),
    /// Unix domain socket path; `None` for an unnamed peer.
    Unix(Option<PathBuf>),
}

impl SockAddr {
    /// IP socket address, if this is one.
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            SockAddr::Inet(addr) => Some(*addr),
            SockAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{addr}"),
            SockAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            SockAddr::Unix(None) => f.write_str("@"),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        SockAddr::Inet(addr)
    }
}

#[cfg(unix)]
fn unix_addr(addr: &std::os::unix::net::SocketAddr) -> SockAddr {
    SockAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()))
}

/// An accepted stream connection.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    pub fn local_addr(&self) -> io::Result<SockAddr> {
        match self {
            Stream::Tcp(s) => s.local_addr().map(SockAddr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.local_addr().map(|a| unix_addr(&a)),
        }
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            #[cfg(unix)]
            Stream::Unix(s) => s.take_error(),
        }
    }

    /// Enable TCP keep-alive probes; a no-op for unix streams.
    pub fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                let keepalive = socket2::TcpKeepalive::new().with_time(period);
                #[cfg(any(
                    target_os = "linux",
                    target_os = "android",
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "windows"
                ))]
                let keepalive = keepalive.with_interval(period);
                socket2::SockRef::from(s).set_tcp_keepalive(&keepalive)
            }
            #[cfg(unix)]
            Stream::Unix(_) => Ok(()),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write_vectored(bufs),
            #[cfg(unix)]
            Stream::Unix(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

/// UDP endpoint: the mio half is polled, the std half sends replies.
#[derive(Debug)]
pub(crate) struct DatagramSocket {
    pub socket: UdpSocket,
    pub sender: Arc<std::net::UdpSocket>,
}

/// A bound listening endpoint.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Udp(DatagramSocket),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        /// Socket file to remove when this listener goes away.
        path: Option<PathBuf>,
    },
}

impl Listener {
    /// Bind `addr` for `network`.
    ///
    /// `addr` is the scheme-less part of the listen address. With
    /// `reuse_port`, several listeners may bind the same TCP or UDP address
    /// and the kernel spreads traffic between them.
    pub fn bind(network: Network, addr: &str, reuse_port: bool) -> Result<Self, Error> {
        match network {
            Network::Tcp => {
                let sock_addr = resolve(addr)?;
                let socket = bind_socket(sock_addr, socket2::Type::STREAM, reuse_port)
                    .map_err(|source| bind_error(addr, source))?;
                socket
                    .listen(LISTEN_BACKLOG)
                    .map_err(|source| bind_error(addr, source))?;
                let std_listener: std::net::TcpListener = socket.into();
                Ok(Listener::Tcp(TcpListener::from_std(std_listener)))
            }
            Network::Udp => {
                let sock_addr = resolve(addr)?;
                let socket = bind_socket(sock_addr, socket2::Type::DGRAM, reuse_port)
                    .map_err(|source| bind_error(addr, source))?;
                let std_socket: std::net::UdpSocket = socket.into();
                Self::from_std_udp(std_socket).map_err(|source| bind_error(addr, source))
            }
            #[cfg(unix)]
            Network::Unix => {
                if reuse_port {
                    debug!("reuse_port has no effect on unix sockets");
                }
                let listener =
                    UnixListener::bind(addr).map_err(|source| bind_error(addr, source))?;
                Ok(Listener::Unix {
                    listener,
                    path: Some(PathBuf::from(addr)),
                })
            }
            #[cfg(not(unix))]
            Network::Unix => Err(Error::UnsupportedPlatform("unix domain sockets")),
        }
    }

    fn from_std_udp(socket: std::net::UdpSocket) -> io::Result<Self> {
        let sender = Arc::new(socket.try_clone()?);
        Ok(Listener::Udp(DatagramSocket {
            socket: UdpSocket::from_std(socket),
            sender,
        }))
    }

    /// Another handle to the same UDP socket, for sharing between loops.
    pub fn try_clone_datagram(&self) -> io::Result<Self> {
        match self {
            Listener::Udp(dgram) => Self::from_std_udp(dgram.sender.try_clone()?),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "only datagram sockets are shared between loops",
            )),
        }
    }

    pub fn local_addr(&self) -> io::Result<SockAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().map(SockAddr::Inet),
            Listener::Udp(d) => d.socket.local_addr().map(SockAddr::Inet),
            #[cfg(unix)]
            Listener::Unix { listener, .. } => listener.local_addr().map(|a| unix_addr(&a)),
        }
    }

    /// Accept one pending stream. `WouldBlock` once the backlog is empty.
    pub fn accept(&self) -> io::Result<(Stream, SockAddr)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                Ok((Stream::Tcp(stream), SockAddr::Inet(peer)))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, peer) = listener.accept()?;
                Ok((Stream::Unix(stream), unix_addr(&peer)))
            }
            Listener::Udp(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "accept on a datagram socket",
            )),
        }
    }

    pub fn source(&mut self) -> &mut dyn Source {
        match self {
            Listener::Tcp(l) => l,
            Listener::Udp(d) => &mut d.socket,
            #[cfg(unix)]
            Listener::Unix { listener, .. } => listener,
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix {
            path: Some(path), ..
        } = self
        {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, Error> {
    let invalid = |reason: String| Error::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };
    addr.to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses resolved".to_string()))
}

fn bind_error(addr: &str, source: io::Error) -> Error {
    Error::Bind {
        addr: addr.to_string(),
        source,
    }
}

/// Create a non-blocking TCP or UDP socket bound to `addr`.
fn bind_socket(
    addr: SocketAddr,
    ty: socket2::Type,
    reuse_port: bool,
) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let protocol = if ty == socket2::Type::STREAM {
        socket2::Protocol::TCP
    } else {
        socket2::Protocol::UDP
    };
    let socket = socket2::Socket::new(domain, ty, Some(protocol))?;

    if reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &socket2::Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &socket2::Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_REUSEPORT is not supported on this platform",
    ))
}

/// Whether per-loop listeners can share one port on this platform.
pub(crate) fn reuse_port_supported() -> bool {
    cfg!(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))
}
