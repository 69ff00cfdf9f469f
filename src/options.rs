//! Engine options and address parsing.
//!
//! Options are fixed once `serve` starts. Defaults mirror a single-loop
//! TCP server with the pass-through codec.

use crate::codec::{Codec, RawCodec};
use crate::error::Error;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Transport selected by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        })
    }
}

/// Split `scheme://address` into its network and address parts.
///
/// A missing scheme means TCP. `tcp4`/`tcp6`/`udp4`/`udp6` are accepted as
/// aliases; the address family then follows from the address itself. A TCP
/// or UDP address without a host (`:9000`) binds every interface.
pub fn parse_address(addr: &str) -> Result<(Network, String), Error> {
    let (scheme, rest) = match addr.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", addr),
    };

    let network = match scheme.to_ascii_lowercase().as_str() {
        "tcp" | "tcp4" | "tcp6" => Network::Tcp,
        "udp" | "udp4" | "udp6" => Network::Udp,
        "unix" => Network::Unix,
        _ => return Err(Error::UnsupportedNetwork(scheme.to_string())),
    };

    if rest.is_empty() {
        return Err(Error::InvalidAddress {
            addr: addr.to_string(),
            reason: "empty address".to_string(),
        });
    }

    let address = if network != Network::Unix && rest.starts_with(':') {
        format!("0.0.0.0{rest}")
    } else {
        rest.to_string()
    };
    Ok((network, address))
}

/// Policy for assigning accepted connections to event loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    SourceAddrHash,
}

impl FromStr for LoadBalancing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalancing::RoundRobin),
            "least_connections" => Ok(LoadBalancing::LeastConnections),
            "source_addr_hash" => Ok(LoadBalancing::SourceAddrHash),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

/// Server options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Run one event loop per CPU unless `num_event_loop` says otherwise.
    pub multicore: bool,
    /// Explicit event loop count; 0 means "decide from `multicore`".
    pub num_event_loop: usize,
    /// Let the kernel spread connections over per-loop listeners.
    pub reuse_port: bool,
    pub load_balancing: LoadBalancing,
    /// Framing shared by every stream connection.
    pub codec: Arc<dyn Codec>,
    /// Drive `EventHandler::tick` from a dedicated thread.
    pub ticker: bool,
    pub tcp_keep_alive: Option<Duration>,
    /// Upper bound of a single socket read.
    pub read_buffer_cap: usize,
    /// Outbound bytes a connection may hold before it is dropped; 0 = no cap.
    pub max_outbound_buffer: usize,
    /// Live connections per event loop.
    pub max_connections: usize,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            multicore: false,
            num_event_loop: 0,
            reuse_port: false,
            load_balancing: LoadBalancing::RoundRobin,
            codec: Arc::new(RawCodec),
            ticker: false,
            tcp_keep_alive: None,
            read_buffer_cap: 64 * 1024,
            max_outbound_buffer: 64 * 1024 * 1024,
            max_connections: 65536,
            events_capacity: 1024,
        }
    }
}

impl Options {
    pub fn with_multicore(mut self, multicore: bool) -> Self {
        self.multicore = multicore;
        self
    }

    pub fn with_num_event_loop(mut self, n: usize) -> Self {
        self.num_event_loop = n;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_load_balancing(mut self, lb: LoadBalancing) -> Self {
        self.load_balancing = lb;
        self
    }

    pub fn with_codec<C: Codec + 'static>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_ticker(mut self, ticker: bool) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn with_tcp_keep_alive(mut self, period: Duration) -> Self {
        self.tcp_keep_alive = Some(period);
        self
    }

    pub fn with_read_buffer_cap(mut self, bytes: usize) -> Self {
        self.read_buffer_cap = bytes;
        self
    }

    pub fn with_max_outbound_buffer(mut self, bytes: usize) -> Self {
        self.max_outbound_buffer = bytes;
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Number of event loops `serve` will start.
    pub fn event_loop_count(&self) -> usize {
        if self.num_event_loop > 0 {
            self.num_event_loop
        } else if self.multicore {
            num_cpus()
        } else {
            1
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
