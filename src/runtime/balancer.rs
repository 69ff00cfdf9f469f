//! Assignment of accepted connections to event loops.

use crate::options::LoadBalancing;
use crate::runtime::listener::SockAddr;
use std::net::IpAddr;
use std::sync::Arc;

/// Anything that can report how many connections it holds.
pub(crate) trait LoopLoad {
    fn load(&self) -> usize;
}

impl<T: LoopLoad + ?Sized> LoopLoad for Arc<T> {
    fn load(&self) -> usize {
        (**self).load()
    }
}

/// Picks the loop for each new connection. Used only by the acceptor thread.
#[derive(Debug)]
pub(crate) struct Balancer {
    strategy: LoadBalancing,
    next: usize,
}

impl Balancer {
    pub fn new(strategy: LoadBalancing) -> Self {
        Self { strategy, next: 0 }
    }

    /// Index into `loops` for a connection from `remote`.
    ///
    /// `loops` must not be empty.
    pub fn select<L: LoopLoad>(&mut self, remote: &SockAddr, loops: &[L]) -> usize {
        let n = loops.len();
        if n <= 1 {
            return 0;
        }
        match self.strategy {
            LoadBalancing::RoundRobin => {
                let index = self.next % n;
                self.next = (index + 1) % n;
                index
            }
            // Ties go to the lowest index.
            LoadBalancing::LeastConnections => loops
                .iter()
                .enumerate()
                .min_by_key(|(_, l)| l.load())
                .map(|(i, _)| i)
                .unwrap_or(0),
            LoadBalancing::SourceAddrHash => fnv1a32(&peer_key(remote)) as usize % n,
        }
    }
}

/// Bytes that identify a peer: its IP for inet sockets, so every
/// connection from one host lands on the same loop.
fn peer_key(remote: &SockAddr) -> Vec<u8> {
    match remote {
        SockAddr::Inet(addr) => match addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        },
        SockAddr::Unix(_) => remote.to_string().into_bytes(),
    }
}

/// 32-bit FNV-1a.
fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter().fold(OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(PRIME)
    })
}
