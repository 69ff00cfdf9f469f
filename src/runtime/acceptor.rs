//! Dedicated accept thread for a listener shared by several loops.
//!
//! Used when the kernel cannot spread connections for us (no reuse-port,
//! or a unix socket). Accepted streams are counted against the chosen loop
//! before they are handed over, so least-connections sees them immediately.

use crate::options::LoadBalancing;
use crate::runtime::balancer::Balancer;
use crate::runtime::event_loop::{LoopShared, Task, LISTENER_TOKEN};
use crate::runtime::listener::Listener;
use crate::runtime::poller::Poller;
use crate::server::ServerShared;
use mio::Interest;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Acceptor {
    poller: Poller<Task>,
    listener: Listener,
    balancer: Balancer,
    loops: Vec<Arc<LoopShared>>,
    server: Arc<ServerShared>,
}

impl Acceptor {
    pub fn new(
        poller: Poller<Task>,
        mut listener: Listener,
        strategy: LoadBalancing,
        loops: Vec<Arc<LoopShared>>,
        server: Arc<ServerShared>,
    ) -> io::Result<Self> {
        poller.register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poller,
            listener,
            balancer: Balancer::new(strategy),
            loops,
            server,
        })
    }

    pub fn run(mut self) -> io::Result<()> {
        debug!(loops = self.loops.len(), "Acceptor started");
        let result = self.run_until_shutdown();
        let _ = self.poller.deregister(self.listener.source());
        self.poller.notifier().close();
        debug!("Acceptor exited");
        result
    }

    fn run_until_shutdown(&mut self) -> io::Result<()> {
        while !self.server.is_shutting_down() {
            let mut listener_ready = false;
            self.poller.poll(None, |token, _| {
                if token == LISTENER_TOKEN {
                    listener_ready = true;
                }
            })?;
            // Only shutdown requests arrive here.
            self.poller.drain_tasks();
            if listener_ready {
                self.accept_connections();
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => {
                    let index = self.balancer.select(&remote, &self.loops);
                    let target = &self.loops[index];
                    target.add_connection();
                    if let Err(e) = target.notifier.trigger(Task::Register { stream, remote }) {
                        debug!(loop_id = index, error = %e, "Dropping connection for closed loop");
                        target.remove_connection();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            }
        }
    }
}
