//! Readiness poller with a cross-thread task queue.
//!
//! Wraps a mio `Poll` (epoll on Linux, kqueue on BSD/macOS) and pairs it with
//! a lock-free queue plus a `Waker`. Any thread may `trigger` a task; only the
//! thread that owns the `Poller` drains the queue, so connection state never
//! needs a lock.

use crate::error::Error;
use crossbeam_queue::SegQueue;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the self-wake descriptor.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// What the kernel reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    /// Socket error pending (`EPOLLERR` / `EV_ERROR`).
    pub error: bool,
    /// Both directions closed by the peer.
    pub hangup: bool,
}

impl Ready {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() && event.is_write_closed(),
        }
    }
}

/// Cross-thread half of a poller: queue work and wake the owning thread.
#[derive(Debug)]
pub(crate) struct Notifier<T> {
    waker: Waker,
    tasks: SegQueue<T>,
    /// Set while a wake is in flight, so bursts of triggers wake once.
    pending: AtomicBool,
    closed: AtomicBool,
}

impl<T> Notifier<T> {
    /// Queue `task` for the owning thread and wake it.
    pub fn trigger(&self, task: T) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::LoopClosed);
        }
        self.tasks.push(task);
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.waker.wake()?;
        }
        Ok(())
    }

    /// Pop everything queued so far.
    pub fn drain(&self) -> Vec<T> {
        // Clear before popping so a trigger racing with us re-arms the wake.
        self.pending.store(false, Ordering::Release);
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(task) = self.tasks.pop() {
            out.push(task);
        }
        out
    }

    /// Refuse further triggers and hand back whatever is still queued.
    pub fn close(&self) -> Vec<T> {
        self.closed.store(true, Ordering::Release);
        self.drain()
    }
}

/// Thread-owned half: the readiness multiplexer itself.
pub(crate) struct Poller<T> {
    poll: Poll,
    events: Events,
    notifier: Arc<Notifier<T>>,
}

impl<T> Poller<T> {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            notifier: Arc::new(Notifier {
                waker,
                tasks: SegQueue::new(),
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn notifier(&self) -> Arc<Notifier<T>> {
        Arc::clone(&self.notifier)
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn modify<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until something is ready (or `timeout` elapses) and report each
    /// ready descriptor. Wake-ups are swallowed; callers drain the task queue
    /// after every poll.
    pub fn poll<F>(&mut self, timeout: Option<Duration>, mut f: F) -> io::Result<()>
    where
        F: FnMut(Token, Ready),
    {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            f(event.token(), Ready::from_event(event));
        }
        Ok(())
    }

    pub fn drain_tasks(&self) -> Vec<T> {
        self.notifier.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Write;
    use std::thread;

    #[test]
    fn test_trigger_wakes_poll_from_other_thread() {
        let mut poller: Poller<u32> = Poller::new(16).unwrap();
        let notifier = poller.notifier();

        let handle = thread::spawn(move || {
            notifier.trigger(1).unwrap();
            notifier.trigger(2).unwrap();
        });

        let mut tasks = Vec::new();
        while tasks.len() < 2 {
            poller
                .poll(Some(Duration::from_secs(5)), |_, _| {
                    panic!("no descriptors registered")
                })
                .unwrap();
            tasks.extend(poller.drain_tasks());
        }
        handle.join().unwrap();
        assert_eq!(tasks, vec![1, 2]);
    }

    #[test]
    fn test_closed_notifier_rejects_tasks() {
        let poller: Poller<u32> = Poller::new(4).unwrap();
        let notifier = poller.notifier();
        notifier.trigger(7).unwrap();

        assert_eq!(notifier.close(), vec![7]);
        assert!(matches!(notifier.trigger(8), Err(Error::LoopClosed)));
    }

    #[test]
    fn test_readable_event_reported() {
        let mut poller: Poller<()> = Poller::new(16).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        poller
            .register(&mut listener, Token(3), Interest::READABLE)
            .unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut seen = None;
        while seen.is_none() {
            poller
                .poll(Some(Duration::from_secs(5)), |token, ready| {
                    seen = Some((token, ready));
                })
                .unwrap();
        }
        let (token, ready) = seen.unwrap();
        assert_eq!(token, Token(3));
        assert!(ready.readable);

        let (mut stream, _) = listener.accept().unwrap();
        poller
            .register(&mut stream, Token(4), Interest::WRITABLE)
            .unwrap();
        poller.deregister(&mut stream).unwrap();
    }
}
