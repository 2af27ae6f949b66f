//! poller
//!
//! Readiness multiplexer. The original wraps epoll directly with an
//! intrusive `Item` carrying a raw callback pointer; `mio` already gives a
//! portable, safe wrapper over the same edge-triggered readiness model, so
//! `MioPoller` keeps the original's add/mod/del/wait shape and drops the
//! intrusive item in favor of a `Token -> Arc<dyn Fn>` table the loop keeps
//! on its own side.

use std::io;
use std::time::Duration;

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IoEvent: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
    }
}

impl IoEvent {
    fn to_interest(self) -> Interest {
        match (
            self.contains(IoEvent::READ),
            self.contains(IoEvent::WRITE),
        ) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }

    fn from_mio(event: &mio::event::Event) -> Self {
        let mut out = IoEvent::empty();
        if event.is_readable() {
            out |= IoEvent::READ;
        }
        if event.is_writable() {
            out |= IoEvent::WRITE;
        }
        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            out |= IoEvent::ERROR;
        }
        out
    }
}

pub struct ReadinessEvent {
    pub token: u64,
    pub events: IoEvent,
}

/// Thin wrapper over `mio::Poll`, scoped to one `EventLoop`'s thread. `fd`
/// registration is by raw fd — callers own the lifetime of the underlying
/// socket/handle, matching the original's `add(fd, events, item)`.
pub(crate) struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
        })
    }

    pub fn waker(&self, token: u64) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), Token(token as usize))
    }

    pub fn add(&mut self, fd: i32, token: u64, interest: IoEvent) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token as usize), interest.to_interest())
    }

    pub fn modify(&mut self, fd: i32, token: u64, interest: IoEvent) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token as usize), interest.to_interest())
    }

    pub fn remove(&mut self, fd: i32) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Blocks up to `timeout` (None = forever) waiting for readiness,
    /// invoking `on_event` once per ready source.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        mut on_event: impl FnMut(ReadinessEvent),
    ) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            on_event(ReadinessEvent {
                token: event.token().0 as u64,
                events: IoEvent::from_mio(event),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_conversion_round_trips_shape() {
        let rw = IoEvent::READ | IoEvent::WRITE;
        assert!(rw.contains(IoEvent::READ));
        assert!(rw.contains(IoEvent::WRITE));
        assert_eq!(rw.to_interest(), Interest::READABLE.add(Interest::WRITABLE));
    }

    #[test]
    fn wakes_on_waker_notify() {
        let mut poller = MioPoller::new(8).unwrap();
        let waker = poller.waker(99).unwrap();
        waker.wake().unwrap();
        let mut seen = Vec::new();
        poller
            .wait(Some(Duration::from_millis(200)), |ev| seen.push(ev.token))
            .unwrap();
        assert_eq!(seen, vec![99]);
    }
}
