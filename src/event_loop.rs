//! Level-triggered readiness loop over [`polling`].
//!
//! Both socket descriptors and resolver descriptors are registered here. Each
//! registration carries a `usize` key that comes back with every readiness
//! notification; the engine decides what the key means.

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};

/// Read/write interest of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// Wake up when the descriptor is readable.
    pub readable: bool,
    /// Wake up when the descriptor is writable.
    pub writable: bool,
}

impl Interest {
    /// Read interest only.
    pub const READ: Interest = Interest { readable: true, writable: false };
    /// Write interest only.
    pub const WRITE: Interest = Interest { readable: false, writable: true };
    /// Read and write interest.
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    /// Returns `true` when neither direction is wanted.
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    fn event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Key given at registration.
    pub key: usize,
    /// The descriptor can be read without blocking.
    pub readable: bool,
    /// The descriptor can be written without blocking.
    pub writable: bool,
}

/// Readiness loop shared by sockets and the DNS bridge.
pub struct EventLoop {
    poller: Poller,
    events: Events,
}

impl EventLoop {
    /// Creates a loop whose event buffer holds `capacity` notifications.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            poller: Poller::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Starts watching `fd` in level-triggered mode.
    ///
    /// The caller must keep `fd` open until [`deregister`](Self::deregister).
    pub fn register(&self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        log::trace!("register fd {fd} key {key:#x} {interest:?}");
        // SAFETY: the caller keeps fd open until it is deregistered
        unsafe { self.poller.add_with_mode(fd, interest.event(key), PollMode::Level) }
    }

    /// Replaces the interest of an existing registration.
    pub fn modify(&self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        log::trace!("modify fd {fd} key {key:#x} {interest:?}");
        // SAFETY: fd is registered, so the owner still holds it open
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(fd, interest.event(key), PollMode::Level)
    }

    /// Stops watching `fd`.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        log::trace!("deregister fd {fd}");
        // SAFETY: as for modify
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(fd)
    }

    /// Blocks until at least one registration is ready or `timeout` elapses,
    /// appending notifications to `ready`.
    pub fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<usize> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        let before = ready.len();
        ready.extend(self.events.iter().map(|e| Readiness {
            key: e.key,
            readable: e.readable,
            writable: e.writable,
        }));
        Ok(ready.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_level_triggered_read() {
        let mut ev = EventLoop::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        ev.register(a.as_raw_fd(), 7, Interest::READ).unwrap();
        b.write_all(b"x").unwrap();

        // Nothing is read, so level-triggered mode reports it twice.
        for _ in 0..2 {
            let mut ready = Vec::new();
            ev.wait(&mut ready, Some(Duration::from_secs(1))).unwrap();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].key, 7);
            assert!(ready[0].readable);
        }
        ev.deregister(a.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_modify_to_write() {
        let mut ev = EventLoop::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        ev.register(a.as_raw_fd(), 1, Interest::READ).unwrap();

        let mut ready = Vec::new();
        ev.wait(&mut ready, Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());

        ev.modify(a.as_raw_fd(), 1, Interest::WRITE).unwrap();
        ev.wait(&mut ready, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].writable);
    }

    #[test]
    fn test_interest_event() {
        assert!(Interest::default().is_empty());
        assert!(!Interest::BOTH.is_empty());
        let e = Interest::WRITE.event(3);
        assert_eq!(e.key, 3);
        assert!(e.writable && !e.readable);
    }
}
