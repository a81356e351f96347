//! Hostname resolution multiplexed into the engine's event loop.
//!
//! The bridge drives an asynchronous [`Resolver`] that owns its own sockets.
//! The resolver announces every socket it opens, re-arms or closes through a
//! [`ResolverSink`]; the bridge mirrors those announcements into event-loop
//! registrations and feeds readiness back with [`Resolver::process_fd`].
//!
//! ```text
//!   resolve("example.org") ──> Resolver::gethostbyname ──> sink.socket_state(fd, r, w)
//!                                                              │
//!   EventLoop ── readiness(fd) ──> Resolver::process_fd ──> sink.answer(handle, ip)
//!                                                              │
//!   next Engine::poll ──> callback(engine, Ok(ip))  <──────────┘
//! ```
//!
//! Answers are only delivered from the engine's dispatch loop, so a callback
//! never runs inside the call that started its lookup.

pub mod udp;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use slab::Slab;

use crate::engine::Engine;
use crate::error::DnsError;
use crate::event_loop::{EventLoop, Interest};
use crate::socket::SocketId;

pub use udp::UdpResolver;

/// Event loop keys with this bit set belong to resolver sockets.
pub(crate) const DNS_KEY_FLAG: usize = 1 << (usize::BITS - 1);

/// Token for an in-flight resolution.
///
/// Pass it to [`Engine::invalidate`](crate::Engine::invalidate) to suppress
/// the callback, for instance when the object waiting for it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveHandle(u64);

impl ResolveHandle {
    fn new(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw value, usable as a resolver-side query tag.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Interest change announced by a resolver for one of its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketState {
    /// Resolver-owned descriptor.
    pub fd: RawFd,
    /// Wake the resolver when `fd` is readable.
    pub readable: bool,
    /// Wake the resolver when `fd` is writable.
    pub writable: bool,
}

/// Collects what a resolver reports during one call.
#[derive(Debug, Default)]
pub struct ResolverSink {
    sockets: Vec<SocketState>,
    answers: Vec<(ResolveHandle, Result<IpAddr, DnsError>)>,
}

impl ResolverSink {
    /// Announces the interest of `fd`. Both flags `false` means the socket is
    /// about to close; keep it open until the current call returns.
    pub fn socket_state(&mut self, fd: RawFd, readable: bool, writable: bool) {
        self.sockets.push(SocketState {
            fd,
            readable,
            writable,
        });
    }

    /// Reports the outcome of `query`.
    pub fn answer(&mut self, query: ResolveHandle, result: Result<IpAddr, DnsError>) {
        self.answers.push((query, result));
    }
}

/// Asynchronous resolver contract.
///
/// None of these calls may block. All socket changes and answers are reported
/// through the sink handed to each call.
pub trait Resolver {
    /// Starts an IPv4 lookup of `host`, tagged with `query`.
    fn gethostbyname(
        &mut self,
        host: &str,
        query: ResolveHandle,
        sink: &mut ResolverSink,
    ) -> Result<(), DnsError>;

    /// Handles readiness of one of the resolver's sockets. Called with both
    /// `None` once per loop iteration so that expired queries can be retried
    /// or failed.
    fn process_fd(
        &mut self,
        readable: Option<RawFd>,
        writable: Option<RawFd>,
        sink: &mut ResolverSink,
    );

    /// Time until the earliest query deadline.
    fn timeout(&self) -> Option<Duration>;
}

pub(crate) type ResolveCallback = Box<dyn FnOnce(&mut Engine, Result<IpAddr, DnsError>)>;

/// What to do once a lookup finishes.
pub(crate) enum Completion {
    /// Continue a hostname connect.
    Connect { socket: SocketId, port: u16 },
    /// Hand the result to the application.
    User(ResolveCallback),
}

struct Query {
    generation: u32,
    host: String,
    completion: Option<Completion>,
    done: bool,
    invalidated: bool,
}

pub(crate) struct DnsBridge {
    resolver: Box<dyn Resolver>,
    queries: Slab<Query>,
    /// Resolver socket -> registered interest.
    table: HashMap<RawFd, Interest>,
    max_sockets: usize,
    next_generation: u32,
    finished: VecDeque<(ResolveHandle, Result<IpAddr, DnsError>)>,
}

impl DnsBridge {
    pub(crate) fn new(resolver: Box<dyn Resolver>, max_sockets: usize) -> Self {
        Self {
            resolver,
            queries: Slab::new(),
            table: HashMap::new(),
            max_sockets,
            next_generation: 0,
            finished: VecDeque::new(),
        }
    }

    pub(crate) fn resolve(
        &mut self,
        host: &str,
        completion: Completion,
        ev: &EventLoop,
    ) -> Result<ResolveHandle, DnsError> {
        if self.table.len() >= self.max_sockets {
            return Err(DnsError::Capacity(self.max_sockets));
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let mut sink = ResolverSink::default();
        let entry = self.queries.vacant_entry();
        let handle = ResolveHandle::new(entry.key(), generation);
        let started = self.resolver.gethostbyname(host, handle, &mut sink);
        if started.is_ok() {
            entry.insert(Query {
                generation,
                host: host.to_owned(),
                completion: Some(completion),
                done: false,
                invalidated: false,
            });
            log::debug!("resolving {host} as {handle:?}");
        }
        self.apply(sink, ev);
        started.map(|()| handle)
    }

    /// Marks `handle` so that its result is dropped instead of delivered.
    /// The query itself is reclaimed when the lookup finishes.
    pub(crate) fn invalidate(&mut self, handle: ResolveHandle) -> bool {
        match self.query_mut(handle) {
            Some(query) => {
                query.invalidated = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn on_ready(&mut self, key: usize, readable: bool, writable: bool, ev: &EventLoop) {
        let fd = (key & !DNS_KEY_FLAG) as RawFd;
        if !self.table.contains_key(&fd) {
            return;
        }
        let mut sink = ResolverSink::default();
        self.resolver.process_fd(
            readable.then_some(fd),
            writable.then_some(fd),
            &mut sink,
        );
        self.apply(sink, ev);
    }

    pub(crate) fn process_timeouts(&mut self, ev: &EventLoop) {
        if self.queries.is_empty() {
            return;
        }
        let mut sink = ResolverSink::default();
        self.resolver.process_fd(None, None, &mut sink);
        self.apply(sink, ev);
    }

    /// Time the engine may sleep before the bridge needs attention again.
    pub(crate) fn timeout(&self) -> Option<Duration> {
        if !self.finished.is_empty() {
            return Some(Duration::ZERO);
        }
        if self.queries.is_empty() {
            return None;
        }
        self.resolver.timeout()
    }

    /// Takes every finished lookup whose handle is still valid. Invalidated
    /// queries are reclaimed here without producing anything.
    pub(crate) fn take_finished(&mut self) -> Vec<(Completion, Result<IpAddr, DnsError>)> {
        let mut out = Vec::with_capacity(self.finished.len());
        while let Some((handle, result)) = self.finished.pop_front() {
            let Some(query) = self.query_mut(handle) else {
                continue;
            };
            let invalidated = query.invalidated;
            let completion = query.completion.take();
            let query = self.queries.remove(handle.slot());
            if invalidated {
                log::debug!("dropping result for invalidated lookup of {}", query.host);
                continue;
            }
            if let Some(completion) = completion {
                out.push((completion, result));
            }
        }
        out
    }

    /// Resolver sockets currently registered.
    pub(crate) fn sockets(&self) -> usize {
        self.table.len()
    }

    /// Lookups started and not yet reclaimed.
    pub(crate) fn pending(&self) -> usize {
        self.queries.len()
    }

    fn query_mut(&mut self, handle: ResolveHandle) -> Option<&mut Query> {
        self.queries
            .get_mut(handle.slot())
            .filter(|q| q.generation == handle.generation())
    }

    fn apply(&mut self, mut sink: ResolverSink, ev: &EventLoop) {
        for SocketState {
            fd,
            readable,
            writable,
        } in sink.sockets.drain(..)
        {
            let interest = Interest { readable, writable };
            let key = DNS_KEY_FLAG | fd as usize;

            if interest.is_empty() {
                if self.table.remove(&fd).is_some() {
                    log::debug!("resolver socket {fd} closed");
                    if let Err(e) = ev.deregister(fd) {
                        log::debug!("deregister resolver socket {fd}: {e}");
                    }
                }
                continue;
            }

            match self.table.get_mut(&fd) {
                Some(current) if *current == interest => {}
                Some(current) => match ev.modify(fd, key, interest) {
                    Ok(()) => *current = interest,
                    Err(e) => log::warn!("modify resolver socket {fd}: {e}"),
                },
                None => match ev.register(fd, key, interest) {
                    Ok(()) => {
                        log::debug!("resolver socket {fd} opened");
                        self.table.insert(fd, interest);
                    }
                    Err(e) => log::warn!("register resolver socket {fd}: {e}"),
                },
            }
        }

        for (handle, result) in sink.answers.drain(..) {
            match self.query_mut(handle) {
                Some(query) if !query.done => {
                    query.done = true;
                    self.finished.push_back((handle, result));
                }
                _ => log::debug!("answer for unknown query {handle:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::os::fd::AsRawFd;
    use std::rc::Rc;

    /// Opens a real socket per query and answers when told to.
    #[derive(Default)]
    struct Scripted {
        open: Vec<(ResolveHandle, UdpSocket)>,
        sync_answer: bool,
        release: Rc<RefCell<bool>>,
    }

    impl Resolver for Scripted {
        fn gethostbyname(
            &mut self,
            host: &str,
            query: ResolveHandle,
            sink: &mut ResolverSink,
        ) -> Result<(), DnsError> {
            if host.is_empty() {
                return Err(DnsError::BadName(host.into()));
            }
            if self.sync_answer {
                sink.answer(query, Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)));
                return Ok(());
            }
            let socket = UdpSocket::bind("127.0.0.1:0")?;
            sink.socket_state(socket.as_raw_fd(), true, false);
            self.open.push((query, socket));
            Ok(())
        }

        fn process_fd(&mut self, _r: Option<RawFd>, _w: Option<RawFd>, sink: &mut ResolverSink) {
            if !*self.release.borrow() {
                return;
            }
            for (query, socket) in self.open.drain(..) {
                sink.socket_state(socket.as_raw_fd(), false, false);
                sink.answer(query, Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
            }
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }
    }

    fn user() -> Completion {
        Completion::User(Box::new(|_, _| {}))
    }

    #[test]
    fn test_socket_table_follows_resolver() {
        let ev = EventLoop::new(8).unwrap();
        let release = Rc::new(RefCell::new(false));
        let resolver = Scripted {
            release: release.clone(),
            ..Default::default()
        };
        let mut bridge = DnsBridge::new(Box::new(resolver), 4);

        bridge.resolve("a.test", user(), &ev).unwrap();
        bridge.resolve("b.test", user(), &ev).unwrap();
        assert_eq!(bridge.sockets(), 2);
        assert_eq!(bridge.pending(), 2);

        bridge.process_timeouts(&ev);
        assert!(bridge.take_finished().is_empty());

        *release.borrow_mut() = true;
        bridge.process_timeouts(&ev);
        assert_eq!(bridge.sockets(), 0);
        assert_eq!(bridge.timeout(), Some(Duration::ZERO));
        assert_eq!(bridge.take_finished().len(), 2);
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let ev = EventLoop::new(8).unwrap();
        let mut bridge = DnsBridge::new(Box::new(Scripted::default()), 1);

        bridge.resolve("a.test", user(), &ev).unwrap();
        let err = bridge.resolve("b.test", user(), &ev).unwrap_err();
        assert!(matches!(err, DnsError::Capacity(1)));
        assert_eq!(bridge.pending(), 1);
    }

    #[test]
    fn test_invalidated_result_is_dropped() {
        let ev = EventLoop::new(8).unwrap();
        let release = Rc::new(RefCell::new(false));
        let resolver = Scripted {
            release: release.clone(),
            ..Default::default()
        };
        let mut bridge = DnsBridge::new(Box::new(resolver), 4);

        let handle = bridge.resolve("a.test", user(), &ev).unwrap();
        assert!(bridge.invalidate(handle));
        assert_eq!(bridge.pending(), 1);

        *release.borrow_mut() = true;
        bridge.process_timeouts(&ev);
        assert_eq!(bridge.sockets(), 0);
        assert!(bridge.take_finished().is_empty());
        assert_eq!(bridge.pending(), 0);
        assert!(!bridge.invalidate(handle));
    }

    #[test]
    fn test_sync_answer_is_deferred() {
        let ev = EventLoop::new(8).unwrap();
        let resolver = Scripted {
            sync_answer: true,
            ..Default::default()
        };
        let mut bridge = DnsBridge::new(Box::new(resolver), 4);

        bridge.resolve("localhost", user(), &ev).unwrap();
        assert_eq!(bridge.sockets(), 0);
        assert_eq!(bridge.timeout(), Some(Duration::ZERO));
        let done = bridge.take_finished();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].1, Ok(IpAddr::V4(ip)) if ip == Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_rejected_lookup_leaves_nothing() {
        let ev = EventLoop::new(8).unwrap();
        let mut bridge = DnsBridge::new(Box::new(Scripted::default()), 4);
        assert!(matches!(bridge.resolve("", user(), &ev), Err(DnsError::BadName(_))));
        assert_eq!(bridge.pending(), 0);
        assert_eq!(bridge.sockets(), 0);
    }
}
