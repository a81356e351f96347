//! The engine: socket arena, readiness dispatch and the write API.

use std::fs::File;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use slab::Slab;
use socket2::{Domain, SockAddr, Socket as RawSocket, Type};

use crate::config::EngineConfig;
use crate::dns::{Completion, DNS_KEY_FLAG, DnsBridge, ResolveHandle, Resolver, UdpResolver};
use crate::error::{DnsError, Error, Result};
use crate::event_loop::{EventLoop, Readiness};
use crate::handler::{AcceptHandler, StreamHandler};
use crate::job::{Job, WriteData};
use crate::pool::JobPool;
use crate::queue::Drain;
use crate::secure::{SecureFactory, SecureLayer};
use crate::socket::{
    ConnState, Handler, Protocol, Role, Socket, SocketFlags, SocketId, SocketStates, SocketTarget,
};

/// Single-threaded socket engine.
///
/// Owns every socket, the job pool, the DNS bridge and the readiness loop.
/// Drive it with [`poll`](Self::poll) or [`run`](Self::run); all handler
/// callbacks run from inside those calls, except `on_disconnect` for failures
/// detected synchronously by [`write`](Self::write) and friends.
pub struct Engine {
    config: EngineConfig,
    poller: EventLoop,
    sockets: Slab<Socket>,
    jobs: JobPool,
    dns: DnsBridge,
    next_generation: u32,
    secure_factory: Option<SecureFactory>,
    running: bool,
    ready: Vec<Readiness>,
    /// Listeners with accepting suspended, and when to resume them.
    paused: Vec<(SocketId, Instant)>,
}

/// How long a listener stops accepting after a hard `accept(2)` failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn slot_mut(sockets: &mut Slab<Socket>, id: SocketId) -> Option<&mut Socket> {
    sockets
        .get_mut(id.slot())
        .filter(|s| s.generation == id.generation())
}

fn writable_slot(sockets: &mut Slab<Socket>, id: SocketId) -> Result<&mut Socket> {
    let sock = slot_mut(sockets, id).ok_or(Error::StaleSocket(id))?;
    if sock.is_listener() {
        return Err(Error::Unsupported("listening sockets cannot be written"));
    }
    match sock.state {
        ConnState::Online | ConnState::Progress if sock.fd.is_some() => Ok(sock),
        state => Err(Error::NotWritable(state)),
    }
}

fn parse_local(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip = match ip {
        "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        s => s
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_owned()))?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Creates the descriptor of a client socket and issues a non-blocking connect.
fn open_stream(
    sock: &mut Socket,
    addr: SocketAddr,
    nodelay: bool,
    factory: Option<&SecureFactory>,
) -> io::Result<()> {
    let (ty, proto) = match sock.proto {
        Protocol::Udp => (Type::DGRAM, socket2::Protocol::UDP),
        Protocol::Tcp | Protocol::Ssl => (Type::STREAM, socket2::Protocol::TCP),
    };
    let fd = RawSocket::new(Domain::for_address(addr), ty, Some(proto))?;
    fd.set_nonblocking(true)?;
    if nodelay && sock.proto != Protocol::Udp {
        fd.set_nodelay(true)?;
    }
    match fd.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    if sock.proto == Protocol::Ssl {
        sock.secure = factory.map(|f| f(Role::Client));
    }
    sock.fd = Some(fd);
    sock.state = ConnState::Progress;
    sock.remote_port = addr.port();
    Ok(())
}

fn sock_addr(addr: io::Result<SockAddr>) -> Result<SocketAddr> {
    addr?
        .as_socket()
        .ok_or(Error::Unsupported("not an inet socket"))
}

impl Engine {
    /// Creates an engine resolving hostnames through the system nameserver.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let resolver =
            UdpResolver::from_system().with_timeout(config.dns_timeout, config.dns_attempts);
        Self::with_resolver(config, Box::new(resolver))
    }

    /// Creates an engine using `resolver` for hostname lookups.
    pub fn with_resolver(config: EngineConfig, resolver: Box<dyn Resolver>) -> Result<Self> {
        let poller = EventLoop::new(config.events_capacity)?;
        let dns = DnsBridge::new(resolver, config.max_dns_sockets);
        Ok(Self {
            poller,
            sockets: Slab::new(),
            jobs: JobPool::with_capacity(64),
            dns,
            next_generation: 0,
            secure_factory: None,
            running: false,
            ready: Vec::with_capacity(config.events_capacity),
            paused: Vec::new(),
            config,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Installs the factory that builds the [`SecureLayer`] of every SSL socket.
    pub fn set_secure_factory<F>(&mut self, factory: F)
    where
        F: Fn(Role) -> Box<dyn SecureLayer> + 'static,
    {
        self.secure_factory = Some(Box::new(factory));
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Starts a TCP or SSL listener on `local_ip:port`.
    ///
    /// An empty `local_ip` or `"*"` binds every interface. Port 0 picks a free
    /// port, see [`local_addr`](Self::local_addr).
    pub fn listen<A>(
        &mut self,
        proto: Protocol,
        port: u16,
        local_ip: &str,
        acceptor: A,
    ) -> Result<SocketId>
    where
        A: AcceptHandler + 'static,
    {
        match proto {
            Protocol::Udp => return Err(Error::Unsupported("UDP endpoints are bound, not listening")),
            Protocol::Ssl if self.secure_factory.is_none() => {
                return Err(Error::Unsupported("no secure layer factory installed"));
            }
            _ => {}
        }
        let addr = parse_local(local_ip, port)?;

        let fd = RawSocket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        fd.set_reuse_address(true)?;
        fd.set_nonblocking(true)?;
        fd.bind(&addr.into())?;
        fd.listen(self.config.backlog)?;

        let handler = Handler::Accept(Box::new(acceptor));
        let mut sock = Socket::new(proto, Role::Server, ConnState::Online, Some(handler));
        sock.fd = Some(fd);
        sock.established = true;
        let id = self.insert(sock);
        self.register_or_remove(id)?;
        log::debug!("{id:?} listening on {addr} ({proto:?})");
        Ok(id)
    }

    /// Binds a UDP endpoint on `local_ip:port`. Every datagram is delivered
    /// through [`StreamHandler::on_read`].
    pub fn bind<H>(&mut self, port: u16, local_ip: &str, handler: H) -> Result<SocketId>
    where
        H: StreamHandler + 'static,
    {
        let addr = parse_local(local_ip, port)?;
        let fd = RawSocket::new(
            Domain::for_address(addr),
            Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        fd.set_reuse_address(true)?;
        fd.set_nonblocking(true)?;
        fd.bind(&addr.into())?;

        let handler = Handler::Stream(Box::new(handler));
        let mut sock = Socket::new(Protocol::Udp, Role::Server, ConnState::Online, Some(handler));
        sock.fd = Some(fd);
        sock.established = true;
        let id = self.insert(sock);
        self.register_or_remove(id)?;
        log::debug!("{id:?} bound on {addr}");
        Ok(id)
    }

    /// Connects to `host:port`.
    ///
    /// A numeric `host` connects right away. Anything else is resolved first;
    /// the socket stays [`ConnState::Offline`] until the answer arrives, and a
    /// failed lookup ends in `on_disconnect` without a connect attempt.
    /// `on_connected` fires once the connect is confirmed.
    pub fn connect<H>(&mut self, proto: Protocol, port: u16, host: &str, handler: H) -> Result<SocketId>
    where
        H: StreamHandler + 'static,
    {
        if proto == Protocol::Ssl && self.secure_factory.is_none() {
            return Err(Error::Unsupported("no secure layer factory installed"));
        }
        let handler = Handler::Stream(Box::new(handler));
        let mut sock = Socket::new(proto, Role::Client, ConnState::Offline, Some(handler));
        sock.remote_port = port;

        if let Ok(ip) = host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, port);
            open_stream(
                &mut sock,
                addr,
                self.config.nodelay,
                self.secure_factory.as_ref(),
            )?;
            let id = self.insert(sock);
            self.register_or_remove(id)?;
            log::debug!("{id:?} connecting to {addr}");
            return Ok(id);
        }

        let id = self.insert(sock);
        let completion = Completion::Connect { socket: id, port };
        match self.dns.resolve(host, completion, &self.poller) {
            Ok(handle) => {
                if let Some(sock) = slot_mut(&mut self.sockets, id) {
                    sock.dns = Some(handle);
                }
                log::debug!("{id:?} resolving {host}");
                Ok(id)
            }
            Err(e) => {
                self.sockets.remove(id.slot());
                Err(e.into())
            }
        }
    }

    /// Takes over an already connected TCP stream. No `on_connected` is fired.
    pub fn adopt<H>(&mut self, stream: TcpStream, handler: H) -> Result<SocketId>
    where
        H: StreamHandler + 'static,
    {
        stream.set_nonblocking(true)?;
        let remote_port = stream.peer_addr().map(|a| a.port()).unwrap_or(0);
        let fd = RawSocket::from(stream);
        if self.config.nodelay {
            fd.set_nodelay(true)?;
        }

        let handler = Handler::Stream(Box::new(handler));
        let mut sock = Socket::new(Protocol::Tcp, Role::Client, ConnState::Online, Some(handler));
        sock.fd = Some(fd);
        sock.remote_port = remote_port;
        sock.established = true;
        let id = self.insert(sock);
        self.register_or_remove(id)?;
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Writing and shutdown
    // ---------------------------------------------------------------------

    /// Writes `data` without blocking.
    ///
    /// On an online socket with nothing queued the bytes go out immediately,
    /// and only what the descriptor did not take is queued. Otherwise the
    /// payload is queued behind the existing jobs. Fails with
    /// [`Error::NotWritable`] unless the socket is online or connecting.
    pub fn write(&mut self, id: SocketId, data: WriteData<'_>) -> Result<()> {
        let sock = writable_slot(&mut self.sockets, id)?;
        let direct = sock.state == ConnState::Online;
        let Some(fd) = sock.fd.as_ref() else {
            return Err(Error::NotWritable(sock.state));
        };
        let mut target = SocketTarget::new(fd, sock.secure.as_deref_mut(), sock.proto);
        if let Err(e) = sock.jobs.write(&mut self.jobs, &mut target, data, direct) {
            log::debug!("write on {id:?} failed: {e}");
            self.teardown(id);
            return Err(e.into());
        }
        self.update_interest(id);
        Ok(())
    }

    /// Queues `parts` as one vectored write, submitted with `writev(2)`.
    pub fn writev<'a, I>(&mut self, id: SocketId, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = WriteData<'a>>,
    {
        let sock = writable_slot(&mut self.sockets, id)?;
        let job = Job::vectored(parts);
        if job.is_done() {
            return Ok(());
        }
        let direct = sock.state == ConnState::Online && sock.jobs.is_empty();
        sock.jobs.push(&mut self.jobs, job);
        if !direct {
            self.update_interest(id);
            return Ok(());
        }
        if let Err(e) = self.drain_queue(id) {
            log::debug!("writev on {id:?} failed: {e}");
            self.teardown(id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Queues the whole file at `path`. It is sent with `sendfile(2)` where
    /// available, in chunks as the socket becomes writable.
    pub fn send_file(&mut self, id: SocketId, path: impl AsRef<Path>) -> Result<()> {
        writable_slot(&mut self.sockets, id)?;
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();

        let sock = writable_slot(&mut self.sockets, id)?;
        if len == 0 {
            return Ok(());
        }
        sock.jobs.push(
            &mut self.jobs,
            Job::File {
                file,
                offset: 0,
                remaining: len,
            },
        );
        log::debug!("{id:?} queued {} ({len} bytes)", path.as_ref().display());
        self.update_interest(id);
        Ok(())
    }

    /// Graceful close: queued jobs drain first, then the write side is shut
    /// down. Reads are still delivered until the peer closes, which takes the
    /// socket offline. No new writes are accepted afterwards.
    pub fn shutdown(&mut self, id: SocketId) -> Result<()> {
        let sock = slot_mut(&mut self.sockets, id).ok_or(Error::StaleSocket(id))?;
        match sock.state {
            ConnState::Pending => Ok(()),
            // Resolving, or already closing.
            ConnState::Offline => {
                self.teardown(id);
                Ok(())
            }
            _ if sock.is_listener() => {
                self.teardown(id);
                Ok(())
            }
            ConnState::Online if sock.established && sock.jobs.is_empty() => {
                self.half_close(id);
                Ok(())
            }
            ConnState::Online | ConnState::Progress => {
                sock.jobs.push(&mut self.jobs, Job::Shutdown);
                sock.state = ConnState::Pending;
                self.update_interest(id);
                Ok(())
            }
        }
    }

    /// Discards every queued job and closes at once.
    pub fn shutdown_now(&mut self, id: SocketId) -> Result<()> {
        let sock = slot_mut(&mut self.sockets, id).ok_or(Error::StaleSocket(id))?;
        let dropped = sock.jobs.clear(&mut self.jobs);
        if dropped > 0 {
            log::debug!("{id:?} dropped {dropped} queued jobs");
        }
        self.teardown(id);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    /// Resolves `host` to one IPv4 address.
    ///
    /// A numeric `host` calls `callback` right away and returns `None`.
    /// Otherwise a handle is returned and `callback` runs exactly once from a
    /// later [`poll`](Self::poll), unless the handle is invalidated first.
    pub fn resolve<F>(&mut self, host: &str, callback: F) -> Result<Option<ResolveHandle>>
    where
        F: FnOnce(&mut Engine, std::result::Result<IpAddr, DnsError>) + 'static,
    {
        if let Ok(ip) = host.parse::<IpAddr>() {
            callback(self, Ok(ip));
            return Ok(None);
        }
        let handle = self
            .dns
            .resolve(host, Completion::User(Box::new(callback)), &self.poller)?;
        Ok(Some(handle))
    }

    /// Suppresses the callback of `handle`. The lookup itself still runs to
    /// completion. Returns `false` if the handle already finished.
    pub fn invalidate(&mut self, handle: ResolveHandle) -> bool {
        self.dns.invalidate(handle)
    }

    // ---------------------------------------------------------------------
    // Loop
    // ---------------------------------------------------------------------

    /// Runs one loop iteration: waits up to `timeout` for readiness,
    /// dispatches it, then services the resolver. Returns the number of
    /// readiness events handled.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let resume = self
            .paused
            .iter()
            .map(|(_, at)| at.saturating_duration_since(now))
            .min();
        let wait = [timeout, self.dns.timeout(), resume]
            .into_iter()
            .flatten()
            .min();

        let mut ready = mem::take(&mut self.ready);
        ready.clear();
        let waited = self.poller.wait(&mut ready, wait);
        let n = match waited {
            Ok(n) => n,
            Err(e) => {
                self.ready = ready;
                return Err(e.into());
            }
        };
        for r in ready.iter() {
            self.dispatch(*r);
        }
        ready.clear();
        self.ready = ready;

        self.resume_accepts();
        self.dns.process_timeouts(&self.poller);
        self.deliver_resolutions();
        Ok(n)
    }

    /// Polls until [`stop`](Self::stop) is called from a callback.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        while self.running {
            self.poll(None)?;
        }
        Ok(())
    }

    /// Makes [`run`](Self::run) return after the current iteration.
    pub fn stop(&mut self) {
        self.running = false;
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    fn get(&self, id: SocketId) -> Result<&Socket> {
        self.sockets
            .get(id.slot())
            .filter(|s| s.generation == id.generation())
            .ok_or(Error::StaleSocket(id))
    }

    /// Connection state of `id`.
    pub fn state(&self, id: SocketId) -> Result<ConnState> {
        Ok(self.get(id)?.state)
    }

    /// Write flags of `id`.
    pub fn flags(&self, id: SocketId) -> Result<SocketFlags> {
        Ok(self.get(id)?.jobs.flags)
    }

    /// Full state record of `id`.
    pub fn states(&self, id: SocketId) -> Result<SocketStates> {
        Ok(self.get(id)?.states())
    }

    /// Protocol of `id`.
    pub fn protocol(&self, id: SocketId) -> Result<Protocol> {
        Ok(self.get(id)?.proto)
    }

    /// Role of `id`.
    pub fn role(&self, id: SocketId) -> Result<Role> {
        Ok(self.get(id)?.role)
    }

    /// Listener that accepted `id`, if any.
    pub fn parent(&self, id: SocketId) -> Result<Option<SocketId>> {
        Ok(self.get(id)?.parent)
    }

    /// Remote port: the peer's port for accepted sockets, the target port
    /// for client sockets.
    pub fn remote_port(&self, id: SocketId) -> Result<u16> {
        Ok(self.get(id)?.remote_port)
    }

    /// Local address of `id`.
    pub fn local_addr(&self, id: SocketId) -> Result<SocketAddr> {
        let sock = self.get(id)?;
        let fd = sock
            .fd
            .as_ref()
            .ok_or(io::Error::from(io::ErrorKind::NotConnected))?;
        sock_addr(fd.local_addr())
    }

    /// Peer address of `id`.
    pub fn peer_addr(&self, id: SocketId) -> Result<SocketAddr> {
        let sock = self.get(id)?;
        let fd = sock
            .fd
            .as_ref()
            .ok_or(io::Error::from(io::ErrorKind::NotConnected))?;
        sock_addr(fd.peer_addr())
    }

    /// Jobs waiting in the queue of `id`, including the one being drained.
    pub fn queued_jobs(&self, id: SocketId) -> Result<usize> {
        Ok(self.get(id)?.jobs.len())
    }

    /// Live sockets, listeners included.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Jobs checked out of the pool across all sockets.
    pub fn jobs_in_use(&self) -> usize {
        self.jobs.in_use()
    }

    /// Resolver sockets currently registered with the event loop.
    pub fn dns_sockets(&self) -> usize {
        self.dns.sockets()
    }

    /// Lookups started and not yet reclaimed.
    pub fn pending_resolutions(&self) -> usize {
        self.dns.pending()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn insert(&mut self, mut sock: Socket) -> SocketId {
        let entry = self.sockets.vacant_entry();
        let id = SocketId::with_generation(entry.key(), self.next_generation);
        self.next_generation = self.next_generation.wrapping_add(1);
        sock.generation = id.generation();
        entry.insert(sock);
        id
    }

    fn register(&mut self, id: SocketId) -> io::Result<()> {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return Ok(());
        };
        let Some(fd) = sock.raw_fd() else {
            return Ok(());
        };
        let interest = sock.wanted_interest();
        self.poller.register(fd, id.key(), interest)?;
        sock.interest = Some(interest);
        Ok(())
    }

    /// Registers a freshly inserted socket, or removes it again so that a
    /// failed construction leaves nothing behind.
    fn register_or_remove(&mut self, id: SocketId) -> Result<()> {
        if let Err(e) = self.register(id) {
            self.sockets.remove(id.slot());
            return Err(e.into());
        }
        Ok(())
    }

    fn update_interest(&mut self, id: SocketId) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        let (Some(fd), Some(current)) = (sock.raw_fd(), sock.interest) else {
            return;
        };
        let wanted = sock.wanted_interest();
        if wanted == current {
            return;
        }
        match self.poller.modify(fd, id.key(), wanted) {
            Ok(()) => sock.interest = Some(wanted),
            Err(e) => log::warn!("modify {id:?}: {e}"),
        }
    }

    /// Removes a socket without any callback.
    fn discard(&mut self, id: SocketId) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        if let (Some(fd), Some(_)) = (sock.raw_fd(), sock.interest.take())
            && let Err(e) = self.poller.deregister(fd)
        {
            log::debug!("deregister {id:?}: {e}");
        }
        sock.jobs.clear(&mut self.jobs);
        self.sockets.remove(id.slot());
    }

    /// Takes the socket offline and destroys it, firing `on_disconnect` once.
    ///
    /// While the socket's own handler is running the teardown is deferred
    /// until the callback returns.
    fn teardown(&mut self, id: SocketId) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        if sock.closing {
            return;
        }
        sock.state = ConnState::Offline;
        if sock.handler.is_none() {
            sock.doomed = true;
            return;
        }
        sock.closing = true;

        if let (Some(fd), Some(_)) = (sock.raw_fd(), sock.interest.take())
            && let Err(e) = self.poller.deregister(fd)
        {
            log::debug!("deregister {id:?}: {e}");
        }
        if let Some(handle) = sock.dns.take() {
            self.dns.invalidate(handle);
        }
        sock.jobs.clear(&mut self.jobs);

        match sock.handler.take() {
            Some(Handler::Accept(mut h)) => h.on_disconnect(self, id),
            Some(Handler::Stream(mut h)) => h.on_disconnect(self, id),
            None => {}
        }

        if slot_mut(&mut self.sockets, id).is_some() {
            let mut sock = self.sockets.remove(id.slot());
            sock.jobs.clear(&mut self.jobs);
        }
        log::debug!("{id:?} closed");
    }

    /// Puts a checked-out handler back, running a teardown requested meanwhile.
    fn restore(&mut self, id: SocketId, handler: Handler) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        sock.handler = Some(handler);
        if mem::take(&mut sock.doomed) {
            self.teardown(id);
        }
    }

    fn take_stream(&mut self, id: SocketId) -> Option<Box<dyn StreamHandler>> {
        let sock = slot_mut(&mut self.sockets, id)?;
        match sock.handler.take() {
            Some(Handler::Stream(h)) => Some(h),
            other => {
                sock.handler = other;
                None
            }
        }
    }

    fn with_stream(&mut self, id: SocketId, f: impl FnOnce(&mut dyn StreamHandler, &mut Engine)) {
        if let Some(mut h) = self.take_stream(id) {
            f(h.as_mut(), self);
            self.restore(id, Handler::Stream(h));
        }
    }

    fn dispatch(&mut self, r: Readiness) {
        if r.key & DNS_KEY_FLAG != 0 {
            self.dns.on_ready(r.key, r.readable, r.writable, &self.poller);
            return;
        }

        let id = SocketId(r.key as u64);
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        if sock.closing || sock.state == ConnState::Offline {
            return;
        }
        if sock.is_listener() {
            if r.readable {
                self.accept_all(id);
            }
            return;
        }
        if !sock.established {
            self.complete_connect(id, r.writable);
            return;
        }
        if r.writable {
            self.on_writable(id);
        }
        if r.readable {
            self.on_readable(id);
        }
    }

    fn accept_all(&mut self, lid: SocketId) {
        loop {
            let Some(listener) = slot_mut(&mut self.sockets, lid) else {
                return;
            };
            if listener.state == ConnState::Offline {
                return;
            }
            let proto = listener.proto;
            let Some(fd) = listener.fd.as_ref() else {
                return;
            };
            let (conn, addr) = match fd.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("accept on {lid:?} failed: {e}, pausing for {ACCEPT_BACKOFF:?}");
                    self.pause_accepts(lid, Instant::now() + ACCEPT_BACKOFF);
                    return;
                }
            };
            if let Err(e) = self.accept_one(lid, proto, conn, addr) {
                log::warn!("dropping connection accepted on {lid:?}: {e}");
            }
        }
    }

    /// Stops watching `lid` for connections until `until`.
    fn pause_accepts(&mut self, lid: SocketId, until: Instant) {
        let Some(listener) = slot_mut(&mut self.sockets, lid) else {
            return;
        };
        listener.accept_paused = true;
        self.paused.retain(|(id, _)| *id != lid);
        self.paused.push((lid, until));
        self.update_interest(lid);
    }

    fn resume_accepts(&mut self) {
        if self.paused.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.paused.drain(..).partition(|(_, at)| *at <= now);
        self.paused = waiting;
        for (lid, _) in due {
            if let Some(listener) = slot_mut(&mut self.sockets, lid) {
                listener.accept_paused = false;
                log::debug!("{lid:?} accepting again");
                self.update_interest(lid);
            }
        }
    }

    fn accept_one(
        &mut self,
        lid: SocketId,
        proto: Protocol,
        conn: RawSocket,
        addr: SockAddr,
    ) -> io::Result<()> {
        conn.set_nonblocking(true)?;
        if self.config.nodelay {
            conn.set_nodelay(true)?;
        }
        let peer = addr.as_socket();

        let mut sock = Socket::new(proto, Role::Client, ConnState::Online, None);
        sock.fd = Some(conn);
        sock.parent = Some(lid);
        sock.remote_port = peer.map(|a| a.port()).unwrap_or(0);
        sock.established = true;
        if proto == Protocol::Ssl {
            sock.secure = self.secure_factory.as_ref().map(|f| f(Role::Server));
        }
        let cid = self.insert(sock);
        if let Err(e) = self.register(cid) {
            self.sockets.remove(cid.slot());
            return Err(e);
        }
        match peer {
            Some(peer) => log::debug!("{lid:?} accepted {cid:?} from {peer}"),
            None => log::debug!("{lid:?} accepted {cid:?}"),
        }

        let taken = slot_mut(&mut self.sockets, lid).and_then(|l| l.handler.take());
        let mut acceptor = match taken {
            Some(Handler::Accept(acceptor)) => acceptor,
            other => {
                if let (Some(h), Some(l)) = (other, slot_mut(&mut self.sockets, lid)) {
                    l.handler = Some(h);
                }
                self.discard(cid);
                return Ok(());
            }
        };
        let handler = acceptor.on_connect(self, lid, cid);
        self.restore(cid, Handler::Stream(handler));
        self.restore(lid, Handler::Accept(acceptor));

        self.with_stream(cid, |h, engine| h.on_connected(engine, cid));
        Ok(())
    }

    /// Confirms (or fails) a connect in progress.
    fn complete_connect(&mut self, id: SocketId, writable: bool) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        let Some(fd) = sock.fd.as_ref() else {
            return;
        };
        match fd.take_error() {
            Ok(None) if !writable => return,
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                log::debug!("connect of {id:?} failed: {e}");
                self.teardown(id);
                return;
            }
        }

        sock.established = true;
        if sock.state == ConnState::Progress {
            sock.state = ConnState::Online;
        }
        log::debug!("{id:?} connected");
        self.update_interest(id);
        self.with_stream(id, |h, engine| h.on_connected(engine, id));

        let queued = slot_mut(&mut self.sockets, id).is_some_and(|s| !s.jobs.is_empty());
        if queued {
            self.on_writable(id);
        }
    }

    fn finish_connect(
        &mut self,
        id: SocketId,
        port: u16,
        result: std::result::Result<IpAddr, DnsError>,
    ) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        sock.dns = None;
        let opened = match result {
            Ok(ip) => open_stream(
                sock,
                SocketAddr::new(ip, port),
                self.config.nodelay,
                self.secure_factory.as_ref(),
            )
            .map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = opened.and_then(|()| self.register(id).map_err(Error::from)) {
            log::debug!("connect of {id:?} abandoned: {e}");
            self.teardown(id);
            return;
        }
        log::debug!("{id:?} connecting to port {port}");
    }

    fn deliver_resolutions(&mut self) {
        for (completion, result) in self.dns.take_finished() {
            match completion {
                Completion::Connect { socket, port } => self.finish_connect(socket, port, result),
                Completion::User(callback) => callback(self, result),
            }
        }
    }

    fn on_writable(&mut self, id: SocketId) {
        if let Err(e) = self.drain_queue(id) {
            log::debug!("write on {id:?} failed: {e}");
            self.teardown(id);
        }
    }

    /// Drains as much of the queue as the descriptor takes.
    fn drain_queue(&mut self, id: SocketId) -> io::Result<()> {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return Ok(());
        };
        if sock.half_closed || sock.jobs.is_empty() {
            self.update_interest(id);
            return Ok(());
        }
        let Some(fd) = sock.fd.as_ref() else {
            return Ok(());
        };
        let mut target = SocketTarget::new(fd, sock.secure.as_deref_mut(), sock.proto);
        let cork = self.config.cork && sock.proto == Protocol::Tcp;
        let outcome = sock
            .jobs
            .drain(&mut self.jobs, &mut target, cork, self.config.file_chunk)?;

        match outcome {
            Drain::Empty => self.update_interest(id),
            Drain::WouldBlock => {}
            Drain::Shutdown => {
                sock.jobs.clear(&mut self.jobs);
                self.half_close(id);
            }
        }
        Ok(())
    }

    /// Shuts down the write side. The socket stays readable until the peer's
    /// EOF takes it offline. Datagram sockets close right away.
    fn half_close(&mut self, id: SocketId) {
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        sock.state = ConnState::Pending;
        if sock.proto == Protocol::Udp {
            self.teardown(id);
            return;
        }
        let closed = match sock.fd.as_ref() {
            Some(fd) => {
                if let Some(layer) = sock.secure.as_mut()
                    && let Err(e) = layer.shutdown(fd)
                {
                    log::debug!("secure shutdown of {id:?}: {e}");
                }
                fd.shutdown(Shutdown::Write)
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        };
        match closed {
            Ok(()) => {
                sock.half_closed = true;
                log::debug!("{id:?} half-closed");
                self.update_interest(id);
            }
            Err(e) => {
                log::debug!("shutdown of {id:?} failed: {e}");
                self.teardown(id);
            }
        }
    }

    fn on_readable(&mut self, id: SocketId) {
        let chunk = self.config.read_chunk;
        let Some(sock) = slot_mut(&mut self.sockets, id) else {
            return;
        };
        let datagram = sock.proto == Protocol::Udp;
        let mut data = mem::take(&mut sock.data_in);
        let mut got = false;
        let mut eof = false;

        loop {
            let start = data.len();
            data.resize(start + chunk, 0);
            match sock.read(&mut data[start..]) {
                Ok(0) if !datagram => {
                    data.truncate(start);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    data.truncate(start + n);
                    got = true;
                    if n < chunk || datagram {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    data.truncate(start);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    data.truncate(start);
                }
                Err(e) => {
                    data.truncate(start);
                    log::debug!("read on {id:?} failed: {e}");
                    eof = true;
                    break;
                }
            }
        }

        if got && let Some(mut h) = self.take_stream(id) {
            h.on_read(self, id, &mut data);
            if let Some(sock) = slot_mut(&mut self.sockets, id) {
                sock.data_in = data;
            }
            self.restore(id, Handler::Stream(h));
        } else if let Some(sock) = slot_mut(&mut self.sockets, id) {
            sock.data_in = data;
        }

        if eof {
            log::debug!("{id:?} closed by peer");
            self.teardown(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Interest;
    use bytes::BytesMut;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Sink;

    impl StreamHandler for Sink {
        fn on_read(&mut self, _: &mut Engine, _: SocketId, data: &mut BytesMut) {
            data.clear();
        }
    }

    struct Counter(Rc<Cell<usize>>);

    impl AcceptHandler for Counter {
        fn on_connect(&mut self, _: &mut Engine, _: SocketId, _: SocketId) -> Box<dyn StreamHandler> {
            self.0.set(self.0.get() + 1);
            Box::new(Sink)
        }
    }

    #[test]
    fn test_paused_listener_resumes_accepting() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let accepted = Rc::new(Cell::new(0));
        let lid = engine
            .listen(Protocol::Tcp, 0, "127.0.0.1", Counter(accepted.clone()))
            .unwrap();
        let port = engine.local_addr(lid).unwrap().port();

        engine.pause_accepts(lid, Instant::now() + Duration::from_millis(50));
        assert_eq!(engine.sockets[lid.slot()].interest, Some(Interest::default()));
        let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        engine.poll(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(accepted.get(), 0);

        // The wait is bounded by the resume deadline.
        let started = Instant::now();
        while accepted.get() == 0 && started.elapsed() < Duration::from_secs(5) {
            engine.poll(Some(Duration::from_secs(1))).unwrap();
        }
        assert_eq!(accepted.get(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(engine.paused.is_empty());
        assert_eq!(engine.sockets[lid.slot()].interest, Some(Interest::READ));
    }

    #[test]
    fn test_stale_pause_is_dropped() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let lid = engine
            .listen(Protocol::Tcp, 0, "127.0.0.1", Counter(Rc::new(Cell::new(0))))
            .unwrap();
        engine.pause_accepts(lid, Instant::now());
        engine.shutdown(lid).unwrap();
        engine.poll(Some(Duration::ZERO)).unwrap();
        assert!(engine.paused.is_empty());
        assert_eq!(engine.socket_count(), 0);
    }
}
