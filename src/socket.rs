//! Socket identity, state record and the per-socket data the engine keeps.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use bytes::BytesMut;

use crate::dns::ResolveHandle;
use crate::event_loop::Interest;
use crate::handler::{AcceptHandler, StreamHandler};
use crate::queue::{JobQueue, WriteTarget};
use crate::secure::SecureLayer;
use crate::sys;

/// Generations are kept below the top bit so that socket keys never collide
/// with resolver keys in the event loop.
const GENERATION_MASK: u32 = 0x7FFF_FFFF;

/// Opaque socket identifier.
///
/// Encodes both a slot index and a generation counter, so an id kept after
/// its socket was destroyed is rejected instead of reaching the socket that
/// reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

impl SocketId {
    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self((((generation & GENERATION_MASK) as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    #[inline]
    pub(crate) fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Event loop key for this socket.
    #[inline]
    pub(crate) fn key(&self) -> usize {
        self.0 as usize
    }

    /// Raw value, suitable as a map key.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not connected: waiting for resolution, or closed.
    Offline,
    /// Non-blocking connect issued, waiting for the descriptor to become writable.
    Progress,
    /// Graceful shutdown requested; queued jobs still drain.
    Pending,
    /// Connected (or listening).
    Online,
}

/// Transport protocol chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP stream.
    Tcp,
    /// UDP datagrams.
    Udp,
    /// TCP stream through a [`SecureLayer`].
    Ssl,
}

/// Which side of a connection a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listening (or bound UDP) endpoint.
    Server,
    /// Connecting, connected or accepted endpoint.
    Client,
}

/// Transient write flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketFlags {
    /// The last write attempt hit a full descriptor.
    pub would_block: bool,
    /// `TCP_CORK` is currently set.
    pub cork: bool,
}

/// Snapshot of a socket's state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketStates {
    /// Write flags.
    pub flags: SocketFlags,
    /// Protocol.
    pub proto: Protocol,
    /// Role.
    pub role: Role,
    /// Connection state.
    pub state: ConnState,
}

/// Capability object of a socket. Listeners accept, streams read and write.
pub(crate) enum Handler {
    Accept(Box<dyn AcceptHandler>),
    Stream(Box<dyn StreamHandler>),
}

pub(crate) struct Socket {
    pub(crate) fd: Option<socket2::Socket>,
    pub(crate) generation: u32,
    pub(crate) data_in: BytesMut,
    pub(crate) jobs: JobQueue,
    pub(crate) parent: Option<SocketId>,
    /// `None` while the handler is running a callback.
    pub(crate) handler: Option<Handler>,
    pub(crate) proto: Protocol,
    pub(crate) role: Role,
    pub(crate) state: ConnState,
    pub(crate) remote_port: u16,
    pub(crate) secure: Option<Box<dyn SecureLayer>>,
    pub(crate) dns: Option<ResolveHandle>,
    /// Interest currently registered, `None` when not registered.
    pub(crate) interest: Option<Interest>,
    /// Teardown was requested while the handler was checked out.
    pub(crate) doomed: bool,
    /// Teardown is running; `on_disconnect` has been or is being called.
    pub(crate) closing: bool,
    /// The write side was shut down; reads continue until EOF.
    pub(crate) half_closed: bool,
    /// The connection is up: accepted, adopted, bound, or a connect was
    /// confirmed writable.
    pub(crate) established: bool,
    /// Accepting is suspended after a hard `accept(2)` failure.
    pub(crate) accept_paused: bool,
}

impl Socket {
    pub(crate) fn new(
        proto: Protocol,
        role: Role,
        state: ConnState,
        handler: Option<Handler>,
    ) -> Self {
        Self {
            fd: None,
            generation: 0,
            data_in: BytesMut::new(),
            jobs: JobQueue::default(),
            parent: None,
            handler,
            proto,
            role,
            state,
            remote_port: 0,
            secure: None,
            dns: None,
            interest: None,
            doomed: false,
            closing: false,
            half_closed: false,
            established: false,
            accept_paused: false,
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn states(&self) -> SocketStates {
        SocketStates {
            flags: self.jobs.flags,
            proto: self.proto,
            role: self.role,
            state: self.state,
        }
    }

    pub(crate) fn is_listener(&self) -> bool {
        self.role == Role::Server && self.proto != Protocol::Udp
    }

    /// Interest the socket needs in its current state.
    pub(crate) fn wanted_interest(&self) -> Interest {
        if self.is_listener() {
            if self.accept_paused {
                return Interest::default();
            }
            return Interest::READ;
        }
        let writable = match self.state {
            ConnState::Offline => false,
            _ if !self.established => true,
            _ => !self.jobs.is_empty() && !self.half_closed,
        };
        Interest {
            readable: true,
            writable,
        }
    }

    /// Reads through the secure layer when there is one.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match self.secure.as_mut() {
            Some(layer) => layer.read(fd, buf),
            None => {
                let mut fd: &socket2::Socket = fd;
                fd.read(buf)
            }
        }
    }
}

/// Writes queued jobs to a socket descriptor.
pub(crate) struct SocketTarget<'a> {
    fd: &'a socket2::Socket,
    secure: Option<&'a mut (dyn SecureLayer + 'static)>,
    cork: bool,
}

impl<'a> SocketTarget<'a> {
    pub(crate) fn new(
        fd: &'a socket2::Socket,
        secure: Option<&'a mut (dyn SecureLayer + 'static)>,
        proto: Protocol,
    ) -> Self {
        Self {
            fd,
            secure,
            cork: proto == Protocol::Tcp,
        }
    }
}

impl WriteTarget for SocketTarget<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.secure.as_mut() {
            Some(layer) => layer.write(self.fd, buf),
            None => {
                let mut fd = self.fd;
                fd.write(buf)
            }
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.secure.as_mut() {
            // Records are sealed one buffer at a time.
            Some(layer) => match bufs.iter().find(|b| !b.is_empty()) {
                Some(b) => layer.write(self.fd, b),
                None => Ok(0),
            },
            None => {
                let mut fd = self.fd;
                fd.write_vectored(bufs)
            }
        }
    }

    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        if self.secure.is_some() {
            return Err(io::ErrorKind::Unsupported.into());
        }
        sys::sendfile(self.fd.as_raw_fd(), file, offset, len)
    }

    fn set_cork(&mut self, cork: bool) {
        if !self.cork {
            return;
        }
        if let Err(e) = sys::set_cork(self.fd.as_raw_fd(), cork) {
            log::debug!("TCP_CORK={cork} failed: {e}");
        }
    }
}
