#![allow(dead_code)]

use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use readysock::{AcceptHandler, Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};

#[derive(Debug, Default)]
pub struct Log {
    pub connected: usize,
    pub disconnected: usize,
    pub reads: usize,
    pub data: Vec<u8>,
}

pub type Shared = Rc<RefCell<Log>>;

pub fn shared() -> Shared {
    Rc::new(RefCell::new(Log::default()))
}

/// Records every callback and consumes everything it reads.
pub struct Recorder(pub Shared);

impl StreamHandler for Recorder {
    fn on_connected(&mut self, _engine: &mut Engine, _socket: SocketId) {
        self.0.borrow_mut().connected += 1;
    }

    fn on_read(&mut self, _engine: &mut Engine, _socket: SocketId, data: &mut BytesMut) {
        let mut log = self.0.borrow_mut();
        log.reads += 1;
        log.data.extend_from_slice(data);
        data.clear();
    }

    fn on_disconnect(&mut self, _engine: &mut Engine, _socket: SocketId) {
        self.0.borrow_mut().disconnected += 1;
    }
}

/// Writes back whatever it reads.
pub struct Echo;

impl StreamHandler for Echo {
    fn on_read(&mut self, engine: &mut Engine, socket: SocketId, data: &mut BytesMut) {
        let bytes = data.split().freeze();
        engine.write(socket, WriteData::AutoRelease(bytes)).unwrap();
    }
}

/// Builds the stream handler of each accepted socket with a closure.
pub struct Spawn<F>(pub F);

impl<F> AcceptHandler for Spawn<F>
where
    F: FnMut(&mut Engine, SocketId) -> Box<dyn StreamHandler>,
{
    fn on_connect(&mut self, engine: &mut Engine, _listener: SocketId, client: SocketId) -> Box<dyn StreamHandler> {
        (self.0)(engine, client)
    }
}

pub fn acceptor<F>(f: F) -> Spawn<F>
where
    F: FnMut(&mut Engine, SocketId) -> Box<dyn StreamHandler>,
{
    Spawn(f)
}

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

/// Listens on an ephemeral loopback port.
pub fn listen(engine: &mut Engine, proto: Protocol, acceptor: impl AcceptHandler + 'static) -> (SocketId, u16) {
    let id = engine.listen(proto, 0, "127.0.0.1", acceptor).unwrap();
    let port = engine.local_addr(id).unwrap().port();
    (id, port)
}

/// Polls until `done` holds, giving up after five seconds.
pub fn pump(engine: &mut Engine, mut done: impl FnMut(&Engine) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(engine) {
        if Instant::now() > deadline {
            return false;
        }
        engine.poll(Some(Duration::from_millis(10))).unwrap();
    }
    true
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// How the fake nameserver answers.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Address([u8; 4]),
    NxDomain,
    Silent,
}

/// Single-threaded nameserver answering every A query the same way. It exits
/// after two idle seconds.
pub fn nameserver(reply: Reply) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            let query = &buf[..n];
            let answer = match reply {
                Reply::Address(ip) => respond(query, 0, Some(ip)),
                Reply::NxDomain => respond(query, 3, None),
                Reply::Silent => continue,
            };
            let _ = socket.send_to(&answer, peer);
        }
    });
    addr
}

fn respond(query: &[u8], rcode: u8, ip: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = query.to_vec();
    out[2] |= 0x80;
    out[3] = 0x80 | rcode;
    if let Some(ip) = ip {
        out[7] = 1;
        out.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
        out.extend_from_slice(&ip);
    }
    out
}
