//! Default resolver: IPv4 lookups over UDP against one nameserver.
//!
//! Each query gets its own connected, non-blocking UDP socket, so the socket
//! table of the bridge holds exactly one descriptor per outstanding lookup.
//! Names found in the hosts table are answered without touching the network.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use random_number::random;

use super::{ResolveHandle, Resolver, ResolverSink};
use crate::error::DnsError;

const DNS_PORT: u16 = 53;
const MAX_PACKET: usize = 512;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

struct Pending {
    socket: UdpSocket,
    query: ResolveHandle,
    id: u16,
    packet: Vec<u8>,
    sent: bool,
    deadline: Instant,
    attempts_left: u8,
}

/// Non-blocking stub resolver.
pub struct UdpResolver {
    nameserver: SocketAddr,
    timeout: Duration,
    attempts: u8,
    hosts: HashMap<String, Ipv4Addr>,
    pending: HashMap<RawFd, Pending>,
    /// Sockets announced as closed, dropped on the next call.
    retired: Vec<UdpSocket>,
}

impl UdpResolver {
    /// Resolver asking `nameserver`, with a 5 s timeout and 2 attempts.
    pub fn new(nameserver: SocketAddr) -> Self {
        Self {
            nameserver,
            timeout: Duration::from_secs(5),
            attempts: 2,
            hosts: HashMap::new(),
            pending: HashMap::new(),
            retired: Vec::new(),
        }
    }

    /// Resolver configured from `/etc/resolv.conf` and `/etc/hosts`.
    ///
    /// Falls back to `127.0.0.1:53` without a usable `nameserver` line.
    pub fn from_system() -> Self {
        let nameserver = fs::read_to_string("/etc/resolv.conf")
            .ok()
            .and_then(|text| parse_resolv_conf(&text))
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT));
        let hosts = fs::read_to_string("/etc/hosts")
            .map(|text| parse_hosts(&text))
            .unwrap_or_default();
        log::debug!("nameserver {nameserver}, {} hosts entries", hosts.len());
        Self::new(nameserver).with_hosts(hosts)
    }

    /// Sets the per-attempt timeout and the number of attempts per query.
    pub fn with_timeout(mut self, timeout: Duration, attempts: u8) -> Self {
        self.timeout = timeout;
        self.attempts = attempts.max(1);
        self
    }

    /// Replaces the static hosts table.
    pub fn with_hosts(mut self, hosts: HashMap<String, Ipv4Addr>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Adds one static entry.
    pub fn add_host(&mut self, name: &str, addr: Ipv4Addr) {
        self.hosts.insert(name.to_ascii_lowercase(), addr);
    }

    fn send(&mut self, fd: RawFd, sink: &mut ResolverSink) {
        let Some(p) = self.pending.get_mut(&fd) else {
            return;
        };
        match p.socket.send(&p.packet) {
            Ok(_) => {
                p.sent = true;
                sink.socket_state(fd, true, false);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                p.sent = false;
                sink.socket_state(fd, true, true);
            }
            Err(e) => self.finish(fd, Err(e.into()), sink),
        }
    }

    fn receive(&mut self, fd: RawFd, sink: &mut ResolverSink) {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let Some(p) = self.pending.get(&fd) else {
                return;
            };
            match p.socket.recv(&mut buf) {
                Ok(n) => {
                    let reply = &buf[..n];
                    if response_id(reply) != Some(p.id) {
                        log::debug!("ignoring stray DNS reply on fd {fd}");
                        continue;
                    }
                    let result = parse_response(reply);
                    self.finish(fd, result, sink);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.finish(fd, Err(e.into()), sink);
                    return;
                }
            }
        }
    }

    fn expire(&mut self, sink: &mut ResolverSink) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(fd, _)| *fd)
            .collect();

        for fd in expired {
            let Some(p) = self.pending.get_mut(&fd) else {
                continue;
            };
            if p.attempts_left == 0 {
                self.finish(fd, Err(DnsError::Timeout), sink);
                continue;
            }
            p.attempts_left -= 1;
            p.deadline = now + self.timeout;
            log::debug!("retrying DNS query {:#06x}", p.id);
            self.send(fd, sink);
        }
    }

    fn finish(&mut self, fd: RawFd, result: Result<Ipv4Addr, DnsError>, sink: &mut ResolverSink) {
        if let Some(p) = self.pending.remove(&fd) {
            sink.socket_state(fd, false, false);
            sink.answer(p.query, result.map(IpAddr::V4));
            self.retired.push(p.socket);
        }
    }
}

impl Resolver for UdpResolver {
    fn gethostbyname(
        &mut self,
        host: &str,
        query: ResolveHandle,
        sink: &mut ResolverSink,
    ) -> Result<(), DnsError> {
        self.retired.clear();

        let name = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(addr) = self.hosts.get(&name) {
            sink.answer(query, Ok(IpAddr::V4(*addr)));
            return Ok(());
        }

        let id: u16 = random!();
        let packet = build_query(id, &name)?;
        let local = match self.nameserver {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        socket.connect(self.nameserver)?;

        let fd = socket.as_raw_fd();
        self.pending.insert(
            fd,
            Pending {
                socket,
                query,
                id,
                packet,
                sent: false,
                deadline: Instant::now() + self.timeout,
                attempts_left: self.attempts.saturating_sub(1),
            },
        );
        self.send(fd, sink);
        Ok(())
    }

    fn process_fd(
        &mut self,
        readable: Option<RawFd>,
        writable: Option<RawFd>,
        sink: &mut ResolverSink,
    ) {
        self.retired.clear();

        if let Some(fd) = writable
            && self.pending.get(&fd).is_some_and(|p| !p.sent)
        {
            self.send(fd, sink);
        }
        if let Some(fd) = readable {
            self.receive(fd, sink);
        }
        if readable.is_none() && writable.is_none() {
            self.expire(sink);
        }
    }

    fn timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.pending
            .values()
            .map(|p| p.deadline.saturating_duration_since(now))
            .min()
    }
}

/// First `nameserver` entry of a `resolv.conf` text.
pub fn parse_resolv_conf(text: &str) -> Option<SocketAddr> {
    text.lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => words.next()?.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .next()
}

/// IPv4 entries of a hosts file, keyed by lowercased name.
pub fn parse_hosts(text: &str) -> HashMap<String, Ipv4Addr> {
    let mut hosts = HashMap::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut words = line.split_whitespace();
        let Some(Ok(addr)) = words.next().map(str::parse::<Ipv4Addr>) else {
            continue;
        };
        for name in words {
            hosts.entry(name.to_ascii_lowercase()).or_insert(addr);
        }
    }
    hosts
}

/// Encodes a recursive A/IN query for `host`.
pub(crate) fn build_query(id: u16, host: &str) -> Result<Vec<u8>, DnsError> {
    if host.is_empty() || host.len() > 253 {
        return Err(DnsError::BadName(host.to_owned()));
    }

    let mut packet = Vec::with_capacity(18 + host.len());
    packet.extend_from_slice(&id.to_be_bytes());
    // RD
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, no other sections
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::BadName(host.to_owned()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

fn response_id(buf: &[u8]) -> Option<u16> {
    (buf.len() >= 2).then(|| u16::from_be_bytes([buf[0], buf[1]]))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DnsError> {
    match buf.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DnsError::BadResponse),
    }
}

/// Position right after the (possibly compressed) name at `pos`.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    loop {
        let len = *buf.get(pos).ok_or(DnsError::BadResponse)? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => pos += 1 + len,
            // Pointer ends the name.
            0xC0 if pos + 1 < buf.len() => return Ok(pos + 2),
            _ => return Err(DnsError::BadResponse),
        }
    }
}

/// Extracts the first A record of a response.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Ipv4Addr, DnsError> {
    if buf.len() < 12 || buf[2] & 0x80 == 0 {
        return Err(DnsError::BadResponse);
    }
    match buf[3] & 0x0F {
        0 => {}
        3 => return Err(DnsError::NotFound),
        rcode => return Err(DnsError::ServerFailure(rcode)),
    }

    let questions = read_u16(buf, 4)?;
    let answers = read_u16(buf, 6)?;

    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(buf, pos)? + 4;
    }
    for _ in 0..answers {
        pos = skip_name(buf, pos)?;
        let rtype = read_u16(buf, pos)?;
        let class = read_u16(buf, pos + 2)?;
        let rdlen = read_u16(buf, pos + 8)? as usize;
        pos += 10;
        let rdata = buf.get(pos..pos + rdlen).ok_or(DnsError::BadResponse)?;
        if rtype == TYPE_A && class == CLASS_IN && rdlen == 4 {
            return Ok(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        pos += rdlen;
    }
    Err(DnsError::NoData)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reply to `query` carrying `records` as (type, rdata), names compressed
    /// to the question.
    fn reply(query: &[u8], rcode: u8, records: &[(u16, &[u8])]) -> Vec<u8> {
        let mut out = query.to_vec();
        out[2] |= 0x80;
        out[3] = 0x80 | rcode;
        out[6..8].copy_from_slice(&(records.len() as u16).to_be_bytes());
        for (rtype, rdata) in records {
            out.extend_from_slice(&[0xC0, 0x0C]);
            out.extend_from_slice(&rtype.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&60u32.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(rdata);
        }
        out
    }

    #[test]
    fn test_query_layout() {
        let q = build_query(0xBEEF, "a.bc").unwrap();
        assert_eq!(
            q,
            [
                0xBE, 0xEF, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, //
                1, b'a', 2, b'b', b'c', 0, //
                0, 1, 0, 1,
            ]
        );
    }

    #[test]
    fn test_bad_names_rejected() {
        assert!(matches!(build_query(1, ""), Err(DnsError::BadName(_))));
        assert!(matches!(build_query(1, "a..b"), Err(DnsError::BadName(_))));
        let long = "x".repeat(64);
        assert!(matches!(build_query(1, &long), Err(DnsError::BadName(_))));
    }

    #[test]
    fn test_answer_after_cname() {
        let q = build_query(7, "www.example.test").unwrap();
        let cname = [3, b'w', b'e', b'b', 0xC0, 0x10];
        let r = reply(&q, 0, &[(5, &cname), (TYPE_A, &[192, 0, 2, 10])]);
        assert_eq!(response_id(&r), Some(7));
        assert_eq!(parse_response(&r).unwrap(), Ipv4Addr::new(192, 0, 2, 10));
    }

    #[test]
    fn test_error_codes() {
        let q = build_query(9, "missing.test").unwrap();
        assert!(matches!(parse_response(&reply(&q, 3, &[])), Err(DnsError::NotFound)));
        assert!(matches!(
            parse_response(&reply(&q, 2, &[])),
            Err(DnsError::ServerFailure(2))
        ));
        assert!(matches!(parse_response(&reply(&q, 0, &[])), Err(DnsError::NoData)));
    }

    #[test]
    fn test_malformed_responses() {
        let q = build_query(9, "example.test").unwrap();
        // a query is not a response
        assert!(matches!(parse_response(&q), Err(DnsError::BadResponse)));

        let r = reply(&q, 0, &[(TYPE_A, &[10, 0, 0, 1])]);
        assert!(matches!(
            parse_response(&r[..r.len() - 2]),
            Err(DnsError::BadResponse)
        ));
        assert!(matches!(parse_response(&r[..5]), Err(DnsError::BadResponse)));
    }

    #[test]
    fn test_resolv_conf() {
        let text = "# generated\nsearch lan\nnameserver fe80::1%eth0\nnameserver 10.0.0.53 ; primary\nnameserver 8.8.8.8\n";
        assert_eq!(parse_resolv_conf(text), Some("10.0.0.53:53".parse().unwrap()));
        assert_eq!(parse_resolv_conf("search lan\n"), None);
    }

    #[test]
    fn test_hosts_file() {
        let text = "127.0.0.1 localhost Loopback # comment\n::1 localhost ip6-localhost\n\n10.1.2.3 db.internal\n127.0.1.1 localhost\n";
        let hosts = parse_hosts(text);
        assert_eq!(hosts.get("localhost"), Some(&Ipv4Addr::LOCALHOST));
        assert_eq!(hosts.get("loopback"), Some(&Ipv4Addr::LOCALHOST));
        assert_eq!(hosts.get("db.internal"), Some(&Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!hosts.contains_key("ip6-localhost"));
    }

    #[test]
    fn test_hosts_entry_answers_without_socket() {
        let mut resolver = UdpResolver::new("127.0.0.1:53".parse().unwrap());
        resolver.add_host("Cache.Local", Ipv4Addr::new(10, 9, 8, 7));
        let mut sink = ResolverSink::default();
        let handle = ResolveHandle::new(0, 0);

        resolver.gethostbyname("cache.local.", handle, &mut sink).unwrap();
        assert!(sink.sockets.is_empty());
        assert_eq!(sink.answers.len(), 1);
        assert!(resolver.timeout().is_none());
    }

    #[test]
    fn test_lookup_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = UdpResolver::new(server.local_addr().unwrap());
        let mut sink = ResolverSink::default();
        let handle = ResolveHandle::new(3, 1);

        resolver.gethostbyname("svc.test", handle, &mut sink).unwrap();
        assert_eq!(sink.sockets.len(), 1);
        let fd = sink.sockets[0].fd;
        assert!(sink.sockets[0].readable);

        let mut buf = [0u8; MAX_PACKET];
        let (n, peer) = server.recv_from(&mut buf).unwrap();
        let answer = reply(&buf[..n], 0, &[(TYPE_A, &[198, 51, 100, 4])]);
        server.send_to(&answer, peer).unwrap();

        let mut sink = ResolverSink::default();
        let start = Instant::now();
        while sink.answers.is_empty() && start.elapsed() < Duration::from_secs(2) {
            resolver.process_fd(Some(fd), None, &mut sink);
        }
        assert_eq!(sink.answers.len(), 1);
        assert_eq!(sink.answers[0].0, handle);
        assert!(matches!(sink.answers[0].1, Ok(IpAddr::V4(ip)) if ip == Ipv4Addr::new(198, 51, 100, 4)));
        assert_eq!(sink.sockets.last().map(|s| (s.readable, s.writable)), Some((false, false)));
    }

    #[test]
    fn test_timeout_after_attempts() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = UdpResolver::new(server.local_addr().unwrap())
            .with_timeout(Duration::from_millis(1), 2);
        let mut sink = ResolverSink::default();
        resolver.gethostbyname("slow.test", ResolveHandle::new(0, 0), &mut sink).unwrap();

        let start = Instant::now();
        while sink.answers.is_empty() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(2));
            resolver.process_fd(None, None, &mut sink);
        }
        assert!(matches!(sink.answers[0].1, Err(DnsError::Timeout)));

        // one send per attempt
        server.set_nonblocking(true).unwrap();
        let mut buf = [0u8; MAX_PACKET];
        let mut seen = 0;
        while server.recv_from(&mut buf).is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }
}
