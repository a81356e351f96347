use bytes::{Bytes, BytesMut};
use clap::Parser;
use readysock::{AcceptHandler, Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};
use std::{cell::Cell, rc::Rc, time::{Duration, Instant}};
use tracing_subscriber::filter::EnvFilter;

struct Writer {
    closed: Rc<Cell<bool>>,
}

impl StreamHandler for Writer {
    fn on_connected(&mut self, engine: &mut Engine, socket: SocketId) {
        match engine.peer_addr(socket) {
            Ok(addr) => println!("Connected successfully to {addr}"),
            Err(_) => println!("Connected successfully"),
        }
    }

    fn on_read(&mut self, _engine: &mut Engine, _socket: SocketId, data: &mut BytesMut) {
        data.clear();
    }

    fn on_disconnect(&mut self, _engine: &mut Engine, _socket: SocketId) {
        println!("Connection closed by remote peer");
        self.closed.set(true);
    }
}

fn run_client_mode(args: Args) -> readysock::Result<()> {
    let (host, port) = split_addr(&args.addr)?;
    let mut engine = Engine::new(config(&args))?;
    let closed = Rc::new(Cell::new(false));
    let socket = engine.connect(Protocol::Tcp, port, host, Writer { closed: closed.clone() })?;

    let buf = Bytes::from(vec![42u8; args.size]);
    while !closed.get() {
        engine.poll(Some(Duration::from_millis(1)))?;
        if closed.get() {
            break;
        }
        // Keep a few buffers queued so the socket never idles between polls.
        while engine.queued_jobs(socket)? < args.depth {
            engine.write(socket, WriteData::AutoRelease(buf.clone()))?;
        }
    }
    Ok(())
}

struct Meter {
    cid: usize,
    start: Instant,
    total_recv: usize,
    sampling_period: Duration,
}

impl StreamHandler for Meter {
    fn on_read(&mut self, _engine: &mut Engine, _socket: SocketId, data: &mut BytesMut) {
        self.total_recv += data.len();
        data.clear();

        let delta = self.start.elapsed();
        if delta >= self.sampling_period {
            let throughput = ((self.total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
            println!("[{}]: {throughput} Mbps", self.cid);
            self.start = Instant::now();
            self.total_recv = 0;
        }
    }

    fn on_disconnect(&mut self, _engine: &mut Engine, _socket: SocketId) {
        println!("[{}]: Socket close from remote party...", self.cid);
    }
}

struct Acceptor {
    sid: usize,
    period: u64,
}

impl AcceptHandler for Acceptor {
    fn on_connect(&mut self, engine: &mut Engine, _listener: SocketId, client: SocketId) -> Box<dyn StreamHandler> {
        if let Ok(addr) = engine.peer_addr(client) {
            println!("Accepted connection from: {addr}");
        }
        let cid = self.sid;
        self.sid += 1;
        Box::new(Meter {
            cid,
            start: Instant::now(),
            total_recv: 0,
            sampling_period: Duration::from_secs(self.period),
        })
    }
}

fn run_server_mode(args: Args) -> readysock::Result<()> {
    let (host, port) = split_addr(&args.addr)?;
    let mut engine = Engine::new(config(&args))?;
    engine.listen(Protocol::Tcp, port, host, Acceptor { sid: 0, period: args.period })?;
    engine.run()
}

fn config(args: &Args) -> EngineConfig {
    EngineConfig::default()
        .read_chunk(args.size)
        .nodelay(args.nodelay)
}

fn split_addr(addr: &str) -> readysock::Result<(&str, u16)> {
    let invalid = || readysock::Error::InvalidAddress(addr.to_owned());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> readysock::Result<()> {
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if args.client {
        run_client_mode(args)
    } else {
        run_server_mode(args)
    }
}

/// Throughput benchmark for the readysock engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <host:port> to listen or connect, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The read and write buffer size
    #[arg(short, long, default_value = "65536")]
    size: usize,
    /// Buffers kept queued by the client
    #[arg(short, long, default_value = "4")]
    depth: usize,
    /// Disable Nagle's algorithm
    #[arg(short, long)]
    nodelay: bool,
    /// The sampling period
    #[arg(short, long, default_value = "1")]
    period: u64,
}
