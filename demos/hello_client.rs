use bytes::BytesMut;
use clap::Parser;
use readysock::{Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};
use std::time::Duration;
use tracing_subscriber::filter::EnvFilter;

struct Hello {
    rounds: usize,
    size: usize,
}

impl Hello {
    fn send(&mut self, engine: &mut Engine, socket: SocketId) {
        let buf: Vec<u8> = (0..self.size).map(|i| (i % 255) as u8).collect();
        match engine.write(socket, WriteData::Own(buf)) {
            Ok(()) => println!("Queued {} bytes", self.size),
            Err(e) => println!("Write failed: {e}"),
        }
    }
}

impl StreamHandler for Hello {
    fn on_connected(&mut self, engine: &mut Engine, socket: SocketId) {
        println!("Connected successfully");
        self.send(engine, socket);
    }

    fn on_read(&mut self, engine: &mut Engine, socket: SocketId, data: &mut BytesMut) {
        println!("Received {} bytes back", data.len());
        data.clear();
        self.rounds = self.rounds.saturating_sub(1);
        if self.rounds == 0 {
            let _ = engine.shutdown(socket);
        } else {
            self.send(engine, socket);
        }
    }

    fn on_disconnect(&mut self, engine: &mut Engine, _socket: SocketId) {
        println!("Disconnected");
        engine.stop();
    }
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
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    println!("Connecting to {}:{}", args.host, args.port);
    let config = EngineConfig::default().dns_timeout(Duration::from_secs(args.timeout));
    let mut engine = Engine::new(config)?;
    engine.connect(
        Protocol::Tcp,
        args.port,
        &args.host,
        Hello {
            rounds: args.rounds,
            size: args.size,
        },
    )?;
    engine.run()
}

/// A simple client talking to the echo server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server host name or address
    #[arg(long, default_value = "localhost")]
    host: String,
    /// The server port
    #[arg(short, long, default_value = "7890")]
    port: u16,
    /// The write buffer size
    #[arg(short, long, default_value = "64")]
    size: usize,
    /// Number of round trips
    #[arg(short, long, default_value = "3")]
    rounds: usize,
    /// Resolver timeout in seconds
    #[arg(short, long, default_value = "5")]
    timeout: u64,
}
