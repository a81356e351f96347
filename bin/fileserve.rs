use bytes::BytesMut;
use clap::Parser;
use readysock::{AcceptHandler, Engine, EngineConfig, Protocol, SocketId, StreamHandler};
use std::{path::PathBuf, time::Instant};
use tracing_subscriber::filter::EnvFilter;

struct Transfer {
    cid: usize,
    path: PathBuf,
    start: Instant,
}

impl StreamHandler for Transfer {
    fn on_connected(&mut self, engine: &mut Engine, socket: SocketId) {
        self.start = Instant::now();
        if let Err(e) = engine.send_file(socket, &self.path) {
            println!("[{}]: cannot send {}: {e}", self.cid, self.path.display());
        }
        let _ = engine.shutdown(socket);
    }

    fn on_read(&mut self, _engine: &mut Engine, _socket: SocketId, data: &mut BytesMut) {
        data.clear();
    }

    fn on_disconnect(&mut self, _engine: &mut Engine, _socket: SocketId) {
        println!("[{}]: done in {:?}", self.cid, self.start.elapsed());
    }
}

struct Server {
    sid: usize,
    path: PathBuf,
}

impl AcceptHandler for Server {
    fn on_connect(&mut self, engine: &mut Engine, _listener: SocketId, client: SocketId) -> Box<dyn StreamHandler> {
        if let Ok(addr) = engine.peer_addr(client) {
            println!("Accepted connection from: {addr}");
        }
        let cid = self.sid;
        self.sid += 1;
        Box::new(Transfer {
            cid,
            path: self.path.clone(),
            start: Instant::now(),
        })
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
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    let config = EngineConfig::default()
        .backlog(args.backlog)
        .cork(!args.no_cork);
    let mut engine = Engine::new(config)?;
    let listener = engine.listen(
        Protocol::Tcp,
        args.port,
        &args.ip,
        Server { sid: 0, path: args.file },
    )?;
    println!("Serving on {}", engine.local_addr(listener)?);
    engine.run()
}

/// Sends one file to every client that connects, then closes
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The file to serve
    #[arg(short, long)]
    file: PathBuf,
    /// The local address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    ip: String,
    /// The port to listen on
    #[arg(short, long, default_value = "7891")]
    port: u16,
    /// The listen backlog
    #[arg(short, long, default_value = "511")]
    backlog: i32,
    /// Do not cork while several jobs drain
    #[arg(long)]
    no_cork: bool,
}
