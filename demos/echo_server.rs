use bytes::BytesMut;
use readysock::{AcceptHandler, Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};
use tracing::{debug, info};
use tracing_subscriber::filter::EnvFilter;

struct Echo;

impl StreamHandler for Echo {
    fn on_connected(&mut self, engine: &mut Engine, socket: SocketId) {
        info!("{socket:?} connected from port {:?}", engine.remote_port(socket));
    }

    fn on_read(&mut self, engine: &mut Engine, socket: SocketId, data: &mut BytesMut) {
        debug!("{socket:?} read {} bytes", data.len());
        let bytes = data.split().freeze();
        if let Err(e) = engine.write(socket, WriteData::AutoRelease(bytes)) {
            info!("{socket:?} write rejected: {e}");
        }
    }

    fn on_disconnect(&mut self, _engine: &mut Engine, socket: SocketId) {
        info!("{socket:?} disconnected");
    }
}

struct Acceptor;

impl AcceptHandler for Acceptor {
    fn on_connect(&mut self, _engine: &mut Engine, _listener: SocketId, _client: SocketId) -> Box<dyn StreamHandler> {
        Box::new(Echo)
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

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    println!("Starting echo server on 127.0.0.1:7890");
    let mut engine = Engine::new(EngineConfig::default())?;
    engine.listen(Protocol::Tcp, 7890, "127.0.0.1", Acceptor)?;
    engine.run()
}
