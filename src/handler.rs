//! Application callbacks.
//!
//! A socket carries exactly one capability object: listeners an
//! [`AcceptHandler`], connected or connecting sockets a [`StreamHandler`].
//! Every callback receives the engine, so handlers can write, connect, or
//! shut down any socket, including their own, from inside the callback.

use bytes::BytesMut;

use crate::engine::Engine;
use crate::socket::SocketId;

/// Callbacks of a stream (connecting, connected or accepted) socket.
pub trait StreamHandler {
    /// The connection is established: a client connect completed, or an
    /// accepted socket was handed over by its listener.
    fn on_connected(&mut self, _engine: &mut Engine, _socket: SocketId) {}

    /// New bytes arrived.
    ///
    /// `data` holds everything read during this readiness event, preceded by
    /// whatever an earlier call left in it. Consume what you handle with
    /// `split_to`/`advance`/`clear`; the rest is kept for the next call.
    fn on_read(&mut self, engine: &mut Engine, socket: SocketId, data: &mut BytesMut);

    /// The socket went offline. Called exactly once, as the last callback.
    fn on_disconnect(&mut self, _engine: &mut Engine, _socket: SocketId) {}
}

/// Callbacks of a listening socket.
pub trait AcceptHandler {
    /// A connection was accepted as `client`.
    ///
    /// The returned handler is installed on `client`, and its
    /// [`on_connected`](StreamHandler::on_connected) runs right after.
    /// If `client` is closed from inside this call, the returned handler gets
    /// only [`on_disconnect`](StreamHandler::on_disconnect), once it is
    /// installed, and `on_connected` is skipped.
    fn on_connect(
        &mut self,
        engine: &mut Engine,
        listener: SocketId,
        client: SocketId,
    ) -> Box<dyn StreamHandler>;

    /// The listener was closed.
    fn on_disconnect(&mut self, _engine: &mut Engine, _listener: SocketId) {}
}
