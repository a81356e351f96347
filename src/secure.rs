//! Plug-in points for an encrypted transport.
//!
//! The engine does not implement TLS. A socket created with
//! [`Protocol::Ssl`](crate::Protocol::Ssl) gets a [`SecureLayer`] from the
//! factory installed with
//! [`Engine::set_secure_factory`](crate::Engine::set_secure_factory), and all
//! of its reads and writes go through that layer instead of the descriptor.

use std::io;

use crate::socket::Role;

/// Record layer sitting between a socket descriptor and the application.
///
/// Both calls follow non-blocking semantics: return
/// `ErrorKind::WouldBlock` when the descriptor cannot make progress, and
/// `Ok(0)` from [`read`](Self::read) when the peer has closed.
pub trait SecureLayer {
    /// Reads decrypted application data.
    fn read(&mut self, sock: &socket2::Socket, buf: &mut [u8]) -> io::Result<usize>;

    /// Encrypts and sends application data, returning how many plaintext
    /// bytes were consumed.
    fn write(&mut self, sock: &socket2::Socket, buf: &[u8]) -> io::Result<usize>;

    /// Called once before a graceful close.
    fn shutdown(&mut self, _sock: &socket2::Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Builds the layer for a new SSL socket.
pub type SecureFactory = Box<dyn Fn(Role) -> Box<dyn SecureLayer>>;
