//! Error types for the socket engine.

use std::io;
use thiserror::Error;

use crate::socket::{ConnState, SocketId};

/// Error type for engine operations.
///
/// Only synchronous failures are reported through this type. Conditions that
/// end a connection after it was established (peer closed, reset, failed
/// connect, failed resolution) are delivered through
/// [`StreamHandler::on_disconnect`](crate::StreamHandler::on_disconnect).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the kernel
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket was destroyed, or the id belongs to a reused slot
    #[error("socket {0:?} does not exist")]
    StaleSocket(SocketId),

    /// The socket does not accept new writes in its current state
    #[error("socket is {0:?}, writes are not accepted")]
    NotWritable(ConnState),

    /// The local or remote address could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The operation is not available for this socket or configuration
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A resolution request was rejected
    #[error("resolution failed: {0}")]
    Dns(#[from] DnsError),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a hostname resolution failed.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The name does not exist (NXDOMAIN)
    #[error("host not found")]
    NotFound,

    /// The name exists but has no IPv4 address
    #[error("no address record")]
    NoData,

    /// The nameserver answered with a failure code
    #[error("server failure (rcode {0})")]
    ServerFailure(u8),

    /// No answer arrived within the configured attempts
    #[error("query timed out")]
    Timeout,

    /// The hostname cannot be encoded as a DNS name
    #[error("malformed hostname: {0}")]
    BadName(String),

    /// The answer could not be parsed
    #[error("malformed response")]
    BadResponse,

    /// The resolver socket table is full
    #[error("too many concurrent resolutions (limit {0})")]
    Capacity(usize),

    /// Resolver socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
