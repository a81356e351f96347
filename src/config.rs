//! Engine configuration.

use std::time::Duration;

/// Listen backlog used when none is configured.
pub const DEFAULT_BACKLOG: i32 = 511;

/// Tunables for an [`Engine`](crate::Engine).
///
/// All setters consume and return the config so they can be chained:
///
/// ```rust
/// use readysock::EngineConfig;
///
/// let config = EngineConfig::default()
///     .backlog(1024)
///     .read_chunk(16 * 1024)
///     .max_dns_sockets(64);
/// assert_eq!(config.backlog, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backlog passed to `listen(2)`.
    pub backlog: i32,
    /// Bytes requested per `read(2)` while draining a readable socket.
    pub read_chunk: usize,
    /// Capacity of the readiness event buffer.
    pub events_capacity: usize,
    /// Ceiling on resolver sockets registered with the event loop at once.
    pub max_dns_sockets: usize,
    /// Set `TCP_CORK` while draining more than one queued job.
    pub cork: bool,
    /// Chunk size for the read + write file transfer fallback.
    pub file_chunk: usize,
    /// Set `TCP_NODELAY` on connected and accepted sockets.
    pub nodelay: bool,
    /// Per-attempt timeout of the default resolver.
    pub dns_timeout: Duration,
    /// Attempts per query of the default resolver.
    pub dns_attempts: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            read_chunk: 4096,
            events_capacity: 1024,
            max_dns_sockets: 32,
            cork: true,
            file_chunk: 16 * 1024,
            nodelay: false,
            dns_timeout: Duration::from_secs(5),
            dns_attempts: 2,
        }
    }
}

impl EngineConfig {
    /// Set the listen backlog.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the read chunk size.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    /// Set the readiness event buffer capacity.
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    /// Set the resolver socket ceiling.
    pub fn max_dns_sockets(mut self, max: usize) -> Self {
        self.max_dns_sockets = max;
        self
    }

    /// Enable or disable corking of batched writes.
    pub fn cork(mut self, cork: bool) -> Self {
        self.cork = cork;
        self
    }

    /// Set the file transfer fallback chunk size.
    pub fn file_chunk(mut self, bytes: usize) -> Self {
        self.file_chunk = bytes.max(1);
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the default resolver's per-attempt timeout.
    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Set the default resolver's attempts per query.
    pub fn dns_attempts(mut self, attempts: u8) -> Self {
        self.dns_attempts = attempts.max(1);
        self
    }
}
