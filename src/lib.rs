//! # readysock - Non-blocking Socket Engine
//!
//! readysock turns a level-triggered readiness loop into socket lifecycle
//! callbacks. Applications never see a partial write or a would-block error:
//! whatever a descriptor cannot take right away is queued as a job and
//! drained, in order, every time the descriptor becomes writable again.
//!
//! ## Key Features
//!
//! - **Callback driven**: accept, connect, read and disconnect are delivered
//!   through the [`AcceptHandler`] and [`StreamHandler`] traits
//! - **Ordered job queue**: buffered writes, vectored writes, file transfers
//!   and shutdown requests share one FIFO per socket
//! - **Explicit buffer ownership**: every write says who owns its bytes
//!   through [`WriteData`], so nothing is freed twice or copied needlessly
//! - **Zero-copy file transfer**: `sendfile(2)` with a read + write fallback,
//!   corked with `TCP_CORK` while several jobs drain
//! - **Hostname connects**: lookups run through an asynchronous [`Resolver`]
//!   whose sockets live in the same event loop
//! - **Pluggable TLS**: SSL sockets route their I/O through a [`SecureLayer`]
//!
//! ## How It Works
//!
//! An [`Engine`] owns every socket, addressed by a generation-checked
//! [`SocketId`]. Each call to [`Engine::poll`] waits for readiness, then:
//! listeners accept until the backlog is empty, connecting sockets complete
//! their connect, writable sockets drain their queue, and readable sockets
//! read until the kernel runs dry before calling `on_read` once. Resolver
//! answers are delivered at the end of the iteration.
//!
//! ```text
//!   offline ──connect──> progress ──writable──> online ──shutdown──> pending
//!      ^                     │                    │                     │
//!      └──── error / EOF / shutdown_now ──────────┴─────────────────────┘
//! ```
//!
//! ## Basic Usage
//!
//! ### Echo Server
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use readysock::{AcceptHandler, Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};
//!
//! struct Echo;
//!
//! impl StreamHandler for Echo {
//!     fn on_read(&mut self, engine: &mut Engine, socket: SocketId, data: &mut BytesMut) {
//!         let bytes = data.split().freeze();
//!         let _ = engine.write(socket, WriteData::AutoRelease(bytes));
//!     }
//! }
//!
//! struct Acceptor;
//!
//! impl AcceptHandler for Acceptor {
//!     fn on_connect(&mut self, _: &mut Engine, _: SocketId, _: SocketId) -> Box<dyn StreamHandler> {
//!         Box::new(Echo)
//!     }
//! }
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.listen(Protocol::Tcp, 7000, "127.0.0.1", Acceptor)?;
//! engine.run()?;
//! # Ok::<(), readysock::Error>(())
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use readysock::{Engine, EngineConfig, Protocol, SocketId, StreamHandler, WriteData};
//!
//! struct Hello;
//!
//! impl StreamHandler for Hello {
//!     fn on_connected(&mut self, engine: &mut Engine, socket: SocketId) {
//!         let _ = engine.write(socket, WriteData::GlobalStatic(b"hello\n"));
//!         let _ = engine.shutdown(socket);
//!     }
//!
//!     fn on_read(&mut self, _: &mut Engine, _: SocketId, data: &mut BytesMut) {
//!         println!("{}", String::from_utf8_lossy(data));
//!         data.clear();
//!     }
//!
//!     fn on_disconnect(&mut self, engine: &mut Engine, _: SocketId) {
//!         engine.stop();
//!     }
//! }
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.connect(Protocol::Tcp, 7000, "localhost", Hello)?;
//! engine.run()?;
//! # Ok::<(), readysock::Error>(())
//! ```
//!
//! ## Configuration
//!
//! Tunables such as the listen backlog, the read chunk size or the ceiling on
//! concurrent resolver sockets live in [`EngineConfig`].
//!
//! ## Performance Considerations
//!
//! - A write on an idle online socket goes straight to the kernel; only the
//!   remainder is queued
//! - `WriteData::Static` copies only what is left over after the first
//!   attempt, `GlobalStatic` and `AutoRelease` never copy
//! - Jobs live in a pooled arena, so steady-state queueing does not allocate
//!   job slots

#![warn(missing_docs)]

mod config;
pub mod dns;
mod engine;
mod error;
pub mod event_loop;
mod handler;
mod job;
mod pool;
mod queue;
mod secure;
mod socket;
mod sys;

pub use config::{DEFAULT_BACKLOG, EngineConfig};
pub use dns::{ResolveHandle, Resolver, ResolverSink, SocketState, UdpResolver};
pub use engine::Engine;
pub use error::{DnsError, Error, Result};
pub use event_loop::{EventLoop, Interest, Readiness};
pub use handler::{AcceptHandler, StreamHandler};
pub use job::WriteData;
pub use secure::{SecureFactory, SecureLayer};
pub use socket::{ConnState, Protocol, Role, SocketFlags, SocketId, SocketStates};
