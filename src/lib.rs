//! # ws-engine: single-threaded WebSocket server engine
//!
//! Accepts TCP connections, performs the RFC 6455 upgrade and exchanges
//! frames with every peer from one dedicated I/O thread. The embedding
//! application sees three events (new connection, message, disconnect) and
//! drives the server through a thread-safe handle.
//!
//! ## Execution model
//!
//! - **One I/O thread**: a current-thread tokio runtime with a `LocalSet`
//!   runs the accept loop, every socket operation and every state change
//! - **Commands, not locks**: [`ServerHandle`] methods only post commands
//!   to the I/O thread, so connection state is never shared
//! - **One read, one write**: each connection keeps exactly one read in
//!   flight while open and at most one write, with a FIFO send queue
//! - **Deferred destruction**: a closed connection is released only once
//!   its in-flight operations have reported back
//!
//! ## Example
//!
//! ```no_run
//! use ws_engine::{Config, Event, Server, ServerHandle};
//!
//! let server = Server::bind(
//!     "127.0.0.1:9001".parse().unwrap(),
//!     Config::default(),
//!     |server: &ServerHandle, event: Event| {
//!         if let Event::Message { id, payload, binary } = event {
//!             server.send(id, payload, binary);
//!         }
//!     },
//! )?;
//!
//! // ... later
//! drop(server); // stops and joins the I/O thread
//! # Ok::<(), ws_engine::Error>(())
//! ```

pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod orchestrator;
pub mod registry;
pub mod server;

use std::time::Duration;

pub use error::{Error, Result};
pub use event::{DisconnectReason, Event, EventHandler, EventKind};
pub use frame::{Frame, FrameError, FrameReceiver, OpCode, ServerFrame};
pub use handshake::{Handshake, HandshakeStatus, Rfc6455Handshake};
pub use registry::ConnectionId;
pub use server::{Server, ServerHandle};

/// Default initial capacity of a connection's decode buffer
pub const RECV_BUFFER_SIZE: usize = 4 * 1024;

/// Largest single reservation made for one socket read
pub const MAX_READ_CHUNK: usize = 64 * 1024;

/// Small message threshold (< 126 bytes uses 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Server configuration
///
/// # Example
///
/// ```
/// use ws_engine::Config;
///
/// let config = Config::builder()
///     .max_frame_size(1024 * 1024)
///     .max_backpressure(8 * 1024 * 1024)
///     .handshake_timeout(5)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload of a received frame (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum queued outbound bytes per connection before it is dropped
    /// (default: 0 = unbounded)
    pub max_backpressure: usize,
    /// Handshake timeout in seconds (default: 10, 0 = disabled)
    pub handshake_timeout: u32,
    /// Maximum size of the HTTP upgrade request head (default: 8KB)
    pub max_handshake_size: usize,
    /// Initial decode buffer capacity per connection (default: 4KB)
    pub read_buffer_size: usize,
    /// Set TCP_NODELAY on accepted sockets (default: true)
    pub nodelay: bool,
    /// Listen backlog (default: 1024)
    pub backlog: i32,
    /// Name of the I/O thread (default: "ws-engine-io")
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_backpressure: 0,
            handshake_timeout: 10,
            max_handshake_size: 8 * 1024,
            read_buffer_size: RECV_BUFFER_SIZE,
            nodelay: true,
            backlog: 1024,
            thread_name: "ws-engine-io".to_string(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Handshake timeout, `None` when disabled
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout > 0).then(|| Duration::from_secs(self.handshake_timeout as u64))
    }
}

/// Builder for server configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum received frame payload
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum queued outbound bytes per connection (0 = unbounded)
    pub fn max_backpressure(mut self, bytes: usize) -> Self {
        self.config.max_backpressure = bytes;
        self
    }

    /// Set handshake timeout in seconds (0 = disabled)
    pub fn handshake_timeout(mut self, seconds: u32) -> Self {
        self.config.handshake_timeout = seconds;
        self
    }

    /// Set maximum upgrade request size
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Set initial decode buffer capacity
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    /// Set listen backlog
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Set the I/O thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{Error, Result};
    pub use crate::event::{DisconnectReason, Event, EventHandler};
    pub use crate::registry::ConnectionId;
    pub use crate::server::{Server, ServerHandle};
}
