//! # riptide-ws: event-driven HTTP/1.1 + WebSocket server core
//!
//! A non-blocking socket polling engine multiplexing thousands of long-lived
//! TCP (or Unix-domain) connections over a small pool of OS threads, with an
//! HTTP/1.1 front that upgrades qualifying connections to RFC 6455
//! WebSockets and carries framed traffic between application sessions and
//! remote peers.
//!
//! ## Architecture
//!
//! - **Poller** ([`poll`]): readiness facility (epoll/kqueue via mio) or a
//!   bounded `poll(2)` snapshot facility, behind one trait
//! - **Multiplexer** ([`multiplex`]): thread-safe pending-event queue with
//!   deferred subscription handling where the facility needs it
//! - **Engine** ([`engine`]): per-connection read/write drains and callback
//!   dispatch under a two-sided locking discipline
//! - **Registry** ([`registry`]): monotonic 31-bit handles, generation
//!   tagged slots, O(log n) handle lookup
//! - **Protocol** ([`frame`], [`protocol`], [`handshake`]): RFC 6455
//!   framing, fragmentation, close handshake, heartbeats, subprotocol
//!   negotiation
//! - **Server** ([`server`]): accept loop, reader/writer thread pool,
//!   broadcast and the outgoing gathering drain
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use riptide_ws::prelude::*;
//!
//! struct Echo;
//!
//! impl SubProtocol for Echo {
//!     fn name(&self) -> &str {
//!         ""
//!     }
//!     fn create_session(&self) -> Box<dyn WsSession> {
//!         Box::new(EchoSession)
//!     }
//! }
//!
//! struct EchoSession;
//!
//! impl WsSession for EchoSession {
//!     fn on_frame(&mut self, ctx: &mut WsContext<'_>, msg: Message) {
//!         match msg {
//!             Message::Text(_) | Message::Binary(_) => {
//!                 ctx.send_message(msg);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//!
//! let mut protocols = ProtocolRegistry::new();
//! protocols.register(Arc::new(Echo));
//! let server = Server::bind("127.0.0.1:9001", Config::default(), protocols, None).unwrap();
//! server.start().unwrap();
//! ```

pub mod conn;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod lock;
pub mod mask;
pub mod multiplex;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod socket;
pub mod tls;
pub mod utf8;

pub use conn::{ConnHandler, Connection, Verdict, WsPhase};
pub use engine::{Engine, EngineOptions};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use http::{HttpRequest, HttpResponse, RequestHandler};
pub use protocol::{Message, ProtocolRegistry, SubProtocol, WsContext, WsSession};
pub use registry::{Handle, Registry};
pub use server::Server;

use std::sync::Arc;

use tls::TlsLayer;

/// Configuration knobs, all optional
///
/// # Example
///
/// ```
/// use riptide_ws::Config;
///
/// let config = Config::builder()
///     .heartbeat_delay_ms(10_000)
///     .thread_pool_count(4)
///     .max_frame_size(1024 * 1024)
///     .build();
/// ```
#[derive(Clone)]
pub struct Config {
    /// Idle delay before the server pings a WebSocket connection
    /// (default 20 s; 0 disables heartbeats)
    pub heartbeat_delay_ms: u64,
    /// Unanswered heartbeats tolerated before dropping the connection
    /// (default 5)
    pub disconnect_after_invalid_heartbeat_count: u32,
    /// 0 (the default) disables Nagle on accepted sockets
    pub send_delay_ms: u64,
    /// Writer-lock deadline for responses produced inside callbacks
    /// (default 30 s)
    pub callback_answer_timeout_ms: u64,
    /// HTTP keep-alive window (default 30 s)
    pub keep_alive_timeout_ms: u64,
    /// Reader threads (default: CPU count)
    pub thread_pool_count: usize,
    /// Fold the writer thread's duties into the readers
    pub no_write_thread: bool,
    /// Never send directly; always queue and wait for writability
    pub write_poll_only: bool,
    /// Deferred unsubscribes close their socket (snapshot facility)
    pub unsubscribe_closes_socket: bool,
    /// Idle-callback threshold when heartbeats are disabled
    /// (default 0 = disabled)
    pub last_operation_idle_seconds: u32,
    /// Idle delay before shrinking a connection's buffers (default 60 s;
    /// 0 disables)
    pub last_operation_release_memory_seconds: u32,
    /// Per-connection cap on queued outgoing frames
    /// (default None = application-limited)
    pub max_outgoing_queue_per_connection: Option<usize>,
    /// Largest accepted frame payload (default 16 MB)
    pub max_frame_size: usize,
    /// Largest assembled message (default 64 MB)
    pub max_message_size: usize,
    /// Poller wait bound for the worker threads (default 30 s)
    pub poll_timeout_ms: u64,
    /// Allow several listeners on one port
    pub reuse_port: bool,
    /// Opt-in TLS collaborator
    pub tls: Option<Arc<dyn TlsLayer>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_delay_ms: 20_000,
            disconnect_after_invalid_heartbeat_count: 5,
            send_delay_ms: 0,
            callback_answer_timeout_ms: 30_000,
            keep_alive_timeout_ms: 30_000,
            thread_pool_count: num_cpus::get(),
            no_write_thread: false,
            write_poll_only: false,
            unsubscribe_closes_socket: false,
            last_operation_idle_seconds: 0,
            last_operation_release_memory_seconds: 60,
            max_outgoing_queue_per_connection: None,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            poll_timeout_ms: 30_000,
            reuse_port: false,
            tls: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("heartbeat_delay_ms", &self.heartbeat_delay_ms)
            .field(
                "disconnect_after_invalid_heartbeat_count",
                &self.disconnect_after_invalid_heartbeat_count,
            )
            .field("thread_pool_count", &self.thread_pool_count)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Start building a configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Builder seeded with the defaults
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Heartbeat delay in milliseconds (0 disables)
    pub fn heartbeat_delay_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_delay_ms = ms;
        self
    }

    /// Unanswered heartbeats tolerated before dropping a connection
    pub fn disconnect_after_invalid_heartbeat_count(mut self, count: u32) -> Self {
        self.config.disconnect_after_invalid_heartbeat_count = count;
        self
    }

    /// Nagle delay; 0 sets `TCP_NODELAY`
    pub fn send_delay_ms(mut self, ms: u64) -> Self {
        self.config.send_delay_ms = ms;
        self
    }

    /// Writer-lock deadline for callback-produced answers
    pub fn callback_answer_timeout_ms(mut self, ms: u64) -> Self {
        self.config.callback_answer_timeout_ms = ms;
        self
    }

    /// HTTP keep-alive window
    pub fn keep_alive_timeout_ms(mut self, ms: u64) -> Self {
        self.config.keep_alive_timeout_ms = ms;
        self
    }

    /// Reader thread count
    pub fn thread_pool_count(mut self, count: usize) -> Self {
        self.config.thread_pool_count = count;
        self
    }

    /// Fold writer duties into the reader threads
    pub fn no_write_thread(mut self, fold: bool) -> Self {
        self.config.no_write_thread = fold;
        self
    }

    /// Queue every write instead of attempting direct sends
    pub fn write_poll_only(mut self, enabled: bool) -> Self {
        self.config.write_poll_only = enabled;
        self
    }

    /// Deferred unsubscribes close their socket
    pub fn unsubscribe_closes_socket(mut self, enabled: bool) -> Self {
        self.config.unsubscribe_closes_socket = enabled;
        self
    }

    /// Idle-callback threshold when heartbeats are off
    pub fn last_operation_idle_seconds(mut self, secs: u32) -> Self {
        self.config.last_operation_idle_seconds = secs;
        self
    }

    /// Idle delay before buffer shrinking (0 disables)
    pub fn last_operation_release_memory_seconds(mut self, secs: u32) -> Self {
        self.config.last_operation_release_memory_seconds = secs;
        self
    }

    /// Cap the per-connection outgoing frame queue
    pub fn max_outgoing_queue_per_connection(mut self, cap: Option<usize>) -> Self {
        self.config.max_outgoing_queue_per_connection = cap;
        self
    }

    /// Largest accepted frame payload
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Largest assembled message
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Poller wait bound for worker threads
    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    /// Allow several listeners on one port
    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.config.reuse_port = enabled;
        self
    }

    /// Install a TLS collaborator
    pub fn tls(mut self, tls: Arc<dyn TlsLayer>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Finish the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude for server applications
pub mod prelude {
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::http::{HttpRequest, HttpResponse, RequestHandler};
    pub use crate::protocol::{Message, ProtocolRegistry, SubProtocol, WsContext, WsSession};
    pub use crate::registry::Handle;
    pub use crate::server::Server;
    pub use crate::Config;
}
