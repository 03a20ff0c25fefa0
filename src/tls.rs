//! TLS collaborator interface
//!
//! The core does not ship cryptography. When a [`TlsLayer`] is installed,
//! the engine routes every read and write through it instead of hitting the
//! socket directly; everything else (polling, locking, framing) is
//! unchanged.

use crate::error::Result;
use crate::socket::{NetResult, Socket};

/// Opt-in TLS provider plugged into the engine
pub trait TlsLayer: Send + Sync {
    /// Client-side: wrap an established connection (SNI via `server_name`)
    fn after_connection(&self, sock: Socket, server_name: &str) -> Result<()>;

    /// Server-side: attach certificates to a bound listener context
    fn after_bind(&self, sock: Socket) -> Result<()>;

    /// Server-side: run the handshake on an accepted socket; returns the
    /// negotiated cipher description
    fn after_accept(&self, sock: Socket) -> Result<String>;

    /// Read decrypted bytes; same contract as [`Socket::recv`]
    fn receive(&self, sock: Socket, buf: &mut [u8]) -> (NetResult, usize);

    /// Write bytes for encryption; same contract as [`Socket::send`]
    fn send(&self, sock: Socket, buf: &[u8]) -> (NetResult, usize);
}
