//! HTTP → WebSocket upgrade handshake
//!
//! Validates the upgrade request, negotiates the subprotocol against the
//! registered list and produces the `101 Switching Protocols` response with
//! the computed `Sec-WebSocket-Accept` value.

use std::sync::Arc;

use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::http::HttpRequest;
use crate::protocol::{ProtocolRegistry, SubProtocol};

/// RFC 6455 handshake GUID
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept`: base64(SHA1(key ++ GUID))
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// A validated, negotiated upgrade ready to be acknowledged
pub struct Upgrade {
    /// Factory for the per-connection session
    pub protocol: Arc<dyn SubProtocol>,
    /// Negotiated name; None for the unnamed default
    pub protocol_name: Option<String>,
    /// Extensions the subprotocol accepted from the client's offer
    pub extensions: Option<String>,
    /// The complete 101 response
    pub response: Bytes,
}

/// Validate an upgrade request and select a subprotocol
///
/// The first registered subprotocol whose name appears in the client's
/// comma-separated `Sec-WebSocket-Protocol` list wins; with no match (or no
/// list) an unnamed default protocol is used when registered, otherwise the
/// handshake fails and the caller answers 400.
pub fn negotiate(req: &HttpRequest, protocols: &ProtocolRegistry) -> Result<Upgrade> {
    if !req.method.eq_ignore_ascii_case("GET") {
        return Err(Error::HandshakeFailed("method must be GET"));
    }
    if !req.is_upgrade() {
        return Err(Error::HandshakeFailed("missing upgrade headers"));
    }
    let key = req
        .header("sec-websocket-key")
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
    if key.len() != 24 {
        return Err(Error::HandshakeFailed("malformed Sec-WebSocket-Key"));
    }
    match req.header("sec-websocket-version") {
        Some("13") => {}
        _ => return Err(Error::HandshakeFailed("unsupported WebSocket version")),
    }

    let requested = req.header("sec-websocket-protocol");
    let protocol = protocols
        .select(requested)
        .ok_or(Error::HandshakeFailed("no matching subprotocol"))?
        .clone();
    let protocol_name = if protocol.name().is_empty() {
        None
    } else {
        Some(protocol.name().to_string())
    };

    // The core does not implement extensions; the subprotocol may opt in
    // to a subset of the client's offer, which is echoed back
    let extensions = req
        .header("sec-websocket-extensions")
        .and_then(|offered| protocol.accept_extensions(offered));

    let response = build_response(
        &accept_key(key),
        protocol_name.as_deref(),
        extensions.as_deref(),
    );
    Ok(Upgrade {
        protocol,
        protocol_name,
        extensions,
        response,
    })
}

/// Build the 101 response
pub fn build_response(accept: &str, protocol: Option<&str>, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(192);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n");
    if let Some(name) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a client upgrade request (tests and client helpers)
pub fn build_request(host: &str, path: &str, key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nHost: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\nSec-WebSocket-Version: 13\r\n");
    if let Some(name) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}
