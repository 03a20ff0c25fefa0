//! WebSocket protocol state
//!
//! Everything above raw framing: message assembly from fragments, control
//! frame handling (ping/pong/close handshake), the per-connection session
//! driven by a negotiated subprotocol, and the helpers that serialize
//! outgoing frames through the engine.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::conn::{Connection, WsPhase};
use crate::engine::Engine;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{encode_frame, Frame, FrameReader, OpCode, Step};
use crate::registry::Handle;
use crate::utf8::{validate_utf8, validate_utf8_partial};

/// A complete message, possibly reassembled from fragments
#[derive(Debug, Clone)]
pub enum Message {
    /// UTF-8 validated text
    Text(Bytes),
    /// Binary payload
    Binary(Bytes),
    /// Ping (already answered by the core)
    Ping(Bytes),
    /// Pong
    Pong(Bytes),
    /// Close, with the peer's reason when present
    Close(Option<CloseReason>),
}

impl Message {
    /// Text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Payload bytes regardless of kind
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Text content, when this is a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            // Text payloads were validated during assembly
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The frame that carries this message
    pub fn to_frame(&self) -> Frame {
        match self {
            Message::Text(b) => Frame::text(b.clone()),
            Message::Binary(b) => Frame::binary(b.clone()),
            Message::Ping(b) => Frame::ping(b.clone()),
            Message::Pong(b) => Frame::pong(b.clone()),
            Message::Close(Some(r)) => Frame::close(r.code, &r.reason),
            Message::Close(None) => Frame::close_empty(),
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

/// A registered application protocol carried inside WebSocket frames
///
/// The registry owns the factories; each upgraded connection gets its own
/// session instance and owns it exclusively.
pub trait SubProtocol: Send + Sync {
    /// Negotiation name; empty string registers the unnamed default
    fn name(&self) -> &str;

    /// New per-connection session
    fn create_session(&self) -> Box<dyn WsSession>;

    /// Offered `Sec-WebSocket-Extensions`; return the accepted subset to
    /// echo, or None to ignore extensions entirely
    fn accept_extensions(&self, _offered: &str) -> Option<String> {
        None
    }
}

/// Subprotocol list handed to the server constructor
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn SubProtocol>>,
}

impl ProtocolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            protocols: Vec::new(),
        }
    }

    /// Append a protocol; registration order decides negotiation priority
    pub fn register(&mut self, protocol: Arc<dyn SubProtocol>) {
        self.protocols.push(protocol);
    }

    /// No protocols registered
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// First registered protocol whose name appears in the client's CSV
    /// list; the unnamed default when nothing matches
    pub fn select(&self, requested: Option<&str>) -> Option<&Arc<dyn SubProtocol>> {
        if let Some(csv) = requested {
            for protocol in &self.protocols {
                if protocol.name().is_empty() {
                    continue;
                }
                if csv
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(protocol.name()))
                {
                    return Some(protocol);
                }
            }
        }
        self.protocols.iter().find(|p| p.name().is_empty())
    }
}

/// What a session sees while one of its callbacks runs
pub struct WsContext<'a> {
    engine: &'a Engine,
    conn: &'a Arc<Connection>,
    timeout_ms: u64,
}

impl<'a> WsContext<'a> {
    pub(crate) fn new(engine: &'a Engine, conn: &'a Arc<Connection>, timeout_ms: u64) -> Self {
        Self {
            engine,
            conn,
            timeout_ms,
        }
    }

    /// This connection's handle
    pub fn handle(&self) -> Handle {
        self.conn.handle()
    }

    /// Peer address
    pub fn remote(&self) -> &str {
        self.conn.remote()
    }

    /// Serialize and send a frame directly; the calling thread is the one
    /// draining this connection, so no queueing is needed
    pub fn send(&self, frame: Frame) -> bool {
        send_frame(self.engine, self.conn, &frame, self.timeout_ms)
    }

    /// Convenience for sending a data message
    pub fn send_message(&self, msg: impl Into<Message>) -> bool {
        self.send(msg.into().to_frame())
    }

    /// Start the close handshake
    pub fn close(&self, code: u16, reason: &str) -> bool {
        send_frame(self.engine, self.conn, &Frame::close(code, reason), self.timeout_ms)
    }
}

/// Per-connection application session
///
/// Created by the negotiated [`SubProtocol`] at upgrade time and destroyed
/// with the connection.
pub trait WsSession: Send {
    /// The 101 response has been sent; `protocol` is the negotiated name
    fn on_upgraded(&mut self, _protocol: &str) {}

    /// The connection is in the `Run` phase and may be written to
    fn on_connect(&mut self, _ctx: &mut WsContext<'_>) {}

    /// A complete message arrived
    fn on_frame(&mut self, ctx: &mut WsContext<'_>, msg: Message);

    /// The connection is going away
    fn on_disconnect(&mut self) {}
}

/// Fragmentation and validation state for inbound data frames
pub struct MessageAssembler {
    fragment_opcode: Option<OpCode>,
    fragment_buf: BytesMut,
    max_message_size: usize,
}

impl MessageAssembler {
    /// Assembler enforcing a total message size cap
    pub fn new(max_message_size: usize) -> Self {
        Self {
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed one data frame; returns a message once a FIN frame completes it
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment_opcode.is_some() {
                    return Err(Error::Protocol("data frame during fragmented message"));
                }
                if frame.fin {
                    return Self::complete(frame.opcode, frame.payload);
                }
                if frame.payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                if frame.opcode == OpCode::Text && !validate_utf8_partial(&frame.payload) {
                    return Err(Error::InvalidUtf8);
                }
                self.fragment_opcode = Some(frame.opcode);
                self.fragment_buf.clear();
                self.fragment_buf.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let opcode = self
                    .fragment_opcode
                    .ok_or(Error::Protocol("continuation without a message"))?;
                if self.fragment_buf.len() + frame.payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                self.fragment_buf.extend_from_slice(&frame.payload);
                if !frame.fin {
                    if opcode == OpCode::Text && !validate_utf8_partial(&self.fragment_buf) {
                        return Err(Error::InvalidUtf8);
                    }
                    return Ok(None);
                }
                self.fragment_opcode = None;
                let payload = self.fragment_buf.split().freeze();
                Self::complete(opcode, payload)
            }
            _ => Err(Error::Protocol("control frame fed to assembler")),
        }
    }

    fn complete(opcode: OpCode, payload: Bytes) -> Result<Option<Message>> {
        match opcode {
            OpCode::Text => {
                if !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Some(Message::Text(payload)))
            }
            OpCode::Binary => Ok(Some(Message::Binary(payload))),
            _ => Err(Error::Protocol("bad assembly opcode")),
        }
    }
}

/// Per-connection WebSocket state installed at upgrade time
pub struct WsState {
    reader: FrameReader,
    assembler: MessageAssembler,
    session: Box<dyn WsSession>,
    protocol_name: String,
    callback_timeout_ms: u64,
}

impl WsState {
    /// State for a freshly upgraded server connection
    pub fn new(
        session: Box<dyn WsSession>,
        protocol_name: String,
        max_frame_size: usize,
        max_message_size: usize,
        callback_timeout_ms: u64,
    ) -> Self {
        Self {
            reader: FrameReader::new(true, max_frame_size),
            assembler: MessageAssembler::new(max_message_size),
            session,
            protocol_name,
            callback_timeout_ms,
        }
    }

    /// Negotiated subprotocol name (empty for the unnamed default)
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Fire the post-upgrade callbacks
    pub fn acknowledge(&mut self, engine: &Engine, conn: &Arc<Connection>) {
        conn.set_ws_phase(WsPhase::Run);
        let name = self.protocol_name.clone();
        self.session.on_upgraded(&name);
        let mut ctx = WsContext::new(engine, conn, self.callback_timeout_ms);
        self.session.on_connect(&mut ctx);
    }

    /// Consume frames out of the read buffer until it runs dry
    ///
    /// Returns `Ok(false)` once the close handshake completed and the
    /// transport should be torn down.
    pub fn process(
        &mut self,
        engine: &Engine,
        conn: &Arc<Connection>,
        buf: &mut BytesMut,
    ) -> Result<bool> {
        loop {
            match self.reader.step(buf)? {
                Step::NeedsMore => return Ok(true),
                Step::Done(frame) => {
                    if !self.handle_frame(engine, conn, frame)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// The session is going away; errors here are swallowed
    pub fn disconnect(&mut self) {
        self.session.on_disconnect();
    }

    fn handle_frame(
        &mut self,
        engine: &Engine,
        conn: &Arc<Connection>,
        frame: Frame,
    ) -> Result<bool> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if let Some(msg) = self.assembler.push(frame)? {
                    let mut ctx = WsContext::new(engine, conn, self.callback_timeout_ms);
                    self.session.on_frame(&mut ctx, msg);
                }
                Ok(true)
            }
            OpCode::Ping => {
                // Answer before the application sees it
                send_frame(
                    engine,
                    conn,
                    &Frame::pong(frame.payload.clone()),
                    self.callback_timeout_ms,
                );
                let mut ctx = WsContext::new(engine, conn, self.callback_timeout_ms);
                self.session.on_frame(&mut ctx, Message::Ping(frame.payload));
                Ok(true)
            }
            OpCode::Pong => {
                conn.pong_received();
                let mut ctx = WsContext::new(engine, conn, self.callback_timeout_ms);
                self.session.on_frame(&mut ctx, Message::Pong(frame.payload));
                Ok(true)
            }
            OpCode::Close => {
                let reason = frame.close_reason()?;
                conn.mark_close_received();
                conn.set_ws_phase(WsPhase::Close);
                if !conn.close_sent() {
                    let echo = match &reason {
                        Some(r) => Frame::close(r.code, ""),
                        None => Frame::close_empty(),
                    };
                    send_frame(engine, conn, &echo, self.callback_timeout_ms);
                }
                let mut ctx = WsContext::new(engine, conn, self.callback_timeout_ms);
                self.session.on_frame(&mut ctx, Message::Close(reason));
                debug!(conn = %conn.handle(), "close handshake complete");
                // Close sent and received: tear the transport down
                Ok(false)
            }
        }
    }
}

/// Serialize one frame and write it through the engine
///
/// A Close frame flips the connection's `close_sent` marker after the write
/// returns and moves the process state to `Close`; only the first Close is
/// transmitted.
pub fn send_frame(engine: &Engine, conn: &Arc<Connection>, frame: &Frame, timeout_ms: u64) -> bool {
    if frame.opcode == OpCode::Close {
        if conn.close_sent() {
            return false;
        }
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        let ok = engine.write(conn, &wire, timeout_ms);
        if ok {
            conn.mark_close_sent();
            conn.set_ws_phase(WsPhase::Close);
        }
        return ok;
    }
    if conn.close_sent() {
        return false;
    }
    let mut wire = BytesMut::new();
    frame.encode(&mut wire);
    engine.write(conn, &wire, timeout_ms)
}

/// Serialize a frame into the connection's outgoing queue for the writer
/// thread's gathering drain; returns false when the queue cap is hit
pub fn queue_frame(conn: &Arc<Connection>, frame: &Frame, cap: Option<usize>) -> bool {
    if conn.close_sent() {
        return false;
    }
    let mut wire = BytesMut::new();
    frame.encode(&mut wire);
    conn.push_outgoing(wire.freeze(), cap)
}

/// Heartbeat ping from the idle scan; timeout 0 skips a write-locked
/// connection rather than stall the scanner
pub fn send_heartbeat(engine: &Engine, conn: &Arc<Connection>) -> u32 {
    if conn.ws_phase() != WsPhase::Run || conn.close_sent() {
        return conn.pings_unanswered();
    }
    let mut wire = BytesMut::new();
    encode_frame(&mut wire, OpCode::Ping, b"", true, None);
    if engine.write(conn, &wire, 0) {
        conn.ping_sent()
    } else {
        conn.pings_unanswered()
    }
}
