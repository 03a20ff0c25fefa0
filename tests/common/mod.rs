//! Shared helpers: a raw-socket WebSocket client and an echo server
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use riptide_ws::prelude::*;

/// Subprotocol echoing every data message back to the peer
pub struct EchoProto(pub &'static str);

impl SubProtocol for EchoProto {
    fn name(&self) -> &str {
        self.0
    }

    fn create_session(&self) -> Box<dyn WsSession> {
        Box::new(EchoSession)
    }
}

struct EchoSession;

impl WsSession for EchoSession {
    fn on_frame(&mut self, ctx: &mut WsContext<'_>, msg: Message) {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                ctx.send_message(msg);
            }
            _ => {}
        }
    }
}

/// Bind an echo server with the unnamed default protocol on an ephemeral
/// loopback port
pub fn start_echo_server(config: Config) -> (Server, SocketAddr) {
    let mut protocols = ProtocolRegistry::new();
    protocols.register(Arc::new(EchoProto("")));
    let server = Server::bind("127.0.0.1:0", config, protocols, None).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// A config with a small thread pool so tests stay light
pub fn test_config() -> Config {
    Config::builder()
        .thread_pool_count(2)
        .poll_timeout_ms(200)
        .build()
}

pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Send an upgrade request and return the raw response head
pub fn request_upgrade(stream: &mut TcpStream, extra_headers: &str) -> String {
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n{}\r\n",
        SAMPLE_KEY, extra_headers
    );
    stream.write_all(request.as_bytes()).unwrap();
    read_http_head(stream)
}

/// Open a connection and complete the upgrade handshake
pub fn ws_connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let head = request_upgrade(&mut stream, "");
    assert!(
        head.starts_with("HTTP/1.1 101"),
        "upgrade rejected: {}",
        head
    );
    stream
}

/// Read the response head up to and including the blank line
pub fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            Ok(_) => break,
            Err(e) => panic!("head read failed: {} (got {:?})", e, String::from_utf8_lossy(&head)),
        }
    }
    String::from_utf8(head).unwrap()
}

/// Send a client frame: FIN per `fin`, masked with `mask`
pub fn send_frame_raw(stream: &mut TcpStream, fin: bool, opcode: u8, payload: &[u8], mask: [u8; 4]) {
    let mut wire = Vec::with_capacity(payload.len() + 14);
    let b0 = if fin { 0x80 | opcode } else { opcode };
    wire.push(b0);
    if payload.len() <= 125 {
        wire.push(0x80 | payload.len() as u8);
    } else if payload.len() <= 65_535 {
        wire.push(0x80 | 126);
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        wire.push(0x80 | 127);
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    wire.extend_from_slice(&mask);
    wire.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    stream.write_all(&wire).unwrap();
}

/// Send a final masked frame
pub fn send_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    send_frame_raw(stream, true, opcode, payload, [0x37, 0xfa, 0x21, 0x3d]);
}

/// Read one server frame; asserts it is unmasked. Returns (opcode, fin,
/// payload).
pub fn read_frame(stream: &mut TcpStream) -> (u8, bool, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0, "server frame must not be masked");
    let seed = (header[1] & 0x7F) as u64;
    let len = match seed {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext)
        }
        n => n,
    };
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).unwrap();
    (opcode, fin, payload)
}

/// Read frames until one with `opcode` arrives (skipping pings and the
/// like); panics after ten foreign frames
pub fn read_frame_of(stream: &mut TcpStream, opcode: u8) -> (bool, Vec<u8>) {
    for _ in 0..10 {
        let (op, fin, payload) = read_frame(stream);
        if op == opcode {
            return (fin, payload);
        }
    }
    panic!("frame with opcode {:#x} never arrived", opcode);
}

/// Assert no further frame arrives within `ms`
pub fn expect_silence(stream: &mut TcpStream, ms: u64) {
    stream
        .set_read_timeout(Some(Duration::from_millis(ms)))
        .unwrap();
    let mut probe = [0u8; 1];
    match stream.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => panic!("unexpected frame data"),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "unexpected error: {}",
            e
        ),
    }
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
}

/// Spin until `cond` holds or the deadline passes
pub fn wait_until(ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(ms);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
