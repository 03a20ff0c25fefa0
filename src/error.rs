//! Error types for the server core

use std::fmt;
use std::io;

/// Result type alias for server-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server-core error types
///
/// Transport-level outcomes (would-block, peer reset, ...) are *not* errors;
/// they are [`crate::socket::NetResult`] values handled in place. `Error`
/// covers protocol violations, handshake failures and invariant breaches
/// that must propagate to a caller.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket layer
    Io(io::Error),
    /// Invalid WebSocket frame
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message
    InvalidUtf8,
    /// WebSocket protocol violation
    Protocol(&'static str),
    /// Connection closed
    ConnectionClosed,
    /// Assembled message exceeds the configured limit
    MessageTooLarge,
    /// Single frame exceeds the configured limit
    FrameTooLarge,
    /// Malformed HTTP request
    InvalidHttp(&'static str),
    /// WebSocket upgrade handshake failed
    HandshakeFailed(&'static str),
    /// Invalid close status code
    InvalidCloseCode(u16),
    /// Listen/connect address could not be parsed
    InvalidAddress(String),
    /// The 31-bit connection handle space is exhausted
    HandleOverflow,
    /// A poll tag refers to a connection slot that no longer exists
    DanglingTag(u64),
    /// The engine is shutting down
    Terminated,
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload (e.g., broken UTF-8)
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if a close code may appear on the wire per RFC 6455 section 7.4
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Error {
    /// Close status code a peer should receive for this error, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::InvalidUtf8 => Some(CloseReason::INVALID_PAYLOAD),
            Error::MessageTooLarge | Error::FrameTooLarge => Some(CloseReason::TOO_BIG),
            Error::InvalidFrame(_) | Error::Protocol(_) | Error::InvalidCloseCode(_) => {
                Some(CloseReason::PROTOCOL_ERROR)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            Error::HandleOverflow => write!(f, "Connection handle space exhausted"),
            Error::DanglingTag(tag) => write!(f, "Dangling poll tag: {:#x}", tag),
            Error::Terminated => write!(f, "Engine terminated"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
