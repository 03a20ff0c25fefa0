//! Incremental HTTP/1.1 request state
//!
//! The parser tracks how far a request has progressed through the read
//! buffer (`WaitingRequestLine` → `InHeaders` → `Upgraded`/`Done`) and only
//! hands the bytes to `httparse` once the header terminator is on hand.
//! Header syntax itself is the collaborator's concern; this module cares
//! about state transitions, keep-alive and the upgrade intent.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Upper bound on request head size
const MAX_HEADER_SIZE: usize = 8192;
const MAX_HEADERS: usize = 64;

/// HTTP parse state; transitions are forward-only until a keep-alive
/// recycle resets to the initial state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    /// Nothing (or an incomplete request line) received
    WaitingRequestLine,
    /// Request line seen, headers incomplete
    InHeaders,
    /// Connection switched to WebSocket framing
    Upgraded,
    /// Request answered, connection about to close
    Done,
}

/// One decoded request head plus its raw body
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method
    pub method: String,
    /// Request target
    pub path: String,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
    /// Raw request body (`Content-Length` delimited)
    pub body: Bytes,
}

impl HttpRequest {
    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains `token`, case-insensitive
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    /// `Upgrade: websocket` plus `Connection: Upgrade`
    pub fn is_upgrade(&self) -> bool {
        self.header_has_token("upgrade", "websocket") && self.header_has_token("connection", "upgrade")
    }

    /// Peer asked for `Connection: close`
    pub fn wants_close(&self) -> bool {
        self.header_has_token("connection", "close")
    }
}

/// Outcome of feeding bytes to the parser
#[derive(Debug)]
pub enum HttpProgress {
    /// The head (or body) is still incomplete
    NeedsMore,
    /// A full request was decoded; `consumed` bytes cover head and body
    Ready {
        /// The decoded request
        request: HttpRequest,
        /// Bytes to drop from the front of the read buffer
        consumed: usize,
    },
}

/// Incremental request parser, one per connection
pub struct HttpParser {
    state: HttpState,
    scanned: usize,
    head_end: Option<usize>,
}

impl HttpParser {
    /// Parser in the initial state
    pub fn new() -> Self {
        Self {
            state: HttpState::WaitingRequestLine,
            scanned: 0,
            head_end: None,
        }
    }

    /// Current parse state
    #[inline]
    pub fn state(&self) -> HttpState {
        self.state
    }

    /// Mark the connection as switched to WebSocket framing
    pub fn set_upgraded(&mut self) {
        self.state = HttpState::Upgraded;
    }

    /// Mark the exchange finished (no keep-alive)
    pub fn set_done(&mut self) {
        self.state = HttpState::Done;
    }

    /// Keep-alive recycle: back to the initial state
    pub fn reset(&mut self) {
        self.state = HttpState::WaitingRequestLine;
        self.scanned = 0;
        self.head_end = None;
    }

    /// Feed the current read buffer; decodes a request once the terminator
    /// and any `Content-Length` body are fully buffered
    pub fn advance(&mut self, buf: &[u8]) -> Result<HttpProgress> {
        debug_assert!(matches!(
            self.state,
            HttpState::WaitingRequestLine | HttpState::InHeaders
        ));

        if self.state == HttpState::WaitingRequestLine
            && buf.windows(2).any(|w| w == b"\r\n")
        {
            self.state = HttpState::InHeaders;
        }

        let head_end = match self.head_end {
            Some(end) => end,
            None => {
                // Resume the terminator scan where the previous call stopped
                let from = self.scanned.saturating_sub(3);
                match buf[from..]
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map(|p| from + p + 4)
                {
                    Some(end) => {
                        self.head_end = Some(end);
                        end
                    }
                    None => {
                        if buf.len() > MAX_HEADER_SIZE {
                            return Err(Error::InvalidHttp("request head too large"));
                        }
                        self.scanned = buf.len();
                        return Ok(HttpProgress::NeedsMore);
                    }
                }
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let parsed = match req.parse(&buf[..head_end]) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(HttpProgress::NeedsMore),
            Err(_) => return Err(Error::InvalidHttp("malformed request head")),
        };

        let mut request = HttpRequest {
            method: req.method.unwrap_or("").to_string(),
            path: req.path.unwrap_or("/").to_string(),
            headers: Vec::with_capacity(req.headers.len()),
            body: Bytes::new(),
        };
        for header in req.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::InvalidHttp("non-UTF-8 header value"))?;
            request
                .headers
                .push((header.name.to_string(), value.to_string()));
        }

        let body_len = match request.header("content-length") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::InvalidHttp("bad Content-Length"))?,
            None => 0,
        };
        let total = parsed + body_len;
        if buf.len() < total {
            return Ok(HttpProgress::NeedsMore);
        }
        request.body = Bytes::copy_from_slice(&buf[parsed..total]);
        self.scanned = 0;
        self.head_end = None;
        Ok(HttpProgress::Ready {
            request,
            consumed: total,
        })
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Response emitted back through the engine
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// `Content-Type` header value
    pub content_type: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl HttpResponse {
    /// Empty response with a status code
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// 200 with a text body
    pub fn text(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// 404
    pub fn not_found() -> Self {
        Self::new(404)
    }

    /// 400
    pub fn bad_request() -> Self {
        Self::new(400)
    }

    /// Serialize status line, headers and body
    pub fn emit(&self, buf: &mut BytesMut, keep_alive: bool) {
        use bytes::BufMut;

        buf.reserve(128 + self.body.len());
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status_reason(self.status).as_bytes());
        buf.put_slice(b"\r\nContent-Type: ");
        buf.put_slice(self.content_type.as_bytes());
        buf.put_slice(b"\r\nContent-Length: ");
        buf.put_slice(self.body.len().to_string().as_bytes());
        buf.put_slice(if keep_alive {
            b"\r\nConnection: keep-alive\r\n".as_slice()
        } else {
            b"\r\nConnection: close\r\n".as_slice()
        });
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Collaborator answering plain (non-upgrade) requests
pub trait RequestHandler: Send + Sync {
    /// Gate called once the head is decoded; any status other than 200
    /// produces an error response and closes the connection
    fn decode_headers(&self, _req: &HttpRequest) -> u16 {
        200
    }

    /// Produce the response for a decoded request
    fn handle(&self, req: &HttpRequest) -> HttpResponse;
}
