//! Thin wrapper over OS TCP/UDP/Unix sockets
//!
//! All syscall outcomes are folded into [`NetResult`]; nothing in this module
//! panics on an OS error. Non-blocking `send`/`recv` report the bytes
//! actually transferred and classify `errno` so upper layers can decide
//! between retrying, queueing and closing.

use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use libc::{c_int, c_void, socklen_t};

use crate::error::{Error, Result};

/// Transport outcome of a socket operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetResult {
    /// Operation completed
    Ok = 0,
    /// Non-blocking call would block; try again after readiness
    Retry,
    /// The connection no longer owns a socket
    NoSocket,
    /// Lookup failed (e.g., unknown host)
    NotFound,
    /// Operation not supported on this socket/platform
    NotImplemented,
    /// Peer closed the connection gracefully
    Closed,
    /// Unrecoverable transport fault
    Fatal,
    /// Unclassified failure
    Unknown,
    /// Process or system descriptor limit reached
    TooManyConnections,
    /// Peer refused the connection
    Refused,
    /// Connect attempt timed out
    ConnectTimeout,
}

impl NetResult {
    /// Classify an `errno` value into a transport outcome
    pub fn from_errno(errno: c_int) -> Self {
        match errno {
            libc::EAGAIN | libc::EINTR => NetResult::Retry,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
            libc::EWOULDBLOCK => NetResult::Retry,
            libc::ECONNRESET | libc::EPIPE => NetResult::Closed,
            libc::EMFILE | libc::ENFILE => NetResult::TooManyConnections,
            libc::ECONNREFUSED => NetResult::Refused,
            libc::ETIMEDOUT => NetResult::ConnectTimeout,
            libc::EBADF | libc::ENOTSOCK => NetResult::NoSocket,
            _ => NetResult::Fatal,
        }
    }

    fn last_error() -> Self {
        Self::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// True for `Ok`
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, NetResult::Ok)
    }
}

impl From<u8> for NetResult {
    fn from(v: u8) -> Self {
        match v {
            0 => NetResult::Ok,
            1 => NetResult::Retry,
            2 => NetResult::NoSocket,
            3 => NetResult::NotFound,
            4 => NetResult::NotImplemented,
            5 => NetResult::Closed,
            6 => NetResult::Fatal,
            8 => NetResult::TooManyConnections,
            9 => NetResult::Refused,
            10 => NetResult::ConnectTimeout,
            _ => NetResult::Unknown,
        }
    }
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

/// An owned-by-convention OS socket descriptor
///
/// `Socket` is `Copy`; ownership and close responsibility are tracked by the
/// connection slot holding it (see [`crate::conn::Connection`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket(RawFd);

impl Socket {
    /// Wrap a raw descriptor
    #[inline]
    pub fn from_raw(fd: RawFd) -> Self {
        Socket(fd)
    }

    /// The raw descriptor
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Switch the socket to non-blocking mode
    pub fn make_async(&self) -> NetResult {
        unsafe {
            let flags = libc::fcntl(self.0, libc::F_GETFL, 0);
            if flags < 0 {
                return NetResult::last_error();
            }
            if libc::fcntl(self.0, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return NetResult::last_error();
            }
        }
        NetResult::Ok
    }

    /// Switch the socket back to blocking mode
    pub fn make_blocking(&self) -> NetResult {
        unsafe {
            let flags = libc::fcntl(self.0, libc::F_GETFL, 0);
            if flags < 0 {
                return NetResult::last_error();
            }
            if libc::fcntl(self.0, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
                return NetResult::last_error();
            }
        }
        NetResult::Ok
    }

    /// Send bytes; returns the outcome and the number of bytes written
    pub fn send(&self, buf: &[u8]) -> (NetResult, usize) {
        if self.0 < 0 {
            return (NetResult::NoSocket, 0);
        }
        let n = unsafe { libc::send(self.0, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };
        if n < 0 {
            (NetResult::last_error(), 0)
        } else {
            (NetResult::Ok, n as usize)
        }
    }

    /// Receive bytes; `Closed` when the peer performed an orderly shutdown
    pub fn recv(&self, buf: &mut [u8]) -> (NetResult, usize) {
        if self.0 < 0 {
            return (NetResult::NoSocket, 0);
        }
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            (NetResult::last_error(), 0)
        } else if n == 0 {
            (NetResult::Closed, 0)
        } else {
            (NetResult::Ok, n as usize)
        }
    }

    /// Datagram send to an explicit address
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> (NetResult, usize) {
        if self.0 < 0 {
            return (NetResult::NoSocket, 0);
        }
        let (ss, len) = sockaddr_from(addr);
        let n = unsafe {
            libc::sendto(
                self.0,
                buf.as_ptr() as *const c_void,
                buf.len(),
                SEND_FLAGS,
                &ss as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if n < 0 {
            (NetResult::last_error(), 0)
        } else {
            (NetResult::Ok, n as usize)
        }
    }

    /// Datagram receive, reporting the sender address
    pub fn recv_from(&self, buf: &mut [u8]) -> (NetResult, usize, Option<SocketAddr>) {
        if self.0 < 0 {
            return (NetResult::NoSocket, 0, None);
        }
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.0,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            (NetResult::last_error(), 0, None)
        } else {
            (NetResult::Ok, n as usize, sockaddr_to_addr(&ss))
        }
    }

    /// Block until the socket is ready for the requested directions
    pub fn wait_for(&self, timeout_ms: i32, read: bool, write: bool) -> NetResult {
        if self.0 < 0 {
            return NetResult::NoSocket;
        }
        let mut events: libc::c_short = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd: self.0,
            events,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            NetResult::last_error()
        } else if n == 0 {
            NetResult::Retry
        } else if pfd.revents & libc::POLLHUP != 0 {
            NetResult::Closed
        } else if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            NetResult::Fatal
        } else {
            NetResult::Ok
        }
    }

    /// Number of bytes available to read without blocking
    pub fn recv_pending(&self) -> usize {
        if self.0 < 0 {
            return 0;
        }
        let mut pending: c_int = 0;
        let rc = unsafe { libc::ioctl(self.0, libc::FIONREAD, &mut pending) };
        if rc < 0 {
            0
        } else {
            pending.max(0) as usize
        }
    }

    /// Shut down one or both directions, then close the descriptor
    pub fn shutdown_and_close(self, rdwr: bool) -> NetResult {
        if self.0 < 0 {
            return NetResult::NoSocket;
        }
        let how = if rdwr {
            libc::SHUT_RDWR
        } else {
            libc::SHUT_RD
        };
        unsafe {
            libc::shutdown(self.0, how);
            if libc::close(self.0) < 0 {
                return NetResult::last_error();
            }
        }
        NetResult::Ok
    }

    /// Close without shutdown (listener teardown)
    pub fn close(self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }

    /// Enable TCP keep-alive probes
    pub fn set_keepalive(&self, enabled: bool) -> NetResult {
        self.set_opt_int(libc::SOL_SOCKET, libc::SO_KEEPALIVE, enabled as c_int)
    }

    /// Disable (or re-enable) Nagle's algorithm
    pub fn set_nodelay(&self, enabled: bool) -> NetResult {
        self.set_opt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as c_int)
    }

    /// Configure close-time linger; `None` disables it
    pub fn set_linger(&self, timeout_secs: Option<u16>) -> NetResult {
        let lg = libc::linger {
            l_onoff: timeout_secs.is_some() as c_int,
            l_linger: timeout_secs.unwrap_or(0) as c_int,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.0,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lg as *const _ as *const c_void,
                mem::size_of_val(&lg) as socklen_t,
            )
        };
        if rc < 0 {
            NetResult::last_error()
        } else {
            NetResult::Ok
        }
    }

    /// Kernel receive buffer size
    pub fn set_recv_buffer_size(&self, bytes: usize) -> NetResult {
        self.set_opt_int(libc::SOL_SOCKET, libc::SO_RCVBUF, bytes as c_int)
    }

    /// Kernel send buffer size
    pub fn set_send_buffer_size(&self, bytes: usize) -> NetResult {
        self.set_opt_int(libc::SOL_SOCKET, libc::SO_SNDBUF, bytes as c_int)
    }

    /// Allow multiple listeners on the same port
    pub fn reuse_port(&self) -> NetResult {
        self.set_opt_int(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    }

    /// Locally bound address, if this is an IP socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(self.0, &mut ss as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            None
        } else {
            sockaddr_to_addr(&ss)
        }
    }

    fn set_opt_int(&self, level: c_int, name: c_int, value: c_int) -> NetResult {
        if self.0 < 0 {
            return NetResult::NoSocket;
        }
        let rc = unsafe {
            libc::setsockopt(
                self.0,
                level,
                name,
                &value as *const _ as *const c_void,
                mem::size_of_val(&value) as socklen_t,
            )
        };
        if rc < 0 {
            NetResult::last_error()
        } else {
            NetResult::Ok
        }
    }
}

/// Parsed listen address: `host:port`, `unix:/path`, or a bare port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP endpoint
    Tcp(SocketAddr),
    /// Unix-domain endpoint
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parse the textual address forms accepted by the server
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(path) = text.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidAddress(text.to_string()));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if let Ok(port) = text.parse::<u16>() {
            return Ok(ListenAddr::Tcp(SocketAddr::from(([0, 0, 0, 0], port))));
        }
        if let Ok(addr) = text.parse::<SocketAddr>() {
            return Ok(ListenAddr::Tcp(addr));
        }
        // Hostname form needs resolution
        text.to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .map(ListenAddr::Tcp)
            .ok_or_else(|| Error::InvalidAddress(text.to_string()))
    }
}

/// Create, configure and bind a listening socket for `addr`
pub fn bind_listen(addr: &ListenAddr, reuse_port: bool) -> Result<Socket> {
    match addr {
        ListenAddr::Tcp(sa) => bind_listen_tcp(sa, reuse_port),
        ListenAddr::Unix(path) => bind_listen_unix(path),
    }
}

fn bind_listen_tcp(addr: &SocketAddr, reuse_port: bool) -> Result<Socket> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let sock = Socket(fd);
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if reuse_port {
            sock.reuse_port();
        }
        let (ss, len) = sockaddr_from(addr);
        if libc::bind(fd, &ss as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }
        Ok(sock)
    }
}

fn bind_listen_unix(path: &std::path::Path) -> Result<Socket> {
    // A stale socket file from a previous run would make bind fail
    let _ = std::fs::remove_file(path);
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let mut sun: libc::sockaddr_un = mem::zeroed();
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() >= sun.sun_path.len() {
            libc::close(fd);
            return Err(Error::InvalidAddress(path.display().to_string()));
        }
        for (i, b) in bytes.iter().enumerate() {
            sun.sun_path[i] = *b as libc::c_char;
        }
        let len = mem::size_of::<libc::sockaddr_un>() as socklen_t;
        if libc::bind(fd, &sun as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }
        Ok(Socket(fd))
    }
}

/// Accept one pending connection from a listener
///
/// Returns `Retry` when the queue is empty, `TooManyConnections` on
/// descriptor exhaustion, the accepted socket plus textual peer address
/// otherwise.
pub fn accept(listener: Socket) -> (NetResult, Option<(Socket, String)>) {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let fd = unsafe {
        libc::accept(
            listener.raw(),
            &mut ss as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd < 0 {
        let res = match io::Error::last_os_error().raw_os_error().unwrap_or(0) {
            // An aborted half-open connection is not a listener fault
            libc::ECONNABORTED => NetResult::Retry,
            errno => NetResult::from_errno(errno),
        };
        return (res, None);
    }
    let remote = match sockaddr_to_addr(&ss) {
        Some(sa) => sa.to_string(),
        None => "unix".to_string(),
    };
    (NetResult::Ok, Some((Socket(fd), remote)))
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = sockaddr_v4(a);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (ss, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = sockaddr_v6(a);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (ss, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

fn sockaddr_v4(a: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = a.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(a.ip().octets()),
    };
    sin
}

fn sockaddr_v6(a: &SocketAddrV6) -> libc::sockaddr_in6 {
    let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_port = a.port().to_be();
    sin6.sin6_flowinfo = a.flowinfo();
    sin6.sin6_addr = libc::in6_addr {
        s6_addr: a.ip().octets(),
    };
    sin6.sin6_scope_id = a.scope_id();
    sin6
}

fn sockaddr_to_addr(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert_eq!(NetResult::from_errno(libc::EAGAIN), NetResult::Retry);
        assert_eq!(NetResult::from_errno(libc::EINTR), NetResult::Retry);
        assert_eq!(NetResult::from_errno(libc::ECONNRESET), NetResult::Closed);
        assert_eq!(NetResult::from_errno(libc::EPIPE), NetResult::Closed);
        assert_eq!(
            NetResult::from_errno(libc::EMFILE),
            NetResult::TooManyConnections
        );
        assert_eq!(NetResult::from_errno(libc::ECONNREFUSED), NetResult::Refused);
        assert_eq!(NetResult::from_errno(libc::EINVAL), NetResult::Fatal);
    }

    #[test]
    fn listen_addr_forms() {
        assert_eq!(
            ListenAddr::parse("8080").unwrap(),
            ListenAddr::Tcp(SocketAddr::from(([0, 0, 0, 0], 8080)))
        );
        assert_eq!(
            ListenAddr::parse("127.0.0.1:9000").unwrap(),
            ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 9000)))
        );
        assert_eq!(
            ListenAddr::parse("unix:/tmp/riptide.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/riptide.sock"))
        );
        assert!(ListenAddr::parse("unix:").is_err());
        assert!(ListenAddr::parse("not an address").is_err());
    }

    #[test]
    fn loopback_send_recv_roundtrip() {
        let listener =
            bind_listen(&ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 0))), false).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (res, accepted) = accept(listener);
        assert_eq!(res, NetResult::Ok);
        let (server_sock, remote) = accepted.unwrap();
        assert!(remote.starts_with("127.0.0.1:"));

        use std::io::Write;
        let mut client = client;
        client.write_all(b"ping").unwrap();

        assert_eq!(server_sock.wait_for(1000, true, false), NetResult::Ok);
        let mut buf = [0u8; 16];
        let (res, n) = server_sock.recv(&mut buf);
        assert_eq!(res, NetResult::Ok);
        assert_eq!(&buf[..n], b"ping");

        // Non-blocking recv with nothing pending reports Retry
        assert_eq!(server_sock.make_async(), NetResult::Ok);
        let (res, _) = server_sock.recv(&mut buf);
        assert_eq!(res, NetResult::Retry);

        drop(client);
        // Orderly shutdown surfaces as Closed once the FIN is processed
        assert_eq!(server_sock.wait_for(1000, true, false), NetResult::Ok);
        let (res, _) = server_sock.recv(&mut buf);
        assert_eq!(res, NetResult::Closed);

        server_sock.shutdown_and_close(true);
        listener.close();
    }

    #[test]
    fn recv_pending_counts_buffered_bytes() {
        let listener =
            bind_listen(&ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 0))), false).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (_, accepted) = accept(listener);
        let (server_sock, _) = accepted.unwrap();

        use std::io::Write;
        client.write_all(b"hello").unwrap();
        assert_eq!(server_sock.wait_for(1000, true, false), NetResult::Ok);
        assert_eq!(server_sock.recv_pending(), 5);

        server_sock.shutdown_and_close(true);
        listener.close();
    }
}
