//! Async sockets engine
//!
//! Glues the poll multiplexers to the connection slots: starts and stops
//! connections, drains reads into the per-connection read buffer, drains
//! queued writes on writability, and dispatches the [`ConnHandler`]
//! callbacks under the slot's locking discipline. Worker threads drive it by
//! looping `process_read` / `process_write`.
//!
//! Error recovery is strictly per-connection: a transport fault or a
//! panicking callback closes that one connection and the engine keeps
//! serving the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Buf;
use tracing::{debug, trace, warn};

use crate::conn::{ConnHandler, Connection, Verdict};
use crate::error::{Error, Result};
use crate::multiplex::{Facility, PollSockets};
use crate::poll::{EventSet, PollEvent, Tag};
use crate::registry::Registry;
use crate::socket::{NetResult, Socket};
use crate::tls::TlsLayer;

/// Read drain chunk placed on the worker stack
const READ_CHUNK: usize = 32 * 1024;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Never attempt a direct send; always queue and wait for writability
    pub write_poll_only: bool,
    /// Bound on waiting out in-flight callbacks inside `stop`
    pub stop_lock_timeout_ms: u64,
    /// Forwarded to the multiplexers' deferred-unsubscribe drain
    pub unsubscribe_closes_socket: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_poll_only: false,
            stop_lock_timeout_ms: 500,
            unsubscribe_closes_socket: false,
        }
    }
}

/// Monotonic engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
    closed: AtomicU64,
}

impl EngineStats {
    /// Total bytes drained from sockets
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes pushed to sockets
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Transport faults observed
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Connections closed
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

enum ReadEnd {
    Retry,
    Closed,
    Fault(NetResult),
}

enum WriteEnd {
    Empty,
    Partial,
    Fault(NetResult),
}

struct ProcessingGuard<'a>(&'a AtomicUsize);

impl<'a> ProcessingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The async sockets engine (component E)
pub struct Engine {
    read: PollSockets,
    write: PollSockets,
    registry: Arc<Registry>,
    tls: Option<Arc<dyn TlsLayer>>,
    opts: EngineOptions,
    terminated: AtomicBool,
    processing: AtomicUsize,
    stats: EngineStats,
}

impl Engine {
    /// Build an engine over the given facility
    pub fn new(
        registry: Arc<Registry>,
        facility: Facility,
        opts: EngineOptions,
        tls: Option<Arc<dyn TlsLayer>>,
    ) -> Result<Self> {
        Ok(Self {
            read: PollSockets::new(facility, opts.unsubscribe_closes_socket)?,
            // Only the read side may own the close-on-unsubscribe duty;
            // both muxes doing it would close the descriptor twice
            write: PollSockets::new(facility, false)?,
            registry,
            tls,
            opts,
            terminated: AtomicBool::new(false),
            processing: AtomicUsize::new(0),
            stats: EngineStats::default(),
        })
    }

    /// The connection registry this engine serves
    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Engine counters
    #[inline]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Whether `terminate` has been requested
    #[inline]
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Make the connection's socket non-blocking and subscribe it for reads
    pub fn start(&self, conn: &Arc<Connection>) -> Result<()> {
        let sock = conn.socket().ok_or(Error::ConnectionClosed)?;
        if !sock.make_async().is_ok() {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if !self.read.subscribe(sock, EventSet::READ, conn.tag()) {
            return Err(Error::Io(std::io::Error::other("read subscription failed")));
        }
        debug!(conn = %conn.handle(), remote = conn.remote(), "connection started");
        Ok(())
    }

    /// Tear the transport down: clear the socket, unsubscribe both sides,
    /// drain pending errno, close, then wait (bounded) until no callback is
    /// mid-flight on either side
    pub fn stop(&self, conn: &Arc<Connection>) -> bool {
        let Some(sock) = conn.take_socket() else {
            return false;
        };
        let tag = conn.tag();
        if conn.write_subscribed().swap(false, Ordering::AcqRel) {
            self.write.unsubscribe(sock, tag);
        } else {
            self.write.delete_one_pending(tag);
        }
        self.read.unsubscribe(sock, tag);
        if !self.opts.unsubscribe_closes_socket {
            let mut drain = [0u8; 1];
            let _ = sock.recv(&mut drain);
            sock.shutdown_and_close(true);
        }

        let timeout = self.opts.stop_lock_timeout_ms;
        if conn.rd.lock.try_enter_for(timeout, || true) {
            conn.rd.lock.leave();
        }
        if conn.wr.lock.try_enter_for(timeout, || true) {
            conn.wr.lock.leave();
        }
        true
    }

    /// Write bytes to a connection
    ///
    /// Acquires the writer lock within `timeout_ms` (0 = single attempt).
    /// With an empty write buffer a direct non-blocking send is attempted
    /// first; whatever does not fit is appended to the write buffer and the
    /// socket subscribed for writability. Returns `false` on lock timeout or
    /// transport failure; a timeout leaves the write buffer untouched.
    pub fn write(&self, conn: &Arc<Connection>, data: &[u8], timeout_ms: u64) -> bool {
        if data.is_empty() {
            return true;
        }
        if self.terminated() || conn.is_closed() {
            return false;
        }
        if !conn.try_lock_for(true, timeout_ms) {
            return false;
        }
        self.write_locked(conn, data)
    }

    fn write_locked(&self, conn: &Arc<Connection>, data: &[u8]) -> bool {
        let Some(sock) = conn.socket() else {
            conn.unlock(true);
            return false;
        };
        // SAFETY: the writer lock is held
        let buf = unsafe { conn.wr.buf() };
        let mut pos = 0;
        if buf.is_empty() && !self.opts.write_poll_only {
            while pos < data.len() {
                let (res, n) = self.transport_send(sock, &data[pos..]);
                match res {
                    NetResult::Ok => {
                        pos += n;
                        self.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    NetResult::Retry => break,
                    other => {
                        conn.set_last_error(other);
                        self.unlock_and_close(conn, Some(true));
                        return false;
                    }
                }
            }
        }
        if pos < data.len() {
            buf.extend_from_slice(&data[pos..]);
            if !self.subscribe_write(conn, sock) {
                self.unlock_and_close(conn, Some(true));
                return false;
            }
        }
        conn.unlock(true);
        true
    }

    /// One poll-and-dispatch round for read readiness; worker threads call
    /// this in a loop. Returns whether an event was handled.
    pub fn process_read(&self, timeout_ms: u64) -> bool {
        let _guard = ProcessingGuard::enter(&self.processing);
        let mut ev = PollEvent::new(Tag::new(0), EventSet::NONE);
        if !self.read.get_one(timeout_ms, &mut ev) {
            return false;
        }
        if self.terminated() {
            return false;
        }
        let tag = ev.tag();
        let Some(conn) = self.registry.resolve(tag) else {
            trace!(tag = tag.value(), "read event for stale tag ignored");
            return true;
        };
        if conn.is_closed() {
            return true;
        }
        let events = ev.events();

        if events.has_error() {
            let keep = catch_unwind(AssertUnwindSafe(|| {
                conn.handler().on_error(self, &conn, events)
            }))
            .unwrap_or(false);
            if !keep {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                conn.set_last_error(NetResult::Fatal);
                self.close_connection(&conn);
                return true;
            }
        }

        if events.has_read() {
            if !conn.lock(false) {
                // The reader side is busy on another thread; requeue the
                // notification so the edge is not lost
                self.read.add_one_pending(tag, EventSet::READ, true);
                std::thread::yield_now();
            } else {
                let (got_data, end) = self.drain_read(&conn);
                let mut verdict = Verdict::Continue;
                if got_data {
                    verdict = self.invoke(&conn, |c| c.handler().on_read(self, c));
                }
                match (verdict, end) {
                    (Verdict::Close, _) => self.unlock_and_close(&conn, Some(false)),
                    (Verdict::Continue, ReadEnd::Retry) => conn.unlock(false),
                    (Verdict::Continue, ReadEnd::Closed) => {
                        conn.set_last_error(NetResult::Closed);
                        self.unlock_and_close(&conn, Some(false));
                    }
                    (Verdict::Continue, ReadEnd::Fault(res)) => {
                        warn!(conn = %conn.handle(), ?res, "read fault");
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        conn.set_last_error(res);
                        self.unlock_and_close(&conn, Some(false));
                    }
                }
            }
        }

        if events.has_closed() {
            conn.set_last_error(NetResult::Closed);
            self.close_connection(&conn);
        }
        true
    }

    /// One poll-and-dispatch round for write readiness
    pub fn process_write(&self, timeout_ms: u64) -> bool {
        let _guard = ProcessingGuard::enter(&self.processing);
        let mut ev = PollEvent::new(Tag::new(0), EventSet::NONE);
        if !self.write.get_one(timeout_ms, &mut ev) {
            return false;
        }
        if self.terminated() {
            return false;
        }
        let tag = ev.tag();
        let Some(conn) = self.registry.resolve(tag) else {
            trace!(tag = tag.value(), "write event for stale tag ignored");
            return true;
        };
        if conn.is_closed() {
            return true;
        }
        let events = ev.events();
        if events != EventSet::WRITE {
            if events.has_error() || events.has_closed() {
                conn.set_last_error(NetResult::Fatal);
                self.close_connection(&conn);
            }
            return true;
        }
        if !conn.lock(true) {
            self.write.add_one_pending(tag, EventSet::WRITE, true);
            std::thread::yield_now();
            return true;
        }
        match self.drain_write_locked(&conn) {
            WriteEnd::Empty => {
                self.unsubscribe_write(&conn);
                match self.invoke(&conn, |c| c.handler().after_write(self, c)) {
                    Verdict::Continue => conn.unlock(true),
                    Verdict::Close => self.unlock_and_close(&conn, Some(true)),
                }
            }
            WriteEnd::Partial => conn.unlock(true),
            WriteEnd::Fault(res) => {
                warn!(conn = %conn.handle(), ?res, "write fault");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                conn.set_last_error(res);
                self.unlock_and_close(&conn, Some(true));
            }
        }
        true
    }

    /// Release the held side (if any) and run the close path
    pub(crate) fn unlock_and_close(&self, conn: &Arc<Connection>, held: Option<bool>) {
        if let Some(writer) = held {
            conn.unlock(writer);
        }
        self.close_connection(conn);
    }

    /// Close a connection exactly once: transport teardown, `on_close`,
    /// registry removal
    pub fn close_connection(&self, conn: &Arc<Connection>) {
        if !conn.mark_closed() {
            return;
        }
        self.stop(conn);
        let _ = catch_unwind(AssertUnwindSafe(|| conn.handler().on_close(self, conn)));
        self.registry.remove(conn);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %conn.handle(), "connection closed");
    }

    /// Stop the multiplexers and wait (bounded) for in-flight processors
    pub fn terminate(&self, wait_ms: u64) {
        self.terminated.store(true, Ordering::Release);
        self.read.terminate();
        self.write.terminate();
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        while self.processing.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_read(&self, conn: &Arc<Connection>) -> (bool, ReadEnd) {
        let mut got = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let Some(sock) = conn.socket() else {
                return (got, ReadEnd::Closed);
            };
            let (res, n) = self.transport_recv(sock, &mut chunk);
            match res {
                NetResult::Ok => {
                    // SAFETY: the reader lock is held by the caller
                    unsafe { conn.rd.buf().extend_from_slice(&chunk[..n]) };
                    self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    got = true;
                }
                NetResult::Retry => return (got, ReadEnd::Retry),
                NetResult::Closed | NetResult::NoSocket => return (got, ReadEnd::Closed),
                other => return (got, ReadEnd::Fault(other)),
            }
        }
    }

    fn drain_write_locked(&self, conn: &Arc<Connection>) -> WriteEnd {
        loop {
            let Some(sock) = conn.socket() else {
                return WriteEnd::Fault(NetResult::NoSocket);
            };
            // SAFETY: the writer lock is held by the caller
            let buf = unsafe { conn.wr.buf() };
            if buf.is_empty() {
                return WriteEnd::Empty;
            }
            let (res, n) = self.transport_send(sock, &buf[..]);
            match res {
                NetResult::Ok => {
                    buf.advance(n);
                    self.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                }
                NetResult::Retry => return WriteEnd::Partial,
                other => return WriteEnd::Fault(other),
            }
        }
    }

    fn subscribe_write(&self, conn: &Arc<Connection>, sock: Socket) -> bool {
        if conn.write_subscribed().swap(true, Ordering::AcqRel) {
            return true;
        }
        if self.write.subscribe(sock, EventSet::WRITE, conn.tag()) {
            true
        } else {
            conn.write_subscribed().store(false, Ordering::Release);
            false
        }
    }

    fn unsubscribe_write(&self, conn: &Arc<Connection>) {
        if conn.write_subscribed().swap(false, Ordering::AcqRel) {
            if let Some(sock) = conn.socket() {
                self.write.unsubscribe(sock, conn.tag());
            }
        }
    }

    fn invoke(
        &self,
        conn: &Arc<Connection>,
        f: impl FnOnce(&Arc<Connection>) -> Verdict,
    ) -> Verdict {
        match catch_unwind(AssertUnwindSafe(|| f(conn))) {
            Ok(v) => v,
            Err(_) => {
                warn!(conn = %conn.handle(), "callback panicked; closing connection");
                Verdict::Close
            }
        }
    }

    fn transport_recv(&self, sock: Socket, buf: &mut [u8]) -> (NetResult, usize) {
        match &self.tls {
            Some(tls) => tls.receive(sock, buf),
            None => sock.recv(buf),
        }
    }

    fn transport_send(&self, sock: Socket, buf: &[u8]) -> (NetResult, usize) {
        match &self.tls {
            Some(tls) => tls.send(sock, buf),
            None => sock.send(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{accept, bind_listen, ListenAddr};
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;

    /// Echoes everything, records delivery order and close count
    struct Recorder {
        data: Mutex<Vec<u8>>,
        reads_in_flight: AtomicU32,
        max_reads_in_flight: AtomicU32,
        closes: AtomicU32,
        echo: bool,
    }

    impl Recorder {
        fn new(echo: bool) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(Vec::new()),
                reads_in_flight: AtomicU32::new(0),
                max_reads_in_flight: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                echo,
            })
        }
    }

    struct RecorderHandler(Arc<Recorder>);

    impl ConnHandler for RecorderHandler {
        fn on_read(&self, engine: &Engine, conn: &Arc<Connection>) -> Verdict {
            let inside = self.0.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.max_reads_in_flight.fetch_max(inside, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));

            // SAFETY: on_read runs under the reader lock
            let consumed: Vec<u8> = unsafe {
                let buf = conn.rd.buf();
                let out = buf.to_vec();
                buf.clear();
                out
            };
            self.0.data.lock().extend_from_slice(&consumed);
            if self.0.echo && !consumed.is_empty() {
                engine.write(conn, &consumed, 1_000);
            }
            self.0.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
            Verdict::Continue
        }

        fn on_close(&self, _engine: &Engine, _conn: &Arc<Connection>) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        listener: Socket,
        addr: SocketAddr,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let engine = Arc::new(
                Engine::new(
                    registry,
                    Facility::Readiness,
                    EngineOptions::default(),
                    None,
                )
                .unwrap(),
            );
            let listener = bind_listen(
                &ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 0))),
                false,
            )
            .unwrap();
            let addr = listener.local_addr().unwrap();
            Self {
                engine,
                listener,
                addr,
            }
        }

        fn connect(&self, recorder: &Arc<Recorder>) -> (std::net::TcpStream, Arc<Connection>) {
            let client = std::net::TcpStream::connect(self.addr).unwrap();
            let (res, accepted) = accept(self.listener);
            assert_eq!(res, NetResult::Ok);
            let (sock, remote) = accepted.unwrap();
            let handle = self.engine.registry().next_handle().unwrap();
            let conn = Arc::new(Connection::new(
                handle,
                sock,
                remote,
                Box::new(RecorderHandler(recorder.clone())),
            ));
            self.engine.registry().insert(conn.clone()).unwrap();
            self.engine.start(&conn).unwrap();
            (client, conn)
        }

        fn pump(&self, ms: u64) {
            let deadline = Instant::now() + Duration::from_millis(ms);
            while Instant::now() < deadline {
                self.engine.process_read(10);
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.engine.terminate(100);
            self.listener.close();
        }
    }

    #[test]
    fn ordered_lossless_delivery() {
        let h = Harness::new();
        let rec = Recorder::new(false);
        let (mut client, _conn) = h.connect(&rec);

        client.write_all(b"abc").unwrap();
        client.write_all(b"def").unwrap();
        client.write_all(b"ghi").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while rec.data.lock().len() < 9 && Instant::now() < deadline {
            h.engine.process_read(10);
        }
        assert_eq!(&*rec.data.lock(), b"abcdefghi");
    }

    #[test]
    fn echo_through_engine_write() {
        let h = Harness::new();
        let rec = Recorder::new(true);
        let (mut client, _conn) = h.connect(&rec);

        client.write_all(b"ping").unwrap();
        let pump = {
            let engine = h.engine.clone();
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                while Instant::now() < deadline {
                    engine.process_read(10);
                }
            })
        };
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut out = [0u8; 4];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ping");
        pump.join().unwrap();
    }

    #[test]
    fn on_close_fires_exactly_once() {
        let h = Harness::new();
        let rec = Recorder::new(false);
        let (client, conn) = h.connect(&rec);

        drop(client);
        h.pump(200);
        assert_eq!(rec.closes.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(conn.socket().is_none());
        assert_eq!(h.engine.registry().len(), 0);

        // A second explicit close must be a no-op
        h.engine.close_connection(&conn);
        assert_eq!(rec.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_read_after_close() {
        let h = Harness::new();
        let rec = Recorder::new(false);
        let (mut client, conn) = h.connect(&rec);

        client.write_all(b"before").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while rec.data.lock().len() < 6 && Instant::now() < deadline {
            h.engine.process_read(10);
        }

        h.engine.close_connection(&conn);
        let seen = rec.data.lock().clone();

        let _ = client.write_all(b"after");
        h.pump(150);
        assert_eq!(*rec.data.lock(), seen, "bytes delivered after close");
        assert_eq!(rec.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serialized_on_read_across_threads() {
        let h = Harness::new();
        let rec = Recorder::new(false);
        let (mut client, _conn) = h.connect(&rec);

        let engine = h.engine.clone();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_secs(2);
                    while Instant::now() < deadline {
                        engine.process_read(10);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            client.write_all(b"xxxxxxxxxx").unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(rec.max_reads_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(rec.data.lock().len(), 500);
    }

    #[test]
    fn write_lock_timeout_leaves_buffer_untouched() {
        let h = Harness::new();
        let rec = Recorder::new(false);
        let (_client, conn) = h.connect(&rec);

        assert!(conn.lock(true));
        assert!(!h.engine.write(&conn, b"blocked", 30));
        // SAFETY: this thread still holds the writer lock
        let len = unsafe { conn.wr.buf().len() };
        assert_eq!(len, 0);
        conn.unlock(true);

        // With the lock free the same write goes through
        assert!(h.engine.write(&conn, b"ok", 100));
    }

    #[test]
    fn panicking_callback_closes_only_that_connection() {
        struct Bomb(Arc<Recorder>);
        impl ConnHandler for Bomb {
            fn on_read(&self, _engine: &Engine, _conn: &Arc<Connection>) -> Verdict {
                panic!("boom");
            }
            fn on_close(&self, _engine: &Engine, _conn: &Arc<Connection>) {
                self.0.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let h = Harness::new();
        let rec = Recorder::new(false);
        let bomb_rec = Recorder::new(false);

        // Healthy connection
        let (mut client_ok, _conn_ok) = h.connect(&rec);

        // Connection whose handler panics on first read
        let client_bomb = std::net::TcpStream::connect(h.addr).unwrap();
        let (res, accepted) = accept(h.listener);
        assert_eq!(res, NetResult::Ok);
        let (sock, remote) = accepted.unwrap();
        let handle = h.engine.registry().next_handle().unwrap();
        let conn_bomb = Arc::new(Connection::new(
            handle,
            sock,
            remote,
            Box::new(Bomb(bomb_rec.clone())),
        ));
        h.engine.registry().insert(conn_bomb.clone()).unwrap();
        h.engine.start(&conn_bomb).unwrap();

        let mut client_bomb = client_bomb;
        client_bomb.write_all(b"trigger").unwrap();
        client_ok.write_all(b"fine").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while (bomb_rec.closes.load(Ordering::SeqCst) == 0 || rec.data.lock().len() < 4)
            && Instant::now() < deadline
        {
            h.engine.process_read(10);
        }

        assert_eq!(bomb_rec.closes.load(Ordering::SeqCst), 1);
        assert!(conn_bomb.is_closed());
        // The healthy connection kept working
        assert_eq!(&*rec.data.lock(), b"fine");
    }
}
