//! WebSocket server: accept loop, worker threads and fan-out
//!
//! Thread roles: one acceptor blocked in `accept`, N reader threads looping
//! [`Engine::process_read`], and one writer thread looping
//! [`Engine::process_write`] plus the periodic idle scan (heartbeats, buffer
//! shrinking) and the outgoing-frame gathering drain. With
//! `no_write_thread` the writer duties fold into the readers.
//!
//! Shutdown flips the terminated flag, pokes a sentinel loopback connection
//! through the listener to unblock `accept`, and joins every thread within
//! a bounded grace window.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::conn::{ConnHandler, Connection, Verdict, WsPhase};
use crate::engine::{Engine, EngineOptions};
use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};
use crate::handshake;
use crate::http::{HttpProgress, HttpParser, HttpResponse, HttpState, RequestHandler};
use crate::multiplex::Facility;
use crate::poll::EventSet;
use crate::protocol::{queue_frame, send_frame, send_heartbeat, Message, ProtocolRegistry, WsState};
use crate::registry::{Handle, Registry};
use crate::socket::{self, ListenAddr, NetResult, Socket};
use crate::Config;

/// The server (components F's thread pool, I's broadcast and J)
pub struct Server {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    config: Config,
    engine: Arc<Engine>,
    registry: Arc<Registry>,
    protocols: ProtocolRegistry,
    request_handler: Option<Arc<dyn RequestHandler>>,
    listener: Socket,
    listen_addr: ListenAddr,
    outgoing: Mutex<Vec<Handle>>,
    terminated: AtomicBool,
    started: Instant,
    last_idle_ms: AtomicU64,
}

impl Shared {
    fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Interval of the idle scan: once per second, tightened when the
    /// heartbeat delay is shorter than that
    fn idle_interval_ms(&self) -> u64 {
        match self.config.heartbeat_delay_ms {
            0 => 1_000,
            ms => ms.min(1_000),
        }
    }

    fn notify_outgoing(&self, handle: Handle) {
        let mut list = self.outgoing.lock();
        if !list.contains(&handle) {
            list.push(handle);
        }
    }

    /// Run the idle scan when its interval elapsed; one thread wins the
    /// tick, the rest skip
    fn idle_tick(self: &Arc<Self>) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_idle_ms.load(Ordering::Acquire);
        if now_ms < last + self.idle_interval_ms() {
            return;
        }
        if self
            .last_idle_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.idle_scan((now_ms / 1000) as u32);
    }

    /// One pass over all live connections: refresh activity stamps, shrink
    /// long-idle buffers, fire the idle callback (heartbeats). Failures are
    /// swallowed per connection.
    fn idle_scan(self: &Arc<Self>, now_sec: u32) {
        let release_after = self.config.last_operation_release_memory_seconds;
        let heartbeat_secs = (self.config.heartbeat_delay_ms / 1000) as u32;
        let idle_after = if self.config.heartbeat_delay_ms > 0 {
            Some(heartbeat_secs)
        } else if self.config.last_operation_idle_seconds > 0 {
            Some(self.config.last_operation_idle_seconds)
        } else {
            None
        };

        for conn in self.registry.snapshot() {
            let shared = self.clone();
            let _ = catch_unwind(AssertUnwindSafe(|| {
                if conn.take_active() {
                    conn.set_last_operation_sec(now_sec);
                    return;
                }
                let idle = now_sec.saturating_sub(conn.last_operation_sec());
                if release_after > 0 && idle >= release_after {
                    conn.release_buffers();
                } else if let Some(threshold) = idle_after {
                    if idle >= threshold {
                        conn.handler().on_idle(&shared.engine, &conn, idle);
                    }
                }
            }));
        }
    }

    /// Gathering drain: swap the notify list out under its light lock, then
    /// per connection coalesce every queued frame into a single write
    fn drain_outgoing(self: &Arc<Self>) {
        let handles = {
            let mut list = self.outgoing.lock();
            if list.is_empty() {
                return;
            }
            std::mem::take(&mut *list)
        };
        let t0 = Instant::now();
        for handle in handles {
            let Some(conn) = self.registry.find(handle) else {
                continue;
            };
            if conn.close_sent() {
                continue;
            }
            let Some(jumbo) = conn.take_outgoing() else {
                continue;
            };
            if !self.engine.write(&conn, &jumbo, 10) && !conn.is_closed() {
                // Writer lock was busy; put the batch back for the next
                // round so no frame is lost
                conn.requeue_outgoing(jumbo.freeze());
                self.notify_outgoing(handle);
            }
        }
        let spent = t0.elapsed();
        if spent > Duration::from_micros(500) {
            warn!(elapsed_us = spent.as_micros() as u64, "slow outgoing drain round");
        }
    }
}

impl Server {
    /// Bind a listener and assemble the server
    ///
    /// `addr` takes `host:port`, `unix:/path` or a bare port (0.0.0.0).
    /// No thread runs until [`start`](Server::start).
    pub fn bind(
        addr: &str,
        config: Config,
        protocols: ProtocolRegistry,
        request_handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Server> {
        let listen_addr = ListenAddr::parse(addr)?;
        let listener = socket::bind_listen(&listen_addr, config.reuse_port)?;
        listener.set_linger(Some(5));
        // A non-blocking listener keeps the acceptor's terminated checks
        // bounded even when the shutdown sentinel cannot connect
        listener.make_async();

        let registry = Arc::new(Registry::new());
        let engine = Arc::new(Engine::new(
            registry.clone(),
            Facility::Readiness,
            EngineOptions {
                write_poll_only: config.write_poll_only,
                stop_lock_timeout_ms: 500,
                unsubscribe_closes_socket: config.unsubscribe_closes_socket,
            },
            config.tls.clone(),
        )?);

        info!(%addr, "server bound");
        Ok(Server {
            shared: Arc::new(Shared {
                config,
                engine,
                registry,
                protocols,
                request_handler,
                listener,
                listen_addr,
                outgoing: Mutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
                started: Instant::now(),
                last_idle_ms: AtomicU64::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The bound TCP address (ephemeral ports resolved)
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.listener.local_addr()
    }

    /// The engine driving this server
    pub fn engine(&self) -> &Arc<Engine> {
        &self.shared.engine
    }

    /// The connection registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Spawn the acceptor, reader and writer threads
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        let shared = self.shared.clone();
        threads.push(
            std::thread::Builder::new()
                .name("riptide-accept".into())
                .spawn(move || accept_loop(shared))
                .map_err(Error::Io)?,
        );

        let readers = self.shared.config.thread_pool_count.max(1);
        for i in 0..readers {
            let shared = self.shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("riptide-read-{}", i))
                    .spawn(move || reader_loop(shared))
                    .map_err(Error::Io)?,
            );
        }

        if !self.shared.config.no_write_thread {
            let shared = self.shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("riptide-write".into())
                    .spawn(move || writer_loop(shared))
                    .map_err(Error::Io)?,
            );
        }
        info!(readers, "server started");
        Ok(())
    }

    /// Queue a message for a connection; transmitted by the writer
    /// thread's next gathering drain
    pub fn send(&self, handle: Handle, msg: impl Into<Message>) -> bool {
        let Some(conn) = self.shared.registry.find(handle) else {
            return false;
        };
        if conn.ws_phase() != WsPhase::Run {
            return false;
        }
        let frame = msg.into().to_frame();
        if queue_frame(
            &conn,
            &frame,
            self.shared.config.max_outgoing_queue_per_connection,
        ) {
            self.shared.notify_outgoing(handle);
            true
        } else {
            // Queue cap exceeded: the peer is not draining, drop it
            warn!(conn = %handle, "outgoing queue limit reached");
            send_frame(
                &self.shared.engine,
                &conn,
                &Frame::close(crate::error::CloseReason::INTERNAL, "backpressure"),
                0,
            );
            self.shared.engine.close_connection(&conn);
            false
        }
    }

    /// Send one pre-encoded copy of a frame to many connections
    ///
    /// With an empty target list every live WebSocket connection is
    /// addressed; otherwise each handle is looked up in O(log n) and
    /// duplicates are sent once. `timeout_ms` bounds the per-connection
    /// writer-lock wait (0 = skip a write-locked connection). Returns the
    /// number of successful sends.
    pub fn broadcast(&self, msg: impl Into<Message>, targets: &[Handle], timeout_ms: u64) -> usize {
        let frame = msg.into().to_frame();
        if !matches!(frame.opcode, OpCode::Text | OpCode::Binary | OpCode::Close) {
            return 0;
        }
        let is_close = frame.opcode == OpCode::Close;
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);

        let conns: Vec<Arc<Connection>> = if targets.is_empty() {
            self.shared.registry.snapshot()
        } else {
            let mut wanted = targets.to_vec();
            wanted.sort();
            wanted.dedup();
            wanted
                .into_iter()
                .filter_map(|h| self.shared.registry.find(h))
                .collect()
        };

        let mut sent = 0;
        for conn in conns {
            if conn.ws_phase() != WsPhase::Run || conn.close_sent() {
                continue;
            }
            if self.shared.engine.write(&conn, &wire, timeout_ms) {
                if is_close {
                    conn.mark_close_sent();
                    conn.set_ws_phase(WsPhase::Close);
                }
                sent += 1;
            }
        }
        sent
    }

    /// Stop accepting, terminate the engine, join every thread and close
    /// the remaining connections; bounded by `wait_ms`
    pub fn shutdown(&self, wait_ms: u64) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("server shutting down");

        // Unblock the acceptor with a sentinel connection
        match &self.shared.listen_addr {
            ListenAddr::Tcp(_) => {
                if let Some(mut addr) = self.shared.listener.local_addr() {
                    if addr.ip().is_unspecified() {
                        addr.set_ip(std::net::IpAddr::from([127, 0, 0, 1]));
                    }
                    let _ = std::net::TcpStream::connect_timeout(
                        &addr,
                        Duration::from_millis(200),
                    );
                }
            }
            ListenAddr::Unix(path) => {
                let _ = std::os::unix::net::UnixStream::connect(path);
            }
        }

        self.shared.engine.terminate(wait_ms.min(5_000));
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
        for conn in self.shared.registry.snapshot() {
            self.shared.engine.close_connection(&conn);
        }
        self.shared.listener.close();
        if let ListenAddr::Unix(path) = &self.shared.listen_addr {
            let _ = std::fs::remove_file(path);
        }
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown(5_000);
    }
}

fn accept_loop(shared: Arc<Shared>) {
    debug!("acceptor running");
    loop {
        if shared.terminated() {
            break;
        }
        let (res, accepted) = socket::accept(shared.listener);
        match res {
            NetResult::Ok => {
                let Some((sock, remote)) = accepted else {
                    continue;
                };
                if shared.terminated() {
                    sock.shutdown_and_close(true);
                    break;
                }
                if let Err(e) = setup_connection(&shared, sock, remote) {
                    if matches!(e, Error::HandleOverflow) {
                        error!("handle space exhausted; acceptor stopping");
                        break;
                    }
                }
            }
            NetResult::Retry => {
                shared.listener.wait_for(200, true, false);
            }
            NetResult::TooManyConnections => {
                warn!("descriptor limit hit; accept backing off");
                std::thread::sleep(Duration::from_millis(50));
            }
            NetResult::NoSocket | NetResult::Closed => break,
            other => {
                if shared.terminated() {
                    break;
                }
                warn!(?other, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("acceptor exiting");
}

fn setup_connection(shared: &Arc<Shared>, sock: Socket, remote: String) -> Result<()> {
    if shared.config.send_delay_ms == 0 {
        sock.set_nodelay(true);
    }
    sock.set_keepalive(true);
    if let Some(tls) = &shared.config.tls {
        if let Err(e) = tls.after_accept(sock) {
            warn!(%remote, error = %e, "TLS accept failed");
            sock.shutdown_and_close(true);
            return Ok(());
        }
    }

    let handle = shared.registry.next_handle()?;
    let handler = ServerConnHandler::new(shared.clone());
    let conn = Arc::new(Connection::new(handle, sock, remote, Box::new(handler)));
    shared.registry.insert(conn.clone())?;
    if let Err(e) = shared.engine.start(&conn) {
        warn!(conn = %handle, error = %e, "connection start failed");
        shared.engine.close_connection(&conn);
    }
    Ok(())
}

fn reader_loop(shared: Arc<Shared>) {
    let fold_writer = shared.config.no_write_thread;
    while !shared.terminated() {
        shared.engine.process_read(shared.config.poll_timeout_ms);
        if fold_writer {
            shared.engine.process_write(0);
            shared.drain_outgoing();
            shared.idle_tick();
        }
    }
}

fn writer_loop(shared: Arc<Shared>) {
    while !shared.terminated() {
        let wait = shared.idle_interval_ms().min(100);
        shared.engine.process_write(wait);
        shared.drain_outgoing();
        shared.idle_tick();
    }
}

enum Flow {
    KeepGoing,
    Close,
}

struct ProtoState {
    http: HttpParser,
    ws: Option<WsState>,
}

/// The per-connection capability for HTTP and upgraded WebSocket traffic
struct ServerConnHandler {
    shared: Arc<Shared>,
    state: UnsafeCell<ProtoState>,
}

// SAFETY: `state` is only touched from `on_read`, `on_close` and the
// upgrade path inside them; `on_read` is serialized by the connection's
// reader lock and `on_close` runs once after both locks were acquirable.
unsafe impl Send for ServerConnHandler {}
unsafe impl Sync for ServerConnHandler {}

impl ServerConnHandler {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: UnsafeCell::new(ProtoState {
                http: HttpParser::new(),
                ws: None,
            }),
        }
    }

    fn respond(
        &self,
        engine: &Engine,
        conn: &Arc<Connection>,
        response: &HttpResponse,
        keep_alive: bool,
    ) -> bool {
        let mut out = BytesMut::new();
        response.emit(&mut out, keep_alive);
        engine.write(conn, &out, self.shared.config.callback_answer_timeout_ms)
    }

    fn dispatch(
        &self,
        engine: &Engine,
        conn: &Arc<Connection>,
        state: &mut ProtoState,
        request: crate::http::HttpRequest,
    ) -> Flow {
        if let Some(handler) = &self.shared.request_handler {
            let status = handler.decode_headers(&request);
            if status != 200 {
                self.respond(engine, conn, &HttpResponse::new(status), false);
                return Flow::Close;
            }
        }

        if request.is_upgrade() {
            return self.upgrade(engine, conn, state, &request);
        }

        let Some(handler) = &self.shared.request_handler else {
            self.respond(engine, conn, &HttpResponse::not_found(), false);
            return Flow::Close;
        };
        let response = handler.handle(&request);
        let keep_alive = !request.wants_close();
        if !self.respond(engine, conn, &response, keep_alive) {
            return Flow::Close;
        }
        if keep_alive {
            state.http.reset();
            Flow::KeepGoing
        } else {
            state.http.set_done();
            Flow::Close
        }
    }

    fn upgrade(
        &self,
        engine: &Engine,
        conn: &Arc<Connection>,
        state: &mut ProtoState,
        request: &crate::http::HttpRequest,
    ) -> Flow {
        let upgrade = match handshake::negotiate(request, &self.shared.protocols) {
            Ok(u) => u,
            Err(e) => {
                debug!(conn = %conn.handle(), error = %e, "upgrade rejected");
                self.respond(engine, conn, &HttpResponse::bad_request(), false);
                return Flow::Close;
            }
        };

        conn.set_ws_phase(WsPhase::Create);
        if !engine.write(
            conn,
            &upgrade.response,
            self.shared.config.callback_answer_timeout_ms,
        ) {
            return Flow::Close;
        }

        let name = upgrade.protocol_name.clone().unwrap_or_default();
        let mut ws = WsState::new(
            upgrade.protocol.create_session(),
            name,
            self.shared.config.max_frame_size,
            self.shared.config.max_message_size,
            self.shared.config.callback_answer_timeout_ms,
        );
        state.http.set_upgraded();
        // The 101 went out: acknowledge moves Create -> Run and fires
        // on_upgraded / on_connect
        ws.acknowledge(engine, conn);
        state.ws = Some(ws);
        debug!(conn = %conn.handle(), protocol = ws_name(state), "connection upgraded");
        Flow::KeepGoing
    }
}

fn ws_name(state: &ProtoState) -> &str {
    state
        .ws
        .as_ref()
        .map(|ws| ws.protocol_name())
        .unwrap_or("")
}

impl ConnHandler for ServerConnHandler {
    fn on_read(&self, engine: &Engine, conn: &Arc<Connection>) -> Verdict {
        // SAFETY: on_read is serialized under the connection's reader lock
        let state = unsafe { &mut *self.state.get() };
        let buf = unsafe { conn.rd.buf() };

        loop {
            match state.http.state() {
                HttpState::Upgraded => {
                    let Some(ws) = state.ws.as_mut() else {
                        return Verdict::Close;
                    };
                    return match ws.process(engine, conn, buf) {
                        Ok(true) => Verdict::Continue,
                        Ok(false) => Verdict::Close,
                        Err(e) => {
                            debug!(conn = %conn.handle(), error = %e, "framing error");
                            if let Some(code) = e.close_code() {
                                send_frame(engine, conn, &Frame::close(code, ""), 100);
                            }
                            Verdict::Close
                        }
                    };
                }
                HttpState::Done => {
                    // Late bytes on a finished exchange are dropped
                    buf.clear();
                    return Verdict::Continue;
                }
                _ => match state.http.advance(&buf[..]) {
                    Ok(HttpProgress::NeedsMore) => return Verdict::Continue,
                    Ok(HttpProgress::Ready { request, consumed }) => {
                        buf.advance(consumed);
                        match self.dispatch(engine, conn, state, request) {
                            Flow::KeepGoing => continue,
                            Flow::Close => return Verdict::Close,
                        }
                    }
                    Err(e) => {
                        debug!(conn = %conn.handle(), error = %e, "bad request");
                        self.respond(engine, conn, &HttpResponse::bad_request(), false);
                        return Verdict::Close;
                    }
                },
            }
        }
    }

    fn on_close(&self, _engine: &Engine, conn: &Arc<Connection>) {
        // SAFETY: on_close runs exactly once, with no concurrent on_read
        let state = unsafe { &mut *self.state.get() };
        if let Some(ws) = state.ws.as_mut() {
            // Disconnect notifications must not take the connection down a
            // second path; errors are swallowed
            let _ = catch_unwind(AssertUnwindSafe(|| ws.disconnect()));
        }
        debug!(conn = %conn.handle(), "server connection closed");
    }

    fn on_error(&self, _engine: &Engine, conn: &Arc<Connection>, events: EventSet) -> bool {
        debug!(conn = %conn.handle(), ?events, "transport error reported");
        false
    }

    fn on_idle(&self, engine: &Engine, conn: &Arc<Connection>, idle_secs: u32) {
        if conn.ws_phase() != WsPhase::Run {
            // Plain HTTP connection: enforce the keep-alive window
            let limit = (self.shared.config.keep_alive_timeout_ms / 1000) as u32;
            if limit > 0 && idle_secs >= limit.max(1) {
                debug!(conn = %conn.handle(), idle_secs, "keep-alive window expired");
                engine.close_connection(conn);
            }
            return;
        }
        let limit = self.shared.config.disconnect_after_invalid_heartbeat_count;
        if limit > 0 && conn.pings_unanswered() >= limit {
            debug!(conn = %conn.handle(), idle_secs, "heartbeat limit exceeded");
            engine.close_connection(conn);
            return;
        }
        send_heartbeat(engine, conn);
    }
}
