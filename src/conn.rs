//! Per-connection slot
//!
//! One [`Connection`] per live socket: the descriptor, the two side buffers
//! with their counting locks, activity bookkeeping and the outgoing frame
//! queue. The reader and writer sides are independent — one reader and one
//! writer may work the same connection concurrently, but never two of the
//! same side.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::lock::LockCell;
use crate::poll::{EventSet, Tag};
use crate::registry::Handle;
use crate::socket::{NetResult, Socket};

/// Outcome of a data callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the connection open
    Continue,
    /// Close the connection
    Close,
}

/// Capability set plugged into the engine per connection
///
/// The engine serializes `on_read` under the reader lock and `after_write`
/// under the writer lock; `on_close` runs exactly once, after both locks
/// could be acquired, so no other callback is in flight. Implementations
/// exist for the HTTP/WebSocket server connection and for test stubs.
pub trait ConnHandler: Send + Sync {
    /// Bytes were appended to the read buffer; consume them
    fn on_read(&self, engine: &Engine, conn: &Arc<Connection>) -> Verdict;

    /// The write buffer fully drained
    fn after_write(&self, _engine: &Engine, _conn: &Arc<Connection>) -> Verdict {
        Verdict::Continue
    }

    /// A transport error was reported; `false` closes the connection
    fn on_error(&self, _engine: &Engine, _conn: &Arc<Connection>, _events: EventSet) -> bool {
        false
    }

    /// The connection is gone; the slot is released right after
    fn on_close(&self, _engine: &Engine, _conn: &Arc<Connection>) {}

    /// Idle-scan notification, `idle_secs` since the last activity
    fn on_idle(&self, _engine: &Engine, _conn: &Arc<Connection>, _idle_secs: u32) {}
}

/// WebSocket process state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsPhase {
    /// Plain HTTP, no upgrade yet
    None = 0,
    /// Upgrade in progress, 101 not acknowledged
    Create = 1,
    /// Framed traffic flowing
    Run = 2,
    /// Close handshake or teardown
    Close = 3,
}

impl WsPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WsPhase::Create,
            2 => WsPhase::Run,
            3 => WsPhase::Close,
            _ => WsPhase::None,
        }
    }
}

/// One side (reader or writer) of a connection slot
pub(crate) struct Side {
    pub(crate) lock: LockCell,
    buf: UnsafeCell<BytesMut>,
}

impl Side {
    fn new() -> Self {
        Self {
            lock: LockCell::new(),
            buf: UnsafeCell::new(BytesMut::new()),
        }
    }

    /// Access the side buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold this side's `lock`; the cell admits one holder,
    /// which makes the returned reference exclusive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn buf(&self) -> &mut BytesMut {
        &mut *self.buf.get()
    }
}

const NO_SOCKET: i32 = -1;

/// A live connection slot
pub struct Connection {
    handle: Handle,
    tag: AtomicU64,
    sock: AtomicI32,
    remote: String,
    pub(crate) rd: Side,
    pub(crate) wr: Side,
    last_error: AtomicU8,
    was_active: AtomicBool,
    last_operation_sec: AtomicU32,
    write_subscribed: AtomicBool,
    closed: AtomicBool,
    ws_phase: AtomicU8,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    pings_unanswered: AtomicU32,
    outgoing: Mutex<VecDeque<Bytes>>,
    handler: Box<dyn ConnHandler>,
}

// SAFETY: the UnsafeCell side buffers are only reached through
// `Side::buf`, whose contract requires holding that side's single-holder
// LockCell; every other field is atomic, immutable or internally locked.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    /// Build a slot around an accepted socket
    pub fn new(
        handle: Handle,
        sock: Socket,
        remote: impl Into<String>,
        handler: Box<dyn ConnHandler>,
    ) -> Self {
        Self {
            handle,
            tag: AtomicU64::new(0),
            sock: AtomicI32::new(sock.raw()),
            remote: remote.into(),
            rd: Side::new(),
            wr: Side::new(),
            last_error: AtomicU8::new(NetResult::Ok as u8),
            was_active: AtomicBool::new(false),
            last_operation_sec: AtomicU32::new(0),
            write_subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ws_phase: AtomicU8::new(WsPhase::None as u8),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            pings_unanswered: AtomicU32::new(0),
            outgoing: Mutex::new(VecDeque::new()),
            handler,
        }
    }

    /// The registry-assigned 31-bit handle
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Textual peer address
    #[inline]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// The poll tag assigned by the registry
    #[inline]
    pub fn tag(&self) -> Tag {
        Tag::new(self.tag.load(Ordering::Acquire))
    }

    pub(crate) fn set_tag(&self, tag: Tag) {
        self.tag.store(tag.value(), Ordering::Release);
    }

    /// The socket, while the connection still owns one
    #[inline]
    pub fn socket(&self) -> Option<Socket> {
        let fd = self.sock.load(Ordering::Acquire);
        if fd == NO_SOCKET {
            None
        } else {
            Some(Socket::from_raw(fd))
        }
    }

    /// Whether the slot still owns a socket
    #[inline]
    pub fn has_socket(&self) -> bool {
        self.sock.load(Ordering::Acquire) != NO_SOCKET
    }

    /// Clear the socket; only the first caller gets it back, and only that
    /// caller may close the descriptor
    pub(crate) fn take_socket(&self) -> Option<Socket> {
        let fd = self.sock.swap(NO_SOCKET, Ordering::AcqRel);
        if fd == NO_SOCKET {
            None
        } else {
            Some(Socket::from_raw(fd))
        }
    }

    /// Non-blocking acquire of one side; marks the connection active
    pub(crate) fn lock(&self, writer: bool) -> bool {
        let ok = self.side(writer).lock.try_enter();
        if ok {
            self.was_active.store(true, Ordering::Relaxed);
        }
        ok
    }

    /// Bounded acquire of one side, aborting once the socket is gone
    pub(crate) fn try_lock_for(&self, writer: bool, timeout_ms: u64) -> bool {
        let ok = self
            .side(writer)
            .lock
            .try_enter_for(timeout_ms, || self.has_socket());
        if ok {
            self.was_active.store(true, Ordering::Relaxed);
        }
        ok
    }

    /// Release one side
    pub(crate) fn unlock(&self, writer: bool) {
        self.side(writer).lock.leave();
    }

    #[inline]
    pub(crate) fn side(&self, writer: bool) -> &Side {
        if writer {
            &self.wr
        } else {
            &self.rd
        }
    }

    /// Last transport error observed before close
    pub fn last_error(&self) -> NetResult {
        NetResult::from(self.last_error.load(Ordering::Relaxed))
    }

    pub(crate) fn set_last_error(&self, res: NetResult) {
        self.last_error.store(res as u8, Ordering::Relaxed);
    }

    /// Take-and-clear the activity flag (idle scanner)
    pub(crate) fn take_active(&self) -> bool {
        self.was_active.swap(false, Ordering::Relaxed)
    }

    /// Seconds-since-start of the last observed activity
    pub fn last_operation_sec(&self) -> u32 {
        self.last_operation_sec.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_operation_sec(&self, sec: u32) {
        self.last_operation_sec.store(sec, Ordering::Relaxed);
    }

    pub(crate) fn write_subscribed(&self) -> &AtomicBool {
        &self.write_subscribed
    }

    /// First caller wins the right to run the close path
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether the close path has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current WebSocket process state
    pub fn ws_phase(&self) -> WsPhase {
        WsPhase::from_u8(self.ws_phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_ws_phase(&self, phase: WsPhase) {
        self.ws_phase.store(phase as u8, Ordering::Release);
    }

    /// Whether a Close frame has been sent to the peer
    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Returns whether this call was the one that set the flag
    pub(crate) fn mark_close_sent(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }

    /// Whether a Close frame has been received from the peer
    pub fn close_received(&self) -> bool {
        self.close_received.load(Ordering::Acquire)
    }

    pub(crate) fn mark_close_received(&self) {
        self.close_received.store(true, Ordering::Release);
    }

    /// Heartbeats sent without a matching Pong
    pub fn pings_unanswered(&self) -> u32 {
        self.pings_unanswered.load(Ordering::Relaxed)
    }

    pub(crate) fn ping_sent(&self) -> u32 {
        self.pings_unanswered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn pong_received(&self) {
        self.pings_unanswered.store(0, Ordering::Relaxed);
    }

    /// Queue a pre-encoded frame for the writer thread's gathering drain;
    /// fails when the optional queue cap would be exceeded
    pub(crate) fn push_outgoing(&self, frame: Bytes, cap: Option<usize>) -> bool {
        let mut queue = self.outgoing.lock();
        if let Some(cap) = cap {
            if queue.len() >= cap {
                return false;
            }
        }
        queue.push_back(frame);
        true
    }

    /// Put an already-taken batch back at the queue head, ahead of frames
    /// queued in the meantime
    pub(crate) fn requeue_outgoing(&self, batch: Bytes) {
        self.outgoing.lock().push_front(batch);
    }

    /// Take every queued outbound frame, concatenated into one buffer
    pub(crate) fn take_outgoing(&self) -> Option<BytesMut> {
        let mut queue = self.outgoing.lock();
        if queue.is_empty() {
            return None;
        }
        let total: usize = queue.iter().map(|b| b.len()).sum();
        let mut jumbo = BytesMut::with_capacity(total);
        while let Some(frame) = queue.pop_front() {
            jumbo.extend_from_slice(&frame);
        }
        Some(jumbo)
    }

    /// Queued outbound frames
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.lock().len()
    }

    /// Shrink idle buffer capacity; takes both side locks non-blocking and
    /// silently skips when either side is busy
    pub(crate) fn release_buffers(&self) {
        if !self.lock(false) {
            return;
        }
        if !self.lock(true) {
            self.unlock(false);
            return;
        }
        // SAFETY: both side locks are held
        unsafe {
            let rd = self.rd.buf();
            if rd.is_empty() && rd.capacity() > 0 {
                *rd = BytesMut::new();
            }
            let wr = self.wr.buf();
            if wr.is_empty() && wr.capacity() > 0 {
                *wr = BytesMut::new();
            }
        }
        self.unlock(true);
        self.unlock(false);
    }

    /// The capability set driving this connection
    #[inline]
    pub(crate) fn handler(&self) -> &dyn ConnHandler {
        self.handler.as_ref()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("remote", &self.remote)
            .field("has_socket", &self.has_socket())
            .field("ws_phase", &self.ws_phase())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::NullHandler;
    use super::*;

    fn slot() -> Connection {
        Connection::new(
            Handle::first(),
            Socket::from_raw(123),
            "127.0.0.1:9",
            Box::new(NullHandler),
        )
    }

    #[test]
    fn socket_clears_once() {
        let conn = slot();
        assert!(conn.has_socket());
        assert_eq!(conn.take_socket(), Some(Socket::from_raw(123)));
        assert_eq!(conn.take_socket(), None);
        assert_eq!(conn.socket(), None);
    }

    #[test]
    fn reader_and_writer_are_orthogonal() {
        let conn = slot();
        assert!(conn.lock(false));
        // Writer side stays available while the reader side is held
        assert!(conn.lock(true));
        assert!(!conn.lock(false));
        assert!(!conn.lock(true));
        conn.unlock(false);
        conn.unlock(true);
    }

    #[test]
    fn lock_acquisition_marks_activity() {
        let conn = slot();
        assert!(!conn.take_active());
        assert!(conn.lock(true));
        conn.unlock(true);
        assert!(conn.take_active());
        assert!(!conn.take_active());
    }

    #[test]
    fn bounded_lock_aborts_without_socket() {
        let conn = slot();
        conn.take_socket();
        assert!(conn.lock(false));
        let start = std::time::Instant::now();
        // Contended acquire must bail out early once the socket is nil
        assert!(!conn.try_lock_for(false, 5_000));
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
        conn.unlock(false);
    }

    #[test]
    fn outgoing_queue_respects_cap() {
        let conn = slot();
        assert!(conn.push_outgoing(Bytes::from_static(b"a"), Some(2)));
        assert!(conn.push_outgoing(Bytes::from_static(b"b"), Some(2)));
        assert!(!conn.push_outgoing(Bytes::from_static(b"c"), Some(2)));
        let jumbo = conn.take_outgoing().unwrap();
        assert_eq!(&jumbo[..], b"ab");
        assert!(conn.take_outgoing().is_none());
    }

    #[test]
    fn close_flags_are_one_shot() {
        let conn = slot();
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(conn.mark_close_sent());
        assert!(!conn.mark_close_sent());
    }
}
