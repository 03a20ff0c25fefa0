//! Facility (i): readiness poller over the platform's native mechanism
//!
//! Backed by `mio` (epoll on Linux, kqueue on BSD/macOS). Subscriptions go
//! through cloned `Registry` handles and are safe while another thread is
//! blocked inside `wait_for_modified`, so the multiplexer applies
//! modifications directly instead of deferring them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use parking_lot::Mutex;
use tracing::trace;

use super::{EventSet, PollEvent, Poller, Tag};
use crate::socket::Socket;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;

struct WaitState {
    poll: mio::Poll,
    events: Events,
}

/// Concurrent-modification-safe poller (epoll model)
pub struct ReadinessPoller {
    wait: Mutex<WaitState>,
    registry: mio::Registry,
    waker: mio::Waker,
    terminated: AtomicBool,
}

impl ReadinessPoller {
    /// Create the poller; fails only when the OS facility cannot be opened
    pub fn new() -> std::io::Result<Self> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            wait: Mutex::new(WaitState {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
            }),
            registry,
            waker,
            terminated: AtomicBool::new(false),
        })
    }

    fn interests(events: EventSet) -> Interest {
        match (events.has_read(), events.has_write()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // Error/Closed are always reported; reads are the default arm
            _ => Interest::READABLE,
        }
    }
}

impl Poller for ReadinessPoller {
    fn subscribe(&self, sock: Socket, events: EventSet, tag: Tag) -> bool {
        let fd = sock.raw();
        let token = Token(tag.value() as usize);
        let interests = Self::interests(events);
        let mut source = SourceFd(&fd);
        match self.registry.register(&mut source, token, interests) {
            Ok(()) => true,
            Err(_) => {
                // Already registered from a previous subscription on the
                // same descriptor; refresh the interest set instead
                self.registry
                    .reregister(&mut source, token, interests)
                    .is_ok()
            }
        }
    }

    fn unsubscribe(&self, sock: Socket) -> bool {
        let fd = sock.raw();
        self.registry.deregister(&mut SourceFd(&fd)).is_ok()
    }

    fn wait_for_modified(&self, out: &mut Vec<PollEvent>, timeout_ms: u64) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.wait.lock();
        let WaitState { poll, events } = &mut *state;
        match poll.poll(events, Some(Duration::from_millis(timeout_ms))) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return false,
            Err(e) => {
                trace!(error = %e, "readiness wait failed");
                return false;
            }
        }
        let mut produced = false;
        for ev in events.iter() {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            let mut set = EventSet::NONE;
            if ev.is_readable() {
                set |= EventSet::READ;
            }
            if ev.is_writable() {
                set |= EventSet::WRITE;
            }
            if ev.is_error() {
                set |= EventSet::ERROR;
            }
            if ev.is_read_closed() || ev.is_write_closed() {
                set |= EventSet::CLOSED;
            }
            if set.is_empty() {
                continue;
            }
            out.push(PollEvent::new(Tag::new(ev.token().0 as u64), set));
            produced = true;
        }
        produced
    }

    fn max_sockets(&self) -> usize {
        usize::MAX
    }

    fn follow_epoll(&self) -> bool {
        true
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}
