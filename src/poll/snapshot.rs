//! Facility (ii): snapshot poller over `poll(2)`
//!
//! A bounded slot array polled with a consistent snapshot. The facility is
//! **not** safe against modification during a wait, so the multiplexer owns
//! a deferred subscribe/unsubscribe queue and applies it between waits; this
//! type only checks the contract, it does not enforce serialization itself.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{EventSet, PollEvent, Poller, Tag};
use crate::socket::Socket;

/// Default per-instance socket cap; the multiplexer grows a new poller
/// once every existing one is full
pub const DEFAULT_MAX_SOCKETS: usize = 512;

struct Slot {
    fd: libc::c_int,
    events: libc::c_short,
    tag: Tag,
}

/// Snapshot-based poller (select/poll model)
pub struct SnapshotPoller {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
    terminated: AtomicBool,
}

impl SnapshotPoller {
    /// Poller with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SOCKETS)
    }

    /// Poller with an explicit slot cap
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity,
            terminated: AtomicBool::new(false),
        }
    }

    /// Currently tracked sockets
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// No tracked sockets
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn interest_bits(events: EventSet) -> libc::c_short {
        let mut bits: libc::c_short = 0;
        if events.has_read() {
            bits |= libc::POLLIN;
        }
        if events.has_write() {
            bits |= libc::POLLOUT;
        }
        bits
    }
}

impl Default for SnapshotPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for SnapshotPoller {
    fn subscribe(&self, sock: Socket, events: EventSet, tag: Tag) -> bool {
        let mut slots = self.slots.lock();
        let bits = Self::interest_bits(events);
        if let Some(slot) = slots.iter_mut().find(|s| s.fd == sock.raw()) {
            slot.events |= bits;
            slot.tag = tag;
            return true;
        }
        if slots.len() >= self.capacity {
            return false;
        }
        slots.push(Slot {
            fd: sock.raw(),
            events: bits,
            tag,
        });
        true
    }

    fn unsubscribe(&self, sock: Socket) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter().position(|s| s.fd == sock.raw()) {
            Some(i) => {
                slots.swap_remove(i);
                true
            }
            None => false,
        }
    }

    fn wait_for_modified(&self, out: &mut Vec<PollEvent>, timeout_ms: u64) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        // Snapshot under the lock, wait outside it
        let (mut fds, tags): (Vec<libc::pollfd>, Vec<Tag>) = {
            let slots = self.slots.lock();
            (
                slots
                    .iter()
                    .map(|s| libc::pollfd {
                        fd: s.fd,
                        events: s.events,
                        revents: 0,
                    })
                    .collect(),
                slots.iter().map(|s| s.tag).collect(),
            )
        };
        if fds.is_empty() {
            // Keep the wait quantum even with nothing tracked, so callers
            // do not spin while the subscribe queue fills
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.min(50)));
            return false;
        }
        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms.min(i32::MAX as u64) as libc::c_int,
            )
        };
        if n <= 0 {
            return false;
        }
        let mut produced = false;
        for (pfd, tag) in fds.iter().zip(tags.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            let mut set = EventSet::NONE;
            if pfd.revents & libc::POLLIN != 0 {
                set |= EventSet::READ;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                set |= EventSet::WRITE;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                set |= EventSet::ERROR;
            }
            if pfd.revents & libc::POLLHUP != 0 {
                set |= EventSet::CLOSED;
            }
            if set.is_empty() {
                continue;
            }
            out.push(PollEvent::new(*tag, set));
            produced = true;
        }
        produced
    }

    fn max_sockets(&self) -> usize {
        self.capacity
    }

    fn follow_epoll(&self) -> bool {
        false
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}
