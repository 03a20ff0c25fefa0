//! Poll multiplexer: fans one or more pollers into a thread-safe queue of
//! pending events
//!
//! On the readiness facility a single poller instance accepts direct
//! subscribe/unsubscribe calls. On the snapshot facility modifications are
//! enqueued behind a light lock and applied at the head of the next
//! `poll_for_pending_events`, growing additional pollers when every existing
//! one is at capacity. Events returned by a wait are merged into one central
//! pending list consumed by `get_one_pending`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::poll::{EventSet, PollEvent, Poller, ReadinessPoller, SnapshotPoller, Tag};
use crate::socket::Socket;

/// Which OS facility backs the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    /// epoll/kqueue model: direct modification, single poller
    Readiness,
    /// select/poll model: deferred modification, growable poller set
    Snapshot,
}

/// Pending-event queue: an ordered array plus a consume index.
/// `events.len() - index` is the number of notifications still to deliver;
/// the index only moves forward until the next vacuum.
#[derive(Default)]
struct Pending {
    events: Vec<PollEvent>,
    index: usize,
}

impl Pending {
    fn outstanding(&self) -> usize {
        self.events.len() - self.index
    }
}

#[derive(Default)]
struct Subscription {
    subscribe: Vec<(Socket, EventSet, Tag)>,
    unsubscribe: Vec<(Socket, Tag)>,
}

/// Thread-safe poller aggregation (component C)
pub struct PollSockets {
    pollers: RwLock<Vec<Arc<dyn Poller>>>,
    facility: Facility,
    pending: Mutex<Pending>,
    subscription: Mutex<Subscription>,
    poll_lock: Mutex<()>,
    terminated: AtomicBool,
    unsubscribe_closes_socket: bool,
}

impl PollSockets {
    /// Build a multiplexer over the requested facility
    pub fn new(facility: Facility, unsubscribe_closes_socket: bool) -> Result<Self> {
        let first: Arc<dyn Poller> = match facility {
            Facility::Readiness => Arc::new(ReadinessPoller::new()?),
            Facility::Snapshot => Arc::new(SnapshotPoller::new()),
        };
        Ok(Self {
            pollers: RwLock::new(vec![first]),
            facility,
            pending: Mutex::new(Pending::default()),
            subscription: Mutex::new(Subscription::default()),
            poll_lock: Mutex::new(()),
            terminated: AtomicBool::new(false),
            unsubscribe_closes_socket,
        })
    }

    /// Whether direct poller modification is safe on this facility
    #[inline]
    pub fn follow_epoll(&self) -> bool {
        self.facility == Facility::Readiness
    }

    /// Whether `terminate` has been requested
    #[inline]
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Notifications currently queued and not yet consumed
    pub fn pending_count(&self) -> usize {
        self.pending.lock().outstanding()
    }

    /// Start tracking `sock`; immediate on the readiness facility,
    /// deferred to the next poll cycle on the snapshot facility
    pub fn subscribe(&self, sock: Socket, events: EventSet, tag: Tag) -> bool {
        if self.terminated() {
            return false;
        }
        if self.follow_epoll() {
            self.pollers.read()[0].subscribe(sock, events, tag)
        } else {
            self.subscription.lock().subscribe.push((sock, events, tag));
            true
        }
    }

    /// Stop tracking `sock` and cancel any queued notification for `tag`
    pub fn unsubscribe(&self, sock: Socket, tag: Tag) -> bool {
        self.delete_one_pending(tag);
        if self.follow_epoll() {
            let ok = self.pollers.read()[0].unsubscribe(sock);
            if self.unsubscribe_closes_socket {
                sock.shutdown_and_close(true);
            }
            ok
        } else {
            self.subscription.lock().unsubscribe.push((sock, tag));
            true
        }
    }

    /// Wait on the pollers and merge the results into the pending queue;
    /// returns the number of newly queued notifications
    pub fn poll_for_pending_events(&self, timeout_ms: u64) -> usize {
        if self.terminated() {
            return 0;
        }
        if !self.follow_epoll() {
            self.apply_deferred();
        }
        // One waiter at a time; contenders nap instead of piling up on the
        // facility so they can keep consuming already-pending events
        let guard = match self.poll_lock.try_lock() {
            Some(g) => g,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                return 0;
            }
        };
        let mut fresh = Vec::new();
        {
            let pollers = self.pollers.read();
            let per_poller = (timeout_ms / pollers.len() as u64).max(1);
            for poller in pollers.iter() {
                if self.terminated() {
                    break;
                }
                poller.wait_for_modified(&mut fresh, per_poller);
            }
        }
        drop(guard);
        if fresh.is_empty() {
            return 0;
        }
        self.merge_pending(fresh)
    }

    /// Pop the next pending notification, skipping cancelled ones
    pub fn get_one_pending(&self, out: &mut PollEvent) -> bool {
        let mut pending = self.pending.lock();
        while pending.index < pending.events.len() {
            let ev = pending.events[pending.index];
            pending.index += 1;
            if !ev.events().is_empty() {
                *out = ev;
                return true;
            }
        }
        false
    }

    /// Get one notification, polling the facility when the queue is dry
    pub fn get_one(&self, timeout_ms: u64, out: &mut PollEvent) -> bool {
        if self.get_one_pending(out) {
            return true;
        }
        if timeout_ms == 0 {
            return false;
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.terminated() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining_ms = (deadline - now).as_millis() as u64;
            // The snapshot facility needs short waits so subscription churn
            // is applied promptly; readiness can block out the deadline
            let quantum = if self.follow_epoll() { remaining_ms } else { 10 };
            self.poll_for_pending_events(quantum.max(1));
            if self.get_one_pending(out) {
                return true;
            }
        }
    }

    /// Queue (or re-queue) a notification by hand
    ///
    /// With `search_existing`, an already-queued notification for the same
    /// tag absorbs the events instead of a duplicate entry being appended.
    pub fn add_one_pending(&self, tag: Tag, events: EventSet, search_existing: bool) {
        let mut pending = self.pending.lock();
        if search_existing {
            let start = pending.index;
            if let Some(ev) = pending.events[start..]
                .iter_mut()
                .find(|e| e.tag() == tag && !e.events().is_empty())
            {
                ev.merge_events(events);
                return;
            }
        }
        pending.events.push(PollEvent::new(tag, events));
    }

    /// Cancel every queued notification for `tag`
    pub fn delete_one_pending(&self, tag: Tag) {
        let mut pending = self.pending.lock();
        let start = pending.index;
        for ev in pending.events[start..].iter_mut() {
            if ev.tag() == tag {
                ev.clear_events();
            }
        }
    }

    /// Cancel queued notifications for several tags; returns how many
    /// entries were cleared
    pub fn delete_several_pending(&self, tags: &[Tag]) -> usize {
        let mut pending = self.pending.lock();
        let start = pending.index;
        let mut cleared = 0;
        for ev in pending.events[start..].iter_mut() {
            if !ev.events().is_empty() && tags.contains(&ev.tag()) {
                ev.clear_events();
                cleared += 1;
            }
        }
        cleared
    }

    /// Flip the flag observed by every wait loop and wake the pollers
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        for poller in self.pollers.read().iter() {
            poller.terminate();
        }
    }

    fn merge_pending(&self, mut fresh: Vec<PollEvent>) -> usize {
        // A wait snapshot taken before an unsubscribe was applied can still
        // produce events for that tag; drop them here so nothing is
        // delivered once unsubscribe() has been called
        if !self.follow_epoll() {
            let queue = self.subscription.lock();
            if !queue.unsubscribe.is_empty() {
                fresh.retain(|ev| !queue.unsubscribe.iter().any(|(_, t)| *t == ev.tag()));
            }
        }
        if fresh.is_empty() {
            return 0;
        }
        let mut pending = self.pending.lock();
        if pending.outstanding() == 0 {
            // Nothing left to consume: replace by move
            let n = fresh.len();
            pending.events = fresh;
            pending.index = 0;
            return n;
        }
        // Vacuum consumed entries, then append only tags not already
        // pending (O(n) scan; pending stays small in steady state)
        let index = pending.index;
        pending.events.drain(..index);
        pending.index = 0;
        let mut added = 0;
        for ev in fresh {
            let duplicate = pending
                .events
                .iter()
                .any(|e| e.tag() == ev.tag() && !e.events().is_empty());
            if !duplicate {
                pending.events.push(ev);
                added += 1;
            }
        }
        added
    }

    /// Drain the deferred queues: unsubscribes first (closing sockets when
    /// configured), then subscribes placed into the first poller with a
    /// free slot, growing a new poller when all are full
    fn apply_deferred(&self) {
        let (mut subs, mut unsubs) = {
            let mut queue = self.subscription.lock();
            if queue.subscribe.is_empty() && queue.unsubscribe.is_empty() {
                return;
            }
            (
                std::mem::take(&mut queue.subscribe),
                std::mem::take(&mut queue.unsubscribe),
            )
        };

        // A subscribe/unsubscribe pair for the same socket in one batch:
        // when the unsubscribe does not have to shut the socket down, both
        // sides cancel; otherwise the unsubscribe (and close) is honored
        // and the subscribe is dropped.
        unsubs.retain(|(sock, _)| {
            let had_sub = subs.iter().any(|(s, _, _)| s == sock);
            if had_sub {
                subs.retain(|(s, _, _)| s != sock);
            }
            !had_sub || self.unsubscribe_closes_socket
        });

        let mut pollers = self.pollers.write();
        for (sock, tag) in unsubs {
            for poller in pollers.iter() {
                if poller.unsubscribe(sock) {
                    break;
                }
            }
            self.delete_one_pending(tag);
            if self.unsubscribe_closes_socket {
                sock.shutdown_and_close(true);
            }
        }
        'subs: for (sock, events, tag) in subs {
            for poller in pollers.iter() {
                if poller.subscribe(sock, events, tag) {
                    continue 'subs;
                }
            }
            let grown: Arc<dyn Poller> = Arc::new(SnapshotPoller::new());
            grown.subscribe(sock, events, tag);
            pollers.push(grown);
        }
    }
}
