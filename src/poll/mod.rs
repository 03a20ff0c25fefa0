//! Readiness-polling abstraction
//!
//! Two facilities implement the same [`Poller`] contract:
//!
//! - [`ReadinessPoller`] wraps the platform's best notification mechanism
//!   (epoll/kqueue via mio) and tolerates subscribe/unsubscribe while a wait
//!   is in progress; a single instance serves any number of sockets.
//! - [`SnapshotPoller`] wraps `poll(2)` over a bounded slot array and
//!   requires a consistent snapshot, so every modification must be deferred
//!   by the multiplexer between waits.
//!
//! Results are dense arrays of opaque [`PollEvent`]s: a 56-bit caller tag
//! plus an [`EventSet`] in the top byte.

mod readiness;
mod snapshot;

pub use readiness::ReadinessPoller;
pub use snapshot::SnapshotPoller;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::socket::Socket;

/// Set over {Read, Write, Error, Closed}
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    /// Empty set
    pub const NONE: EventSet = EventSet(0);
    /// Socket readable
    pub const READ: EventSet = EventSet(1);
    /// Socket writable
    pub const WRITE: EventSet = EventSet(1 << 1);
    /// Transport error pending
    pub const ERROR: EventSet = EventSet(1 << 2);
    /// Peer closed
    pub const CLOSED: EventSet = EventSet(1 << 3);

    /// No events present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Contains `Read`
    #[inline]
    pub fn has_read(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Contains `Write`
    #[inline]
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Contains `Error`
    #[inline]
    pub fn has_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Contains `Closed`
    #[inline]
    pub fn has_closed(&self) -> bool {
        self.0 & Self::CLOSED.0 != 0
    }

    /// Raw bits (low 4 used)
    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Rebuild from raw bits
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        EventSet(bits & 0x0F)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    #[inline]
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.has_read() {
            parts.push("Read");
        }
        if self.has_write() {
            parts.push("Write");
        }
        if self.has_error() {
            parts.push("Error");
        }
        if self.has_closed() {
            parts.push("Closed");
        }
        write!(f, "{{{}}}", parts.join("|"))
    }
}

/// Opaque 56-bit correlation value carried through the poller
///
/// Upper layers pack whatever they need into it (the registry packs a slot
/// index plus a generation counter); the pollers never interpret it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Largest representable tag value
    pub const MAX: u64 = (1 << 56) - 1;

    /// Build a tag, truncating to 56 bits
    #[inline]
    pub fn new(value: u64) -> Self {
        Tag(value & Self::MAX)
    }

    /// Raw value
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#x})", self.0)
    }
}

/// One readiness notification: tag in the low 56 bits, events in the top 8
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PollEvent(u64);

impl PollEvent {
    /// Pack a tag and an event set
    #[inline]
    pub fn new(tag: Tag, events: EventSet) -> Self {
        PollEvent(tag.value() | ((events.bits() as u64) << 56))
    }

    /// The caller tag
    #[inline]
    pub fn tag(&self) -> Tag {
        Tag::new(self.0)
    }

    /// The event set
    #[inline]
    pub fn events(&self) -> EventSet {
        EventSet::from_bits((self.0 >> 56) as u8)
    }

    /// Drop all events, cancelling the notification in place
    #[inline]
    pub fn clear_events(&mut self) {
        self.0 &= Tag::MAX;
    }

    /// Add events to an already-queued notification
    #[inline]
    pub fn merge_events(&mut self, events: EventSet) {
        self.0 |= (events.bits() as u64) << 56;
    }
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PollEvent({:?}, {:?})", self.tag(), self.events())
    }
}

/// One OS readiness facility
///
/// Implementations report their capability profile through
/// [`Poller::follow_epoll`] and [`Poller::max_sockets`]; the multiplexer
/// adapts its modification strategy accordingly.
pub trait Poller: Send + Sync {
    /// Track `sock` for `events`, delivering `tag` on readiness
    fn subscribe(&self, sock: Socket, events: EventSet, tag: Tag) -> bool;

    /// Stop tracking `sock`
    fn unsubscribe(&self, sock: Socket) -> bool;

    /// Wait up to `timeout_ms` and append notifications to `out`;
    /// returns whether any were produced
    fn wait_for_modified(&self, out: &mut Vec<PollEvent>, timeout_ms: u64) -> bool;

    /// Facility cap on tracked sockets
    fn max_sockets(&self) -> usize;

    /// Whether modifications are safe while a wait is in progress
    fn follow_epoll(&self) -> bool;

    /// Ask all waiters to return at the next safe point
    fn terminate(&self);
}
