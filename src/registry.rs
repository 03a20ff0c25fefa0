//! Connection registry
//!
//! Live connections are kept in a vector sorted by handle (appends keep it
//! sorted because handles are monotonic) for O(log n) lookups, plus a slab
//! of generation-tagged slots that resolves poll tags in O(1) and rejects
//! stale tags after a slot has been recycled.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use slab::Slab;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::poll::Tag;

/// 31-bit positive connection identifier; zero is "not a connection"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Largest assignable handle
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// The first handle a registry hands out
    pub fn first() -> Self {
        Handle(1)
    }

    /// Raw value
    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// Tag layout: low 24 bits slot key, next 32 bits generation (56 total)
const KEY_BITS: u32 = 24;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

fn pack(key: usize, gen: u32) -> Tag {
    Tag::new(((gen as u64) << KEY_BITS) | (key as u64 & KEY_MASK))
}

fn unpack(tag: Tag) -> (usize, u32) {
    let v = tag.value();
    ((v & KEY_MASK) as usize, (v >> KEY_BITS) as u32)
}

struct Inner {
    slots: Slab<Arc<Connection>>,
    gens: Vec<u32>,
    live: Vec<Arc<Connection>>,
}

/// Registry of live connections (component F)
pub struct Registry {
    inner: RwLock<Inner>,
    last_handle: AtomicU32,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: Slab::new(),
                gens: Vec::new(),
                live: Vec::new(),
            }),
            last_handle: AtomicU32::new(0),
        }
    }

    /// Allocate the next handle; strictly greater than every prior one
    pub fn next_handle(&self) -> Result<Handle> {
        let h = self.last_handle.fetch_add(1, Ordering::AcqRel) + 1;
        if h > Handle::MAX {
            return Err(Error::HandleOverflow);
        }
        Ok(Handle(h))
    }

    /// Insert a connection, assigning its generation-tagged poll tag
    pub fn insert(&self, conn: Arc<Connection>) -> Result<Tag> {
        let mut inner = self.inner.write();
        let key = inner.slots.insert(conn.clone());
        if key as u64 > KEY_MASK {
            inner.slots.remove(key);
            return Err(Error::HandleOverflow);
        }
        if key >= inner.gens.len() {
            inner.gens.resize(key + 1, 0);
        }
        let tag = pack(key, inner.gens[key]);
        conn.set_tag(tag);
        inner.live.push(conn);
        debug_assert!(inner
            .live
            .windows(2)
            .all(|w| w[0].handle() < w[1].handle()));
        Ok(tag)
    }

    /// Resolve a poll tag to its connection; stale generations return None
    pub fn resolve(&self, tag: Tag) -> Option<Arc<Connection>> {
        let (key, gen) = unpack(tag);
        let inner = self.inner.read();
        if inner.gens.get(key).copied() != Some(gen) {
            return None;
        }
        inner.slots.get(key).cloned()
    }

    /// Remove a connection; bumping the slot generation invalidates every
    /// outstanding tag for it
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let (key, gen) = unpack(conn.tag());
        let mut inner = self.inner.write();
        if inner.gens.get(key).copied() != Some(gen) {
            return false;
        }
        inner.gens[key] = gen.wrapping_add(1);
        inner.slots.try_remove(key);
        let handle = conn.handle();
        if let Ok(i) = inner.live.binary_search_by_key(&handle, |c| c.handle()) {
            inner.live.remove(i);
        }
        true
    }

    /// O(log n) lookup by handle
    pub fn find(&self, handle: Handle) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        inner
            .live
            .binary_search_by_key(&handle, |c| c.handle())
            .ok()
            .map(|i| inner.live[i].clone())
    }

    /// Copy the live set under the read lock, for unlocked processing
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().live.clone()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.inner.read().live.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
