//! Socket slot arena.
//!
//! Six slots, indexed by [`SlotId`]. A slot is handed out as a
//! [`SlotHandle`] carrying the slot's generation; releasing the slot bumps
//! the generation so handles kept past `stop()` are rejected instead of
//! silently reaching whoever owns the slot next.

use std::fmt;
use std::ops::{Index, IndexMut};

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;

use super::timer::SlotTimers;
use crate::config::ShieldConfig;
use crate::error::{Result, ShieldError};
use crate::socket::ConnectionState;

pub const MAX_SLOTS: usize = 6;

/// Index of a shield socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u8);

impl SlotId {
    pub const SSL: SlotId = SlotId(0);
    pub const SSH: SlotId = SlotId(1);
    const FIRST_TCP: u8 = 2;

    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < MAX_SLOTS).then_some(SlotId(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Slots usable for plain TCP.
    pub fn tcp() -> impl Iterator<Item = SlotId> {
        (Self::FIRST_TCP..MAX_SLOTS as u8).map(SlotId)
    }

    pub fn all() -> impl Iterator<Item = SlotId> {
        (0..MAX_SLOTS as u8).map(SlotId)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Claim on a slot, valid until the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    id: SlotId,
    generation: u32,
}

impl SlotHandle {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

/// Fixed-capacity byte FIFO.
#[derive(Debug, Clone)]
pub struct ByteCache {
    buf: BytesMut,
    capacity: usize,
}

impl ByteCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn room(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append as much of `data` as fits. Returns the bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.room());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn last(&self) -> Option<u8> {
        self.buf.last().copied()
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.get_u8())
    }

    /// Move bytes from the front into `out`. Returns the count moved.
    pub fn take_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Length of the leading CRLF-terminated line, terminator included.
    pub fn find_crlf(&self) -> Option<usize> {
        self.buf.windows(2).position(|w| w == b"\r\n").map(|pos| pos + 2)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Host-side shadow of one shield socket.
#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    pub state: ConnectionState,
    /// Bytes the shield holds for this socket, as of the last refresh.
    pub rxlen: usize,
    pub read_cache: ByteCache,
    pub write_cache: ByteCache,
    pub timers: SlotTimers,
    /// Port this slot listens on for a server, if any.
    pub listen_port: Option<u16>,
    generation: u32,
    held: bool,
}

impl Slot {
    fn new(id: SlotId, config: &ShieldConfig) -> Self {
        Self {
            id,
            state: ConnectionState::Closed,
            rxlen: 0,
            read_cache: ByteCache::new(config.read_cache_size),
            write_cache: ByteCache::new(config.write_cache_size),
            timers: SlotTimers::new(config),
            listen_port: None,
            generation: 0,
            held: false,
        }
    }

    /// Free for a new client connection: closed with nothing left to
    /// receive. Decided from cached state only.
    pub fn is_free(&self) -> bool {
        self.state.is_closed()
            && self.rxlen == 0
            && !self.held
            && self.listen_port.is_none()
            && self.read_cache.is_empty()
            && self.write_cache.is_empty()
    }

    /// Drop cached bytes and start over in `state`. Refresh timers only run
    /// for slots that are not closed.
    pub fn reset(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.rxlen = 0;
        self.read_cache.clear();
        self.write_cache.clear();
        if state.is_closed() {
            self.timers.stop_all();
        } else {
            self.timers.start_refresh(now);
        }
    }
}

#[derive(Debug)]
pub struct SlotTable {
    slots: [Slot; MAX_SLOTS],
}

impl SlotTable {
    pub fn new(config: &ShieldConfig) -> Self {
        Self {
            slots: std::array::from_fn(|i| Slot::new(SlotId(i as u8), config)),
        }
    }

    /// First free slot among `candidates`.
    pub fn find_free(&self, mut candidates: impl Iterator<Item = SlotId>) -> Option<SlotId> {
        candidates.find(|&id| self[id].is_free())
    }

    pub fn acquire(&mut self, id: SlotId) -> SlotHandle {
        let slot = &mut self[id];
        slot.held = true;
        SlotHandle {
            id,
            generation: slot.generation,
        }
    }

    /// Invalidate every handle to `id`.
    pub fn release(&mut self, id: SlotId) {
        let slot = &mut self[id];
        slot.held = false;
        slot.generation = slot.generation.wrapping_add(1);
    }

    pub fn check(&self, handle: SlotHandle) -> Result<SlotId> {
        let slot = &self[handle.id];
        if slot.held && slot.generation == handle.generation {
            Ok(handle.id)
        } else {
            Err(ShieldError::StaleHandle)
        }
    }
}

impl Index<SlotId> for SlotTable {
    type Output = Slot;

    fn index(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }
}

impl IndexMut<SlotId> for SlotTable {
    fn index_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id.index()]
    }
}
