//! Per-socket caching.
//!
//! Every byte to or from a socket would otherwise cost a command round trip
//! over SPI. Each slot keeps a small read cache, a small write cache and a
//! shadow of the shield's receivable length and connection state. The
//! shadows are refreshed by timers, so tight `available()` loops cost
//! nothing until a timer fires.

mod slot;
mod timer;

pub use slot::{ByteCache, Slot, SlotHandle, SlotId, SlotTable, MAX_SLOTS};
pub use timer::{CacheTimer, SlotTimers, TimerState};

use bitflags::bitflags;
use tokio::time::Instant;

use crate::error::Result;
use crate::hw_trait::Spi;
use crate::protocol::cmd;
use crate::shield::Shield;
use crate::socket::ConnectionState;
use crate::tracing::prelude::*;

pub const DEFAULT_READ_CACHE: usize = 18;
pub const DEFAULT_WRITE_CACHE: usize = 16;

bitflags! {
    /// Refreshes to perform now, regardless of timers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Renew: u8 {
        const RXLEN = 0x01;
        const STATE = 0x02;
        const WRITE = 0x04;
    }
}

impl<S: Spi> Shield<S> {
    /// Clear a slot's caches and shadows and set its state.
    pub(crate) fn reset_slot(&mut self, id: SlotId, state: ConnectionState) {
        self.slots[id].reset(state, Instant::now());
    }

    /// Service a slot: refresh due shadows, flush a due write cache and
    /// refill an empty read cache.
    pub(crate) async fn update(&mut self, id: SlotId, renew: Renew) -> Result<()> {
        let now = Instant::now();
        let timers = &mut self.slots[id].timers;
        if renew.contains(Renew::RXLEN) {
            timers.rxlen.fire();
        }
        if renew.contains(Renew::STATE) {
            timers.state.fire();
        }
        if renew.contains(Renew::WRITE) {
            timers.write.fire();
        }
        let rxlen_due = timers.rxlen.take_fired(now);
        let state_due = timers.state.take_fired(now);
        let write_due = timers.write.take_fired(now);

        if rxlen_due {
            self.refresh_rxlen(id).await;
        }
        if state_due {
            self.refresh_state(id).await;
        }
        if write_due {
            self.flush_write_cache(id).await?;
        }

        let slot = &self.slots[id];
        if slot.read_cache.is_empty() && slot.rxlen > 0 {
            self.top_up(id).await?;
        }
        Ok(())
    }

    async fn refresh_rxlen(&mut self, id: SlotId) {
        let verb = self.engine.codec().get_verb();
        let rxlen = match self.engine.query_int(cmd!("tcp{} {} rxlen", id, verb)).await {
            Ok(len) => len as usize,
            Err(_) => 0,
        };
        let slot = &mut self.slots[id];
        slot.rxlen = rxlen;
        slot.timers.rxlen.start(Instant::now());
        trace!(slot = %id, rxlen, "Refreshed receive length");
    }

    async fn refresh_state(&mut self, id: SlotId) {
        let state = match self.query_state(id).await {
            Ok(state) => state,
            Err(_) => ConnectionState::Closed,
        };
        let slot = &mut self.slots[id];
        if slot.state != state {
            debug!(slot = %id, from = %slot.state, to = %state, "Socket state changed");
        }
        slot.state = state;
        slot.timers.state.start(Instant::now());
    }

    /// Ask the shield for a slot's state, bypassing the shadow.
    pub(crate) async fn query_state(&mut self, id: SlotId) -> Result<ConnectionState> {
        let verb = self.engine.codec().get_verb();
        let raw = self.engine.query_int(cmd!("tcp{} {} state", id, verb)).await?;
        Ok(ConnectionState::from_raw(raw as u16, id.role()))
    }

    /// Fill the read cache's free room from the wire.
    async fn top_up(&mut self, id: SlotId) -> Result<()> {
        let room = self.slots[id].read_cache.room();
        if room == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; room];
        let n = self.recv(id, &mut buf).await?;
        self.slots[id].read_cache.push(&buf[..n]);
        self.refresh_rxlen(id).await;
        Ok(())
    }

    /// Receive straight from the shield into `buf`.
    async fn recv(&mut self, id: SlotId, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len().min(self.engine.codec().max_payload());
        let len = self.engine.command(cmd!("tcp{} recv {}", id, want)).await?;
        let n = self.engine.read(&mut buf[..len.min(want)]).await?;
        if len > n {
            self.engine.discard().await?;
        }
        Ok(n)
    }

    /// One byte from the wire without consuming it.
    async fn peek_wire(&mut self, id: SlotId) -> Result<Option<u8>> {
        let len = self.engine.command(cmd!("tcp{} peek 1", id)).await?;
        if len == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        let n = self.engine.read(&mut byte).await?;
        if len > n {
            self.engine.discard().await?;
        }
        Ok((n == 1).then_some(byte[0]))
    }

    /// Bytes readable now: cached plus receivable.
    pub(crate) async fn cache_available(&mut self, id: SlotId) -> Result<usize> {
        self.update(id, Renew::empty()).await?;
        let slot = &self.slots[id];
        Ok(slot.read_cache.len() + slot.rxlen)
    }

    pub(crate) async fn cache_peek(&mut self, id: SlotId) -> Result<Option<u8>> {
        self.update(id, Renew::empty()).await?;
        Ok(self.slots[id].read_cache.peek())
    }

    pub(crate) async fn cache_read_byte(&mut self, id: SlotId) -> Result<Option<u8>> {
        self.update(id, Renew::empty()).await?;
        Ok(self.slots[id].read_cache.pop())
    }

    /// Read from the cache first, then the wire for the remainder.
    pub(crate) async fn cache_read(&mut self, id: SlotId, buf: &mut [u8]) -> Result<usize> {
        self.update(id, Renew::empty()).await?;
        let mut copied = self.slots[id].read_cache.take_into(buf);

        if copied < buf.len() && self.slots[id].rxlen > 0 {
            match self.recv(id, &mut buf[copied..]).await {
                Ok(n) => copied += n,
                Err(e) if copied == 0 => return Err(e),
                Err(e) => debug!(slot = %id, error = %e, "Receive failed after cached bytes"),
            }
            self.refresh_rxlen(id).await;
        }
        Ok(copied)
    }

    /// Read one CRLF-terminated line into `buf`, terminator included.
    ///
    /// A line longer than `buf` is truncated and its excess dropped. A full
    /// cache without a terminator is returned whole so the caller is never
    /// stuck behind a line longer than the cache. Returns 0 while no line is
    /// complete.
    pub(crate) async fn cache_read_line(&mut self, id: SlotId, buf: &mut [u8]) -> Result<usize> {
        self.update(id, Renew::empty()).await?;

        let slot = &self.slots[id];
        if slot.read_cache.find_crlf().is_none() && !slot.read_cache.is_full() && slot.rxlen > 0 {
            self.top_up(id).await?;
        }

        if let Some(end) = self.slots[id].read_cache.find_crlf() {
            let cache = &mut self.slots[id].read_cache;
            let n = end.min(buf.len());
            cache.take_into(&mut buf[..n]);
            cache.discard(end - n);
            return Ok(n);
        }

        // CR at the cache boundary: the LF may still be on the wire.
        if self.slots[id].read_cache.last() == Some(b'\r') && self.slots[id].rxlen > 0 {
            if self.peek_wire(id).await? == Some(b'\n') {
                let mut lf = [0u8; 1];
                self.recv(id, &mut lf).await?;
                self.refresh_rxlen(id).await;

                let cache = &mut self.slots[id].read_cache;
                let cached = cache.len();
                let n = cache.take_into(buf);
                cache.clear();
                if n == cached && n < buf.len() {
                    buf[n] = b'\n';
                    return Ok(n + 1);
                }
                return Ok(n);
            }
        }

        let cache = &mut self.slots[id].read_cache;
        if cache.is_full() {
            debug!(slot = %id, len = cache.len(), "No line terminator in full read cache");
            let n = cache.take_into(buf);
            cache.clear();
            return Ok(n);
        }
        Ok(0)
    }

    /// Queue `data` for sending. Bytes reach the shield when the write cache
    /// fills, when the write timer fires or on an explicit flush.
    pub(crate) async fn cache_write(&mut self, id: SlotId, data: &[u8]) -> Result<usize> {
        let capacity = self.slots[id].write_cache.capacity();
        let mut rest = data;

        if self.slots[id].write_cache.len() + rest.len() >= capacity {
            let taken = self.slots[id].write_cache.push(rest);
            rest = &rest[taken..];
            self.flush_write_cache(id).await?;

            while rest.len() >= capacity {
                let sent = self.send_chunk(id, rest).await?;
                if sent == 0 {
                    break;
                }
                rest = &rest[sent..];
            }
        }

        if !rest.is_empty() {
            let slot = &mut self.slots[id];
            slot.write_cache.push(rest);
            if !slot.timers.write.is_running() {
                slot.timers.write.start(Instant::now());
            }
        }

        self.update(id, Renew::empty()).await?;
        Ok(data.len())
    }

    /// Send whatever the write cache holds.
    pub(crate) async fn flush_write_cache(&mut self, id: SlotId) -> Result<()> {
        let pending = {
            let slot = &mut self.slots[id];
            slot.timers.write.stop();
            slot.write_cache.take_all()
        };
        let mut rest = &pending[..];
        while !rest.is_empty() {
            let sent = self.send_chunk(id, rest).await?;
            if sent == 0 {
                break;
            }
            rest = &rest[sent..];
        }
        Ok(())
    }

    /// One `send` command with a data frame of at most one payload.
    async fn send_chunk(&mut self, id: SlotId, data: &[u8]) -> Result<usize> {
        let len = data.len().min(self.engine.codec().max_payload());
        self.engine
            .command_with_data(cmd!("tcp{} send", id), &[&data[..len]])
            .await?;
        trace!(slot = %id, len, "Sent socket data");
        Ok(len)
    }
}
