//! Outgoing TCP and SSL connections.

use std::net::{IpAddr, SocketAddr};

use crate::cache::{Renew, SlotHandle, SlotId};
use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::poll::Backoff;
use crate::protocol::cmd;
use crate::shield::Shield;
use crate::socket::ConnectionState;
use crate::tracing::prelude::*;

/// A connection on one shield socket.
///
/// Borrows the shield for as long as it is used; the underlying slot stays
/// claimed until [`Client::stop`], so a handle can be parked with
/// [`Client::into_handle`] and picked up again with [`Client::attach`].
pub struct Client<'a, S: Spi> {
    shield: &'a mut Shield<S>,
    handle: Option<SlotHandle>,
}

impl<'a, S: Spi> Client<'a, S> {
    pub fn new(shield: &'a mut Shield<S>) -> Self {
        Self { shield, handle: None }
    }

    /// Resume a connection from a handle.
    pub fn attach(shield: &'a mut Shield<S>, handle: SlotHandle) -> Result<Self> {
        shield.slots.check(handle)?;
        Ok(Self {
            shield,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> Option<SlotHandle> {
        self.handle
    }

    pub fn into_handle(self) -> Option<SlotHandle> {
        self.handle
    }

    fn slot(&self) -> Result<SlotId> {
        let handle = self.handle.ok_or(ShieldError::StaleHandle)?;
        self.shield.slots.check(handle)
    }

    fn ensure_idle(&mut self) -> Result<()> {
        if let Some(handle) = self.handle {
            if self.shield.slots.check(handle).is_ok() {
                return Err(ShieldError::InUse);
            }
            self.handle = None;
        }
        Ok(())
    }

    /// Connect to `host`, resolving it first unless it is a literal
    /// address.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.ensure_idle()?;
        let ip = self.shield.resolve(host).await?;
        self.connect_addr(ip, port).await
    }

    pub async fn connect_addr(&mut self, ip: IpAddr, port: u16) -> Result<()> {
        self.ensure_idle()?;
        let id = self
            .shield
            .slots
            .find_free(SlotId::tcp())
            .ok_or(ShieldError::SlotUnavailable)?;
        let handle = self.shield.open_connection(id, SocketAddr::new(ip, port), false).await?;
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn connect_ssl(&mut self, host: &str, port: u16) -> Result<()> {
        self.ensure_idle()?;
        let ip = self.shield.resolve(host).await?;
        self.connect_ssl_addr(ip, port).await
    }

    /// TLS connection on the dedicated SSL slot.
    pub async fn connect_ssl_addr(&mut self, ip: IpAddr, port: u16) -> Result<()> {
        self.ensure_idle()?;
        if !self.shield.slots[SlotId::SSL].is_free() {
            return Err(ShieldError::SlotUnavailable);
        }
        let handle = self
            .shield
            .open_connection(SlotId::SSL, SocketAddr::new(ip, port), true)
            .await?;
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let id = self.slot()?;
        self.shield.cache_write(id, data).await
    }

    pub async fn write_byte(&mut self, byte: u8) -> Result<usize> {
        self.write(&[byte]).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let id = self.slot()?;
        self.shield.cache_read(id, buf).await
    }

    pub async fn read_byte(&mut self) -> Result<Option<u8>> {
        let id = self.slot()?;
        self.shield.cache_read_byte(id).await
    }

    pub async fn peek(&mut self) -> Result<Option<u8>> {
        let id = self.slot()?;
        self.shield.cache_peek(id).await
    }

    pub async fn available(&mut self) -> Result<usize> {
        let id = self.slot()?;
        self.shield.cache_available(id).await
    }

    /// Read one CRLF-terminated line. See [`Shield`]'s cache for the
    /// truncation rules; 0 means no complete line yet.
    pub async fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        let id = self.slot()?;
        self.shield.cache_read_line(id, buf).await
    }

    /// Push cached bytes out and wait until the shield has transmitted
    /// everything. Does not give up while the peer keeps its window closed.
    pub async fn flush(&mut self) -> Result<()> {
        let id = self.slot()?;
        self.shield.update(id, Renew::WRITE).await?;

        let verb = self.shield.engine.codec().get_verb();
        let mut poll = Backoff::fixed(self.shield.config.drain_poll_interval, None);
        loop {
            match self.shield.engine.query_int(cmd!("tcp{} {} txlen", id, verb)).await {
                Ok(0) => return Ok(()),
                Ok(pending) => trace!(slot = %id, pending, "Waiting for transmit"),
                Err(e) => {
                    debug!(slot = %id, error = %e, "Transmit length query failed");
                    return Ok(());
                }
            }
            poll.wait().await;
        }
    }

    /// Close the connection and give the slot back.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match self.shield.slots.check(handle) {
            Ok(id) => self.shield.close_slot(id).await,
            Err(_) => Ok(()),
        }
    }

    /// Connected, or still holding bytes to read.
    pub async fn connected(&mut self) -> Result<bool> {
        let Ok(id) = self.slot() else {
            return Ok(false);
        };
        self.shield.update(id, Renew::empty()).await?;
        let slot = &self.shield.slots[id];
        Ok(slot.state.is_connected() || slot.read_cache.len() + slot.rxlen > 0)
    }
}

impl<S: Spi> Shield<S> {
    /// Connect slot `id` to `addr` and claim it.
    pub(crate) async fn open_connection(
        &mut self,
        id: SlotId,
        addr: SocketAddr,
        ssl: bool,
    ) -> Result<SlotHandle> {
        let set = self.engine.codec().set_verb();
        info!(slot = %id, %addr, ssl, "Connecting");

        if !ssl {
            self.engine.command(cmd!("tcp{} {} api tcp", id, set)).await?;
        }
        self.engine
            .command(cmd!("tcp{} connect {} {}", id, addr.ip(), addr.port()))
            .await?;
        if ssl {
            let method = self.engine.codec().ssl_method(false);
            self.engine
                .command(cmd!("tcp{} {} ssl method {}", id, set, method))
                .await?;
        }

        let mut poll = Backoff::fixed(self.config.state_poll_interval, Some(self.config.connect_timeout));
        loop {
            let state = self.query_state(id).await.unwrap_or(ConnectionState::Closed);
            if state.is_connected() {
                self.reset_slot(id, ConnectionState::Connected);
                info!(slot = %id, %addr, "Connected");
                return Ok(self.slots.acquire(id));
            }
            if state.is_closed() {
                self.reset_slot(id, ConnectionState::Closed);
                warn!(slot = %id, %addr, "Connection refused");
                return Err(ShieldError::ConnectFailed(addr.to_string()));
            }
            if !poll.wait().await {
                warn!(slot = %id, %addr, %state, "Connect timed out");
                self.engine.command(cmd!("tcp{} close", id)).await?;
                self.reset_slot(id, ConnectionState::Closed);
                return Err(ShieldError::Timeout("connection"));
            }
        }
    }

    /// Flush, close and release slot `id`. A server no longer owns it
    /// afterwards.
    pub(crate) async fn close_slot(&mut self, id: SlotId) -> Result<()> {
        if let Err(e) = self.flush_write_cache(id).await {
            debug!(slot = %id, error = %e, "Dropping unsent bytes on close");
        }

        let result = self.close_remote(id).await;
        self.reset_slot(id, ConnectionState::Closed);
        self.slots[id].listen_port = None;
        self.slots.release(id);
        info!(slot = %id, "Closed");
        result
    }

    async fn close_remote(&mut self, id: SlotId) -> Result<()> {
        self.engine.command(cmd!("tcp{} close", id)).await?;
        let mut poll = Backoff::fixed(self.config.state_poll_interval, Some(self.config.close_timeout));
        loop {
            match self.query_state(id).await {
                Ok(state) if state.is_closed() => return Ok(()),
                Ok(_) => {}
                Err(_) => return Ok(()),
            }
            if !poll.wait().await {
                warn!(slot = %id, "Socket did not close in time");
                return Err(ShieldError::Timeout("socket close"));
            }
        }
    }
}
