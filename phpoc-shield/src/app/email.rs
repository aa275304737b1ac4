//! Outgoing mail through the shield's SMTP client.

use crate::cache::{ByteCache, DEFAULT_WRITE_CACHE};
use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::poll::Backoff;
use crate::protocol::cmd;
use crate::shield::{Shield, ShieldFlags};
use crate::tracing::prelude::*;

/// Log buffer the SMTP client writes to.
const SMTP_LOG: u8 = 1;

/// Longest SMTP status reply kept.
const STATUS_LEN: usize = 8;

/// One message under construction.
///
/// Body bytes are cached and sent in `smtp data` chunks; the message goes
/// out with [`Email::send`].
pub struct Email<'a, S: Spi> {
    shield: &'a mut Shield<S>,
    cache: ByteCache,
}

impl<'a, S: Spi> Email<'a, S> {
    pub fn new(shield: &'a mut Shield<S>) -> Self {
        Self {
            shield,
            cache: ByteCache::new(DEFAULT_WRITE_CACHE),
        }
    }

    /// Relay server. An empty host sends directly to the recipient's
    /// exchanger.
    pub async fn set_outgoing_server(&mut self, host: &str, port: u16) -> Result<()> {
        let cmd = if host.is_empty() {
            cmd!("smtp server")
        } else {
            cmd!("smtp server {} {}", host, port)
        };
        self.shield.engine.command(cmd).await?;
        Ok(())
    }

    /// Relay credentials; ignored unless both are given.
    pub async fn set_outgoing_login(&mut self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() || password.is_empty() {
            return Ok(());
        }
        self.shield
            .engine
            .command(cmd!("smtp login {} {}", username, password))
            .await?;
        Ok(())
    }

    /// Sender address and display name; the name defaults to the address.
    pub async fn set_from(&mut self, email: &str, name: &str) -> Result<()> {
        self.set_party("from", email, name).await
    }

    pub async fn set_to(&mut self, email: &str, name: &str) -> Result<()> {
        self.set_party("to", email, name).await
    }

    async fn set_party(&mut self, field: &str, email: &str, name: &str) -> Result<()> {
        if email.is_empty() {
            return Ok(());
        }
        let name = if name.is_empty() { email } else { name };
        self.shield
            .engine
            .command_with_data(cmd!("smtp {}", field), &[email.as_bytes(), name.as_bytes()])
            .await?;
        Ok(())
    }

    pub async fn set_subject(&mut self, subject: &str) -> Result<()> {
        if subject.is_empty() {
            return Ok(());
        }
        self.shield
            .engine
            .command_with_data(cmd!("smtp subject"), &[subject.as_bytes()])
            .await?;
        Ok(())
    }

    pub async fn begin_message(&mut self) -> Result<()> {
        self.cache.clear();
        self.shield.engine.command(cmd!("smtp data begin")).await?;
        Ok(())
    }

    /// Append body bytes. Small writes are cached until the cache fills.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.cache.len() + data.len() < self.cache.capacity() {
            self.cache.push(data);
            return Ok(data.len());
        }
        self.flush().await?;
        self.send_data(data).await?;
        Ok(data.len())
    }

    /// Send whatever body bytes are still cached.
    pub async fn end_message(&mut self) -> Result<()> {
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let pending = self.cache.take_all();
        self.send_data(&pending).await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let max = self.shield.engine.codec().max_payload();
        for chunk in data.chunks(max) {
            self.shield
                .engine
                .command_with_data(cmd!("smtp data"), &[chunk])
                .await?;
        }
        Ok(())
    }

    /// Hand the message to the shield and wait for the server's verdict.
    /// Returns whether the server answered 2xx.
    pub async fn send(&mut self) -> Result<bool> {
        self.shield.flush_remote_log(SMTP_LOG).await?;

        let cmd = if self.shield.flags().contains(ShieldFlags::IP6) {
            cmd!("smtp send ip6")
        } else {
            cmd!("smtp send")
        };
        self.shield.engine.command(cmd).await?;

        let interval = self.shield.config.state_poll_interval;
        let mut poll = Backoff::fixed(interval, Some(self.shield.config.smtp_timeout));
        let status = loop {
            let reply = self
                .shield
                .engine
                .query_string(cmd!("smtp status"), STATUS_LEN)
                .await?;
            if !reply.is_empty() {
                break reply;
            }
            if !poll.wait().await {
                warn!("No reply from mail server");
                return Err(ShieldError::Timeout("smtp status"));
            }
        };

        self.shield.drain_remote_log(SMTP_LOG).await?;

        let code: u16 = status
            .trim()
            .parse()
            .map_err(|_| ShieldError::Protocol(format!("invalid smtp status {:?}", status)))?;
        let accepted = code / 100 == 2;
        if accepted {
            info!(code, "Mail accepted");
        } else {
            warn!(code, "Mail rejected");
        }
        Ok(accepted)
    }
}
