//! Command/response engine.
//!
//! Turns a command line into a response: resync the channel, drop stale
//! bytes the shield still holds, send the command, poll for the response
//! head and interpret it. NAKs asking for more time extend the poll without
//! resending; busy replies resend after a short pause; error replies become
//! [`ShieldError::Remote`]. Any payload announced by the head stays queued in
//! the shield for [`CommandEngine::read`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::poll::Backoff;
use crate::protocol::{BufferId, CommandBuf, Generation, NakTag, ProtocolCodec, ResponseHead, NAK_TAG_LEN};
use crate::tracing::prelude::*;
use crate::transport::{FrameKind, Resync, SpiChannel, StatusFlags, SyncState};

/// Pause before resending a command the shield was too busy to take.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Longest ASCII integer accepted from a first-generation reply.
const MAX_INT_DIGITS: usize = 10;

/// Longest NAK message kept for diagnostics.
const MAX_NAK_MESSAGE: usize = 64;

pub struct CommandEngine<S: Spi> {
    channel: SpiChannel<S>,
    codec: Box<dyn ProtocolCodec>,
    resync: Resync,
    present: bool,
    wait_override: Option<Duration>,
    last_errno: u16,
}

impl<S: Spi> CommandEngine<S> {
    pub fn new(spi: S, codec: Box<dyn ProtocolCodec>) -> Self {
        Self {
            channel: SpiChannel::new(spi),
            codec,
            resync: Resync::new(),
            present: false,
            wait_override: None,
            last_errno: 0,
        }
    }

    pub fn codec(&self) -> &dyn ProtocolCodec {
        self.codec.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.codec.generation()
    }

    /// Switch protocol generation. The channel has to be resynced.
    pub fn set_codec(&mut self, codec: Box<dyn ProtocolCodec>) {
        self.codec = codec;
        self.resync.invalidate();
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Mark the shield as found (or lost). While absent every command
    /// fails with [`ShieldError::NoShield`] without touching the bus.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    pub fn sync_state(&self) -> SyncState {
        self.resync.state()
    }

    /// Override the response deadline; `None` restores the default.
    pub fn set_response_wait(&mut self, wait: Option<Duration>) {
        self.wait_override = wait;
    }

    pub fn response_wait(&self) -> Duration {
        self.wait_override.unwrap_or_else(|| self.codec.default_wait())
    }

    /// Errno of the most recent failed operation, zero after a success.
    pub fn last_errno(&self) -> u16 {
        self.last_errno
    }

    pub fn spi_mut(&mut self) -> &mut S {
        self.channel.spi_mut()
    }

    /// Run the resync state machine, regardless of presence.
    pub async fn resync(&mut self) -> Result<StatusFlags> {
        let status = self.resync.run(&mut self.channel, self.codec.as_ref()).await?;
        Ok(status)
    }

    /// Send a command and return its result: a payload length, or the
    /// value itself for generations with inline values.
    pub async fn command(&mut self, cmd: CommandBuf) -> Result<usize> {
        let result = self.request(cmd).await;
        self.track(result)
    }

    /// Send a command carrying data frames, in the order the generation
    /// expects. Returns the command's result.
    pub async fn command_with_data(&mut self, cmd: CommandBuf, frames: &[&[u8]]) -> Result<usize> {
        let result = if self.codec.data_before_command() {
            match self.write_frames(frames).await {
                Ok(()) => self.request(cmd).await,
                Err(e) => Err(e),
            }
        } else {
            match self.request(cmd).await {
                Ok(value) => self.write_frames(frames).await.map(|_| value),
                Err(e) => Err(e),
            }
        };
        self.track(result)
    }

    /// Integer result of a query command.
    pub async fn query_int(&mut self, cmd: CommandBuf) -> Result<u32> {
        let result = self.request_int(cmd).await;
        self.track(result)
    }

    /// String result of a query command, at most `max` bytes.
    pub async fn query_string(&mut self, cmd: CommandBuf, max: usize) -> Result<String> {
        let result = self.request_string(cmd, max).await;
        self.track(result)
    }

    /// IPv4 result of a query command. An empty or all-zero address is
    /// `None`.
    pub async fn query_ipv4(&mut self, cmd: CommandBuf) -> Result<Option<Ipv4Addr>> {
        let text = self.query_string(cmd, 16).await?;
        Ok(text.parse::<Ipv4Addr>().ok().filter(|ip| !ip.is_unspecified()))
    }

    pub async fn query_ipv6(&mut self, cmd: CommandBuf) -> Result<Option<Ipv6Addr>> {
        let text = self.query_string(cmd, 40).await?;
        Ok(text.parse::<Ipv6Addr>().ok().filter(|ip| !ip.is_unspecified()))
    }

    /// Read queued payload bytes.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = match self.ready().await {
            Ok(_) => self.read_payload(buf).await,
            Err(e) => Err(e),
        };
        self.track(result)
    }

    /// Drop whatever payload is still queued.
    pub async fn discard(&mut self) -> Result<()> {
        let buffer = self.codec.data_buffer();
        let result = self.drain(buffer).await;
        self.track(result)
    }

    /// Send a data frame. Returns the number of bytes written, at most the
    /// codec's maximum payload.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let result = match self.ready().await {
            Ok(_) => self.write_frame(FrameKind::Data, data).await,
            Err(e) => Err(e),
        };
        self.track(result)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_errno = 0,
            Err(e) => {
                self.last_errno = e.errno();
                debug!(errno = self.last_errno, error = %e, "Shield request failed");
            }
        }
        result
    }

    async fn ready(&mut self) -> Result<StatusFlags> {
        if !self.present {
            return Err(ShieldError::NoShield);
        }
        let status = self.resync().await?;
        if !status.is_usable() {
            return Err(ShieldError::NoShield);
        }
        Ok(status)
    }

    async fn request(&mut self, cmd: CommandBuf) -> Result<usize> {
        let cmd = cmd.finish()?;
        let status = self.ready().await?;

        if !self.codec.drain_only_if_pending() || status.contains(StatusFlags::TX_PENDING) {
            for &buffer in self.codec.stale_buffers() {
                self.drain(buffer).await?;
            }
        }

        debug!(command = %cmd, "Shield command");
        let mut busy = Backoff::fixed(BUSY_RETRY_DELAY, Some(self.response_wait()));

        loop {
            self.write_frame(FrameKind::Command, cmd.as_bytes()).await?;
            match self.await_response().await? {
                Some(value) => {
                    trace!(command = %cmd, value, "Shield response");
                    return Ok(usize::try_from(value).unwrap_or(usize::MAX));
                }
                None => {
                    debug!(command = %cmd, "Shield busy, resending");
                    if !busy.wait().await {
                        return Err(ShieldError::Timeout("busy shield"));
                    }
                }
            }
        }
    }

    /// Poll for and decode one response. `None` means resend.
    async fn await_response(&mut self) -> Result<Option<u64>> {
        let head_len = self.codec.response_head_len();
        let mut wait = self.response_wait();

        loop {
            self.wait_for(BufferId::Command, head_len, wait).await?;
            let mut head = [0u8; 8];
            let head = &mut head[..head_len];
            let req = self.codec.read_request(BufferId::Command, head_len);
            self.channel.bulk_read(req, head_len, Some(head)).await?;

            match self.codec.decode_response(head)? {
                ResponseHead::Ok(value) => {
                    if !self.codec.inline_values() && value > 0 {
                        self.wait_for(BufferId::Command, value as usize, wait).await?;
                    }
                    return Ok(Some(value));
                }
                ResponseHead::Nak(len) => {
                    let secs = self.read_nak(len, wait).await?;
                    wait = if secs == 0 {
                        self.response_wait()
                    } else {
                        Duration::from_secs(secs as u64)
                    };
                    debug!(seconds = secs, "Shield asked for more time");
                }
                ResponseHead::Failed(code) => return Err(ShieldError::remote(code, "")),
                ResponseHead::Again => return Ok(None),
            }
        }
    }

    /// Consume a NAK payload. Returns the requested wait in seconds, or the
    /// remote error.
    async fn read_nak(&mut self, len: usize, wait: Duration) -> Result<u16> {
        if len < NAK_TAG_LEN {
            return Err(ShieldError::Protocol(format!("NAK payload too short: {} bytes", len)));
        }
        self.wait_for(BufferId::Command, len, wait).await?;
        let mut tag = [0u8; NAK_TAG_LEN];
        let req = self.codec.read_request(BufferId::Command, NAK_TAG_LEN);
        self.channel.bulk_read(req, NAK_TAG_LEN, Some(&mut tag)).await?;

        let rest = len - NAK_TAG_LEN;
        let mut message = vec![0u8; rest.min(MAX_NAK_MESSAGE)];
        if rest > 0 {
            let req = self.codec.read_request(BufferId::Command, rest);
            self.channel.bulk_read(req, rest, Some(&mut message)).await?;
        }

        match NakTag::parse(&tag)? {
            NakTag::Error(code) => {
                let text = String::from_utf8_lossy(&message).trim().to_string();
                Err(ShieldError::remote(code, text))
            }
            NakTag::Wait(secs) => Ok(secs),
        }
    }

    async fn wait_for(&mut self, buffer: BufferId, len: usize, timeout: Duration) -> Result<()> {
        let mut backoff = Backoff::exponential(timeout);
        loop {
            if self.txlen(buffer).await? >= len {
                return Ok(());
            }
            if !backoff.wait().await {
                return Err(ShieldError::Timeout("shield response"));
            }
        }
    }

    async fn txlen(&mut self, buffer: BufferId) -> Result<usize> {
        let word = self.channel.exchange(self.codec.txlen_request(buffer)).await?;
        Ok((word & self.codec.length_mask()) as usize)
    }

    async fn drain(&mut self, buffer: BufferId) -> Result<()> {
        let stale = self.txlen(buffer).await?;
        if stale > 0 {
            trace!(len = stale, ?buffer, "Dropping stale shield bytes");
            let req = self.codec.read_request(buffer, stale);
            self.channel.bulk_read(req, stale, None).await?;
        }
        Ok(())
    }

    async fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.present {
            return Err(ShieldError::NoShield);
        }
        let buffer = self.codec.data_buffer();
        let len = self.txlen(buffer).await?.min(buf.len());
        if len > 0 {
            let req = self.codec.read_request(buffer, len);
            self.channel.bulk_read(req, len, Some(&mut buf[..len])).await?;
        }
        Ok(len)
    }

    async fn write_frame(&mut self, kind: FrameKind, data: &[u8]) -> Result<usize> {
        if !self.present {
            return Err(ShieldError::NoShield);
        }
        let len = data.len().min(self.codec.max_payload());
        let buffer = match kind {
            FrameKind::Command => BufferId::Command,
            FrameKind::Data => self.codec.data_buffer(),
        };
        if let Some(header) = self.codec.frame_header(kind, len) {
            let req = self.codec.write_request(buffer, header.len());
            self.channel.bulk_write(req, &header).await?;
        }
        let req = self.codec.write_request(buffer, len);
        self.channel.bulk_write(req, &data[..len]).await?;
        Ok(len)
    }

    async fn write_frames(&mut self, frames: &[&[u8]]) -> Result<()> {
        self.ready().await?;
        for frame in frames {
            self.write_frame(FrameKind::Data, frame).await?;
        }
        Ok(())
    }

    async fn request_int(&mut self, cmd: CommandBuf) -> Result<u32> {
        let value = self.request(cmd).await?;
        if self.codec.inline_values() {
            return Ok(u32::try_from(value).unwrap_or(u32::MAX));
        }
        if value == 0 {
            return Ok(0);
        }
        let mut digits = [0u8; MAX_INT_DIGITS];
        let n = self.read_payload(&mut digits[..value.min(MAX_INT_DIGITS)]).await?;
        if value > n {
            self.drain(self.codec.data_buffer()).await?;
        }
        let text = std::str::from_utf8(&digits[..n])
            .map_err(|_| ShieldError::Protocol("non-ASCII integer reply".into()))?;
        text.trim()
            .parse()
            .map_err(|_| ShieldError::Protocol(format!("invalid integer reply {:?}", text)))
    }

    async fn request_string(&mut self, cmd: CommandBuf, max: usize) -> Result<String> {
        let len = self.request(cmd).await?;
        let mut buf = vec![0u8; len.min(max)];
        let n = self.read_payload(&mut buf).await?;
        if len > n {
            self.drain(self.codec.data_buffer()).await?;
        }
        buf.truncate(n);
        let text = String::from_utf8_lossy(&buf);
        Ok(text.trim_end_matches(['\0', '\r', '\n']).to_string())
    }
}
