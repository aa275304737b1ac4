//! Channel resynchronisation.
//!
//! A glitch on the bus (reset of either side, a half-clocked transaction)
//! leaves the shield's SPI state machine mid-frame. Recovery is always the
//! same: send a word the shield cannot parse so it drops whatever it was
//! receiving, give it time to settle, then send the sync magic. The probe
//! that decides whether recovery is needed comes first, so a healthy channel
//! pays one exchange per call.

use std::fmt;

use tokio::time::sleep;

use super::{SpiChannel, StatusFlags};
use crate::hw_trait::{Result, Spi};
use crate::protocol::ProtocolCodec;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unknown,
    Probing,
    Synced,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Unknown => "unknown",
            SyncState::Probing => "probing",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Resync state machine for one channel.
#[derive(Debug)]
pub struct Resync {
    state: SyncState,
    recoveries: u32,
}

impl Default for Resync {
    fn default() -> Self {
        Self::new()
    }
}

impl Resync {
    pub fn new() -> Self {
        Self {
            state: SyncState::Unknown,
            recoveries: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Number of reset/magic sequences issued so far.
    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    /// Forget the last outcome; the next run starts from `Unknown`.
    pub fn invalidate(&mut self) {
        self.state = SyncState::Unknown;
    }

    /// Bring the channel into sync, returning the last status seen.
    ///
    /// Lands in [`SyncState::Synced`] or [`SyncState::Failed`]. A failed
    /// channel is reported through the returned flags; only bus errors are
    /// returned as `Err`.
    pub async fn run<S: Spi>(
        &mut self,
        channel: &mut SpiChannel<S>,
        codec: &dyn ProtocolCodec,
    ) -> Result<StatusFlags> {
        self.state = SyncState::Probing;

        let status = codec.decode_status(channel.exchange(codec.probe_word()).await?);
        if status.is_usable() {
            self.state = SyncState::Synced;
            return Ok(status);
        }

        debug!(generation = %codec.generation(), ?status, "Resyncing SPI channel");
        self.recoveries += 1;
        channel.exchange(codec.reset_word()).await?;
        sleep(codec.settle_delay()).await;
        let magic_reply = channel.exchange(codec.sync_magic()).await?;

        // When the probe is the magic word, its reply is the verdict.
        let status = if codec.probe_word() == codec.sync_magic() {
            codec.decode_status(magic_reply)
        } else {
            codec.decode_status(channel.exchange(codec.probe_word()).await?)
        };

        if status.is_usable() {
            debug!("SPI channel resynced");
            self.state = SyncState::Synced;
        } else {
            warn!(generation = %codec.generation(), ?status, "SPI channel resync failed");
            self.state = SyncState::Failed;
        }
        Ok(status)
    }
}
