//! Second-generation protocol.
//!
//! Two transmit buffers: buffer 0 carries command text and 8-byte responses,
//! buffer 1 carries bulk data. Lengths are 11 bits. A response is a signed
//! little-endian value; negative values are `-errno`.

use std::time::Duration;

use super::{BufferId, Generation, ProtocolCodec, ResponseHead};
use crate::error::{Errno, Result, ShieldError};
use crate::transport::frame::{FrameKind, StatusFlags, HEADER_LEN};

/// SPI request words
mod req {
    pub const TXLEN: u16 = 0x2000;
    pub const READ: u16 = 0x6000;
    pub const WRITE: u16 = 0x8000;
    pub const BID_DATA: u16 = 0x0800;
    pub const SYNC_MAGIC: u16 = 0xa5c3;
    pub const BAD_CMD: u16 = 0xe000;
    pub const LEN_MASK: u16 = 0x07ff;
}

/// Status word bits
mod status {
    pub const SYNC: u16 = 0x8000;
    pub const RXB: u16 = 0x4000;
    pub const TXB: u16 = 0x2000;
    /// Bits compared against [`SYNC_REPLY`] when validating a sync reply.
    pub const SYNC_CHECK: u16 = 0x87ff;
    pub const SYNC_REPLY: u16 = 0x823c;
}

const RESPONSE_LEN: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct V2Codec;

impl V2Codec {
    fn with_buffer(word: u16, buffer: BufferId) -> u16 {
        match buffer {
            BufferId::Command => word,
            BufferId::Data => word | req::BID_DATA,
        }
    }
}

impl ProtocolCodec for V2Codec {
    fn generation(&self) -> Generation {
        Generation::V2
    }

    fn probe_word(&self) -> u16 {
        // the sync reply is the only status word with a checkable pattern
        req::SYNC_MAGIC
    }

    fn reset_word(&self) -> u16 {
        req::BAD_CMD
    }

    fn sync_magic(&self) -> u16 {
        req::SYNC_MAGIC
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(105)
    }

    fn decode_status(&self, raw: u16) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        flags.set(StatusFlags::SYNC, raw & status::SYNC != 0);
        flags.set(StatusFlags::RX_READY, raw & status::RXB != 0);
        flags.set(StatusFlags::TX_PENDING, raw & status::TXB != 0);
        flags.set(
            StatusFlags::RESERVED,
            raw & status::SYNC_CHECK != status::SYNC_REPLY,
        );
        flags
    }

    fn length_mask(&self) -> u16 {
        req::LEN_MASK
    }

    fn txlen_request(&self, buffer: BufferId) -> u16 {
        Self::with_buffer(req::TXLEN, buffer)
    }

    fn read_request(&self, buffer: BufferId, len: usize) -> u16 {
        Self::with_buffer(req::READ, buffer) | (len as u16 & req::LEN_MASK)
    }

    fn write_request(&self, buffer: BufferId, len: usize) -> u16 {
        Self::with_buffer(req::WRITE, buffer) | (len as u16 & req::LEN_MASK)
    }

    fn frame_header(&self, _kind: FrameKind, _len: usize) -> Option<[u8; HEADER_LEN]> {
        None
    }

    fn data_buffer(&self) -> BufferId {
        BufferId::Data
    }

    fn stale_buffers(&self) -> &'static [BufferId] {
        &[BufferId::Command, BufferId::Data]
    }

    fn drain_only_if_pending(&self) -> bool {
        false
    }

    fn response_head_len(&self) -> usize {
        RESPONSE_LEN
    }

    fn decode_response(&self, head: &[u8]) -> Result<ResponseHead> {
        let bytes: [u8; RESPONSE_LEN] = head.try_into().map_err(|_| {
            ShieldError::Protocol(format!("short response value: {} bytes", head.len()))
        })?;
        let value = i64::from_le_bytes(bytes);
        if value >= 0 {
            return Ok(ResponseHead::Ok(value as u64));
        }
        let code = u16::try_from(value.unsigned_abs()).map_err(|_| {
            ShieldError::Protocol(format!("response value out of range: {}", value))
        })?;
        if code == Errno::Again.code() {
            Ok(ResponseHead::Again)
        } else {
            Ok(ResponseHead::Failed(code))
        }
    }

    fn default_wait(&self) -> Duration {
        Duration::from_millis(1000)
    }

    fn inline_values(&self) -> bool {
        true
    }

    fn get_verb(&self) -> &'static str {
        "ioctl get"
    }

    fn set_verb(&self) -> &'static str {
        "ioctl set"
    }

    fn ssl_method(&self, server: bool) -> &'static str {
        if server {
            "server"
        } else {
            "client"
        }
    }

    fn net_device(&self) -> &'static str {
        "net"
    }

    fn log_device(&self) -> &'static str {
        "log"
    }

    fn data_before_command(&self) -> bool {
        true
    }
}
