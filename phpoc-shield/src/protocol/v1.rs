//! First-generation protocol.
//!
//! One shared transmit buffer, 12-bit lengths, a 4-byte API header in front
//! of every command, data payload and response, and NAK payloads tagged
//! `Ennn` or `Wnnn`.

use std::time::Duration;

use super::{BufferId, Generation, ProtocolCodec, ResponseHead};
use crate::error::Result;
use crate::transport::frame::{ApiHeader, FrameKind, StatusFlags, HEADER_LEN};

/// SPI request words
mod req {
    pub const STATUS: u16 = 0x0000;
    pub const TXLEN: u16 = 0x1000;
    pub const READ: u16 = 0x3000;
    pub const WRITE: u16 = 0x4000;
    pub const SYNC_MAGIC: u16 = 0x5a3c;
    pub const BAD_CMD: u16 = 0xf000;
    pub const LEN_MASK: u16 = 0x0fff;
}

/// Status word bits
mod status {
    pub const SYNC: u16 = 0x8000;
    pub const RXB: u16 = 0x2000;
    pub const TXB: u16 = 0x1000;
    pub const SBZ: u16 = 0x4fff;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct V1Codec;

impl ProtocolCodec for V1Codec {
    fn generation(&self) -> Generation {
        Generation::V1
    }

    fn probe_word(&self) -> u16 {
        req::STATUS
    }

    fn reset_word(&self) -> u16 {
        req::BAD_CMD
    }

    fn sync_magic(&self) -> u16 {
        req::SYNC_MAGIC
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn decode_status(&self, raw: u16) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        flags.set(StatusFlags::SYNC, raw & status::SYNC != 0);
        flags.set(StatusFlags::RX_READY, raw & status::RXB != 0);
        flags.set(StatusFlags::TX_PENDING, raw & status::TXB != 0);
        flags.set(StatusFlags::RESERVED, raw & status::SBZ != 0);
        flags
    }

    fn length_mask(&self) -> u16 {
        req::LEN_MASK
    }

    fn txlen_request(&self, _buffer: BufferId) -> u16 {
        req::TXLEN
    }

    fn read_request(&self, _buffer: BufferId, len: usize) -> u16 {
        req::READ | (len as u16 & req::LEN_MASK)
    }

    fn write_request(&self, _buffer: BufferId, len: usize) -> u16 {
        req::WRITE | (len as u16 & req::LEN_MASK)
    }

    fn frame_header(&self, kind: FrameKind, len: usize) -> Option<[u8; HEADER_LEN]> {
        Some(ApiHeader::new(kind, len).encode())
    }

    fn data_buffer(&self) -> BufferId {
        BufferId::Command
    }

    fn stale_buffers(&self) -> &'static [BufferId] {
        &[BufferId::Command]
    }

    fn drain_only_if_pending(&self) -> bool {
        true
    }

    fn response_head_len(&self) -> usize {
        HEADER_LEN
    }

    fn decode_response(&self, head: &[u8]) -> Result<ResponseHead> {
        let bytes: [u8; HEADER_LEN] = head.try_into().map_err(|_| {
            crate::error::ShieldError::Protocol(format!("short response head: {} bytes", head.len()))
        })?;
        let header = ApiHeader::decode(bytes);
        if header.nak {
            Ok(ResponseHead::Nak(header.length))
        } else {
            Ok(ResponseHead::Ok(header.length as u64))
        }
    }

    fn default_wait(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn inline_values(&self) -> bool {
        false
    }

    fn get_verb(&self) -> &'static str {
        "get"
    }

    fn set_verb(&self) -> &'static str {
        "set"
    }

    fn ssl_method(&self, server: bool) -> &'static str {
        if server {
            "tls1_server"
        } else {
            "tls1_client"
        }
    }

    fn net_device(&self) -> &'static str {
        "net0"
    }

    fn log_device(&self) -> &'static str {
        "sys log"
    }

    fn data_before_command(&self) -> bool {
        false
    }
}
