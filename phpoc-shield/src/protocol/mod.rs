//! Protocol generations spoken over the SPI channel.
//!
//! Two generations of shield firmware exist. They share the same shape
//! (a 16-bit request word per transaction, a textual command language, a
//! response carrying either a length or an error) but differ in every
//! constant: request words, length masks, the sync magic, how a response is
//! framed and how errors are reported. [`ProtocolCodec`] captures those
//! differences so the engine above it stays generation-agnostic. The codec
//! is chosen once, when the channel is brought up.

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::transport::frame::{FrameKind, StatusFlags, HEADER_LEN};

pub mod command;
pub mod v1;
pub mod v2;

pub(crate) use command::cmd;
pub use command::CommandBuf;
pub use v1::V1Codec;
pub use v2::V2Codec;

/// Firmware protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V1,
    V2,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::V1 => write!(f, "v1"),
            Generation::V2 => write!(f, "v2"),
        }
    }
}

/// Shield-side transmit buffer selector.
///
/// The first generation has a single buffer; its codec maps both ids to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferId {
    Command,
    Data,
}

/// First part of a command response, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHead {
    /// Success. Either the number of payload bytes queued behind the head
    /// or, for generations with inline values, the value itself.
    Ok(u64),
    /// Negative acknowledgement followed by a payload of this many bytes
    /// starting with a [`NakTag`].
    Nak(usize),
    /// The command failed with this errno.
    Failed(u16),
    /// The shield was busy; the command should be sent again.
    Again,
}

/// Four-character tag at the front of a NAK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakTag {
    /// `Ennn`: the command failed with error code `nnn`.
    Error(u16),
    /// `Wnnn`: the response is not ready, wait up to `nnn` seconds.
    Wait(u16),
}

/// Length of a NAK tag.
pub const NAK_TAG_LEN: usize = 4;

impl NakTag {
    pub fn parse(tag: &[u8]) -> Result<Self> {
        let invalid = || {
            crate::error::ShieldError::Protocol(format!(
                "invalid NAK tag {:?}",
                String::from_utf8_lossy(tag)
            ))
        };
        if tag.len() != NAK_TAG_LEN || !tag[1..].iter().all(u8::is_ascii_digit) {
            return Err(invalid());
        }
        let value = tag[1..]
            .iter()
            .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
        match tag[0] {
            b'E' => Ok(NakTag::Error(value)),
            b'W' => Ok(NakTag::Wait(value)),
            _ => Err(invalid()),
        }
    }
}

/// Generation-specific encoding rules.
pub trait ProtocolCodec: Send + Sync + fmt::Debug {
    fn generation(&self) -> Generation;

    /// Word sent to check whether the channel is in sync.
    fn probe_word(&self) -> u16;

    /// Word that forces the shield to drop a half-received transaction.
    fn reset_word(&self) -> u16;

    fn sync_magic(&self) -> u16;

    /// Time the shield needs to recover after a reset word.
    fn settle_delay(&self) -> Duration;

    fn decode_status(&self, raw: u16) -> StatusFlags;

    /// Mask applied to the reply of a length query.
    fn length_mask(&self) -> u16;

    fn txlen_request(&self, buffer: BufferId) -> u16;

    fn read_request(&self, buffer: BufferId, len: usize) -> u16;

    fn write_request(&self, buffer: BufferId, len: usize) -> u16;

    /// Largest payload a single transaction may carry.
    fn max_payload(&self) -> usize {
        self.length_mask() as usize
    }

    /// Header to send ahead of a command or data payload, if any.
    fn frame_header(&self, kind: FrameKind, len: usize) -> Option<[u8; HEADER_LEN]>;

    /// Buffer that carries bulk data in both directions.
    fn data_buffer(&self) -> BufferId;

    /// Buffers to drain of stale bytes before a command, and whether the
    /// drain is skipped when the status word shows nothing pending.
    fn stale_buffers(&self) -> &'static [BufferId];

    fn drain_only_if_pending(&self) -> bool;

    fn response_head_len(&self) -> usize;

    fn decode_response(&self, head: &[u8]) -> Result<ResponseHead>;

    /// Default deadline for a response head.
    fn default_wait(&self) -> Duration;

    /// Whether [`ResponseHead::Ok`] carries integer results inline instead
    /// of as ASCII payload.
    fn inline_values(&self) -> bool;

    fn get_verb(&self) -> &'static str;

    fn set_verb(&self) -> &'static str;

    fn ssl_method(&self, server: bool) -> &'static str;

    /// Device answering interface-independent address queries.
    fn net_device(&self) -> &'static str;

    /// Prefix of the shield's log buffer devices.
    fn log_device(&self) -> &'static str;

    /// Whether the payload of a command with data goes out before the
    /// command text.
    fn data_before_command(&self) -> bool;
}
