//! Frame header and channel status encoding.
//!
//! The first generation of the shield prefixes every command and data
//! payload with a 4-byte API header, and answers each command with a header
//! of the same shape:
//!
//! ```text
//! byte 0: D 0 N C L11 L10 L9 L8
//! byte 1: L7 .. L0
//! byte 2: checksum high
//! byte 3: checksum low
//! ```
//!
//! `D` marks a data frame (responses always carry it), `N` marks a NAK
//! response and `C` selects the checksum kind. A checksum of zero means
//! "not computed", which is what this driver always sends.

use bitflags::bitflags;

/// Size of the API header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload length a header can describe.
pub const MAX_FRAME_LEN: usize = 0x0fff;

mod bits {
    pub const DATA: u8 = 0x80;
    pub const NAK: u8 = 0x20;
    pub const LEN_HIGH: u8 = 0x0f;
}

/// Direction of a frame written to the shield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// ASCII command text.
    Command,
    /// Opaque payload bytes accompanying a command.
    Data,
}

/// Decoded API header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiHeader {
    pub kind: FrameKind,
    pub nak: bool,
    pub length: usize,
    pub checksum: u16,
}

impl ApiHeader {
    pub fn new(kind: FrameKind, length: usize) -> Self {
        Self {
            kind,
            nak: false,
            length: length.min(MAX_FRAME_LEN),
            checksum: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut flags = 0u8;
        if self.kind == FrameKind::Data {
            flags |= bits::DATA;
        }
        if self.nak {
            flags |= bits::NAK;
        }
        let len = self.length.min(MAX_FRAME_LEN) as u16;
        let csum = self.checksum.to_be_bytes();
        [
            flags | ((len >> 8) as u8 & bits::LEN_HIGH),
            len as u8,
            csum[0],
            csum[1],
        ]
    }

    /// Decode a header read back from the shield.
    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        let kind = if bytes[0] & bits::DATA != 0 {
            FrameKind::Data
        } else {
            FrameKind::Command
        };
        Self {
            kind,
            nak: bytes[0] & bits::NAK != 0,
            length: (((bytes[0] & bits::LEN_HIGH) as usize) << 8) | bytes[1] as usize,
            checksum: u16::from_be_bytes([bytes[2], bytes[3]]),
        }
    }
}

bitflags! {
    /// Generation-independent view of the status word returned by a probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        /// Channel is synchronised.
        const SYNC = 0x01;
        /// Shield has room in its receive buffer.
        const RX_READY = 0x02;
        /// Shield has bytes waiting to be read.
        const TX_PENDING = 0x04;
        /// Bits that must be zero were set; the reply is garbage.
        const RESERVED = 0x80;
    }
}

impl StatusFlags {
    /// A status word is only trusted if it is synced and clean.
    pub fn is_usable(self) -> bool {
        self.contains(Self::SYNC) && !self.contains(Self::RESERVED)
    }
}
