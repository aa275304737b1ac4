//! Socket sessions: TCP/SSL clients and listening servers.
//!
//! The shield runs six sockets. Slot 0 is reserved for SSL, slot 1 for SSH
//! and slots 2 to 5 carry plain TCP (including Telnet and WebSocket
//! servers). The firmware reports a numeric state per socket; its meaning
//! depends on which kind of slot it came from.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::{Server, ServerApi};

use std::fmt;

use crate::cache::SlotId;

/// Raw socket states reported by the firmware.
pub mod raw {
    pub const CLOSED: u16 = 0;
    pub const LISTEN: u16 = 1;
    pub const TCP_CONNECTED: u16 = 4;
    /// First state of the TLS/SSH layer.
    pub const SECURE_STOP: u16 = 11;
    pub const SSH_AUTH: u16 = 17;
    pub const SECURE_CONNECTED: u16 = 19;
}

/// What a slot is reserved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Ssl,
    Ssh,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listen,
    /// Handshake or TLS/SSH negotiation in progress.
    Opening(u16),
    Connected,
    /// SSH peer waiting for its credentials to be accepted.
    SshAuth,
    /// Torn down or tearing down.
    Closing(u16),
}

impl ConnectionState {
    pub fn from_raw(raw: u16, role: SlotRole) -> Self {
        match (raw, role) {
            (raw::CLOSED, _) => Self::Closed,
            (raw::LISTEN, _) => Self::Listen,
            (raw::TCP_CONNECTED, SlotRole::Tcp) => Self::Connected,
            (2..=3, _) => Self::Opening(raw),
            (_, SlotRole::Tcp) => Self::Closing(raw),
            (raw::SECURE_CONNECTED, _) => Self::Connected,
            (raw::SSH_AUTH, SlotRole::Ssh) => Self::SshAuth,
            (raw::TCP_CONNECTED, _) => Self::Opening(raw),
            (raw::SECURE_STOP..=18, _) => Self::Opening(raw),
            _ => Self::Closing(raw),
        }
    }

    /// Raw firmware value, for the given role.
    pub fn raw(self, role: SlotRole) -> u16 {
        match self {
            Self::Closed => raw::CLOSED,
            Self::Listen => raw::LISTEN,
            Self::Connected if role == SlotRole::Tcp => raw::TCP_CONNECTED,
            Self::Connected => raw::SECURE_CONNECTED,
            Self::SshAuth => raw::SSH_AUTH,
            Self::Opening(raw) | Self::Closing(raw) => raw,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Listen => f.write_str("listen"),
            Self::Opening(raw) => write!(f, "opening({})", raw),
            Self::Connected => f.write_str("connected"),
            Self::SshAuth => f.write_str("ssh-auth"),
            Self::Closing(raw) => write!(f, "closing({})", raw),
        }
    }
}

impl SlotId {
    pub fn role(self) -> SlotRole {
        match self {
            SlotId::SSL => SlotRole::Ssl,
            SlotId::SSH => SlotRole::Ssh,
            _ => SlotRole::Tcp,
        }
    }
}
