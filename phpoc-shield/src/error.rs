//! Error types for shield operations.

use strum::FromRepr;
use thiserror::Error;

use crate::hw_trait::HwError;

/// Error numbers shared with the shield firmware.
///
/// The second protocol generation reports failures as `-errno`; the first
/// generation uses the same numbers in its `Ennn` NAK payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Errno {
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    Again = 11,
    NoMem = 12,
    Busy = 16,
    Inval = 22,
    NoSpc = 28,
    Range = 34,
    NoSys = 38,
    NoData = 61,
    Time = 62,
    Proto = 71,
    NotSock = 88,
    MsgSize = 90,
    OpNotSupp = 95,
    ConnRefused = 111,
}

impl Errno {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::Perm => "operation not permitted",
            Errno::NoEnt => "no such entry",
            Errno::Io => "I/O error",
            Errno::Again => "try again",
            Errno::NoMem => "out of memory",
            Errno::Busy => "device busy",
            Errno::Inval => "invalid argument",
            Errno::NoSpc => "no space left",
            Errno::Range => "out of range",
            Errno::NoSys => "not implemented",
            Errno::NoData => "no data",
            Errno::Time => "timer expired",
            Errno::Proto => "protocol error",
            Errno::NotSock => "not a socket",
            Errno::MsgSize => "message too long",
            Errno::OpNotSupp => "operation not supported",
            Errno::ConnRefused => "connection refused",
        }
    }
}

#[derive(Debug, Error)]
pub enum ShieldError {
    /// Shield absent or the channel could not be resynchronised.
    #[error("shield not found or SPI channel out of sync")]
    NoShield,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The shield rejected a command.
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("no free socket slot")]
    SlotUnavailable,

    #[error("socket handle is stale or invalid")]
    StaleHandle,

    #[error("client already holds a socket")]
    InUse,

    #[error("connection to {0} failed")]
    ConnectFailed(String),

    #[error("could not resolve host {0}")]
    HostNotFound(String),

    #[error("command too long: {len} bytes")]
    CommandTooLong { len: usize },

    #[error("network interface not available")]
    NoNetwork,

    #[error(transparent)]
    Hw(#[from] HwError),
}

impl ShieldError {
    pub(crate) fn remote(code: u16, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = Errno::from_repr(code)
                .map(Errno::description)
                .unwrap_or("unknown error")
                .to_string();
        }
        Self::Remote { code, message }
    }

    /// Errno equivalent recorded as the shield's last error.
    pub fn errno(&self) -> u16 {
        match self {
            Self::NoShield => Errno::Perm.code(),
            Self::Timeout(_) => Errno::Time.code(),
            Self::Protocol(_) => Errno::Proto.code(),
            Self::Remote { code, .. } => *code,
            Self::SlotUnavailable => Errno::Busy.code(),
            Self::StaleHandle | Self::InUse => Errno::NotSock.code(),
            Self::ConnectFailed(_) => Errno::ConnRefused.code(),
            Self::HostNotFound(_) => Errno::NoEnt.code(),
            Self::CommandTooLong { .. } => Errno::MsgSize.code(),
            Self::NoNetwork => Errno::NoData.code(),
            Self::Hw(_) => Errno::Io.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShieldError>;
