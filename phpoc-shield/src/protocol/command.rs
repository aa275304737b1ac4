//! Fixed-capacity command text builder.

use std::fmt;

use crate::error::{Result, ShieldError};

/// Longest command line the shield accepts.
pub const COMMAND_CAPACITY: usize = 63;

/// Stack-allocated command line.
///
/// Built with `write!` and handed to the engine by value. Text beyond
/// [`COMMAND_CAPACITY`] is not silently cut: the overflow is remembered and
/// [`CommandBuf::finish`] rejects the command.
#[derive(Clone)]
pub struct CommandBuf {
    buf: [u8; COMMAND_CAPACITY],
    len: usize,
    attempted: usize,
}

impl CommandBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; COMMAND_CAPACITY],
            len: 0,
            attempted: 0,
        }
    }

    pub fn from_args(args: fmt::Arguments<'_>) -> Self {
        let mut cmd = Self::new();
        // our Write impl never fails; overflow is tracked separately
        let _ = fmt::write(&mut cmd, args);
        cmd
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // only whole `&str` pieces are ever copied in
        std::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Validate the command, returning it ready to send.
    pub fn finish(self) -> Result<Self> {
        if self.attempted > COMMAND_CAPACITY {
            return Err(ShieldError::CommandTooLong {
                len: self.attempted,
            });
        }
        Ok(self)
    }
}

impl Default for CommandBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for CommandBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.attempted += s.len();
        if self.attempted <= COMMAND_CAPACITY {
            self.buf[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
        }
        Ok(())
    }
}

impl fmt::Debug for CommandBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for CommandBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a [`CommandBuf`] with `format!` syntax.
macro_rules! cmd {
    ($($arg:tt)*) => {
        $crate::protocol::CommandBuf::from_args(format_args!($($arg)*))
    };
}
pub(crate) use cmd;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats_command() {
        let cmd = CommandBuf::from_args(format_args!("tcp{} connect {} {}", 2, "10.0.0.1", 80));
        assert_eq!(cmd.as_str(), "tcp2 connect 10.0.0.1 80");
        assert!(cmd.finish().is_ok());
    }

    #[test]
    fn test_exact_capacity_is_accepted() {
        let text = "x".repeat(COMMAND_CAPACITY);
        let cmd = CommandBuf::from_args(format_args!("{}", text));
        assert_eq!(cmd.len(), COMMAND_CAPACITY);
        assert!(cmd.finish().is_ok());
    }

    #[test]
    fn test_overflow_rejected() {
        let host = "a".repeat(80);
        let cmd = CommandBuf::from_args(format_args!("dns query A {} 500", host));
        match cmd.finish() {
            Err(ShieldError::CommandTooLong { len }) => assert_eq!(len, 80 + 16),
            other => panic!("expected CommandTooLong, got {:?}", other.map(|c| c.to_string())),
        }
    }

    #[test]
    fn test_no_partial_piece_after_overflow() {
        let cmd = CommandBuf::from_args(format_args!("{}{}", "a".repeat(60), "bcdef"));
        assert_eq!(cmd.as_str(), "a".repeat(60));
    }
}
