//! Hardware abstraction layer traits.
//!
//! The shield driver only needs an SPI bus. The [`Spi`] trait lets the
//! driver run on top of any SPI implementation, whether a Linux spidev, an
//! `embedded-hal` device on a microcontroller, or a simulated shield in
//! tests.

pub mod spi;

pub use spi::{EmbeddedHalSpi, Spi};

/// Common error type for hardware operations
#[derive(Debug, thiserror::Error)]
pub enum HwError {
    /// Invalid parameter or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error reported by the SPI bus implementation
    #[error("SPI bus error: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, HwError>;
