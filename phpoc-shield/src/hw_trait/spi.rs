//! SPI hardware abstraction trait.

use async_trait::async_trait;
use std::fmt::Debug;

use super::{HwError, Result};

/// SPI bus abstraction.
///
/// The shield protocol is built from short full-duplex transactions. Each
/// call to [`Spi::transfer`] is one transaction: chip select is asserted
/// before the first byte and released after the last one.
#[async_trait]
pub trait Spi: Send {
    /// Clock out `write` while clocking in the same number of bytes into
    /// `read`. Both slices have the same length.
    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;
}

/// Adapter exposing an `embedded-hal` SPI device as an [`Spi`] bus.
///
/// `SpiDevice` implementations manage chip select themselves, so one
/// `transfer` call maps directly to one shield transaction. The call is
/// blocking; on a single-threaded executor this is what the hardware
/// does anyway.
pub struct EmbeddedHalSpi<D> {
    device: D,
}

impl<D> EmbeddedHalSpi<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    /// Give back the wrapped device.
    pub fn into_inner(self) -> D {
        self.device
    }
}

#[async_trait]
impl<D> Spi for EmbeddedHalSpi<D>
where
    D: embedded_hal::spi::SpiDevice<u8> + Send,
    D::Error: Debug,
{
    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        if write.len() != read.len() {
            return Err(HwError::InvalidParameter(format!(
                "transfer length mismatch: write {} read {}",
                write.len(),
                read.len()
            )));
        }
        self.device
            .transfer(read, write)
            .map_err(|e| HwError::Bus(format!("{:?}", e)))
    }
}
