//! SPI transport to the shield.
//!
//! Every exchange with the shield is a single chip-select window that starts
//! with a 16-bit request word. The shield answers with a 16-bit word in the
//! next two byte times; bulk reads and writes continue the same window with
//! their payload.
//!
//! ```text
//! MOSI: REQ_HI REQ_LO  --     --    [payload out]
//! MISO:  --     --    RSP_HI RSP_LO [payload in ]
//! ```

pub mod frame;
pub mod resync;

pub use frame::{ApiHeader, FrameKind, StatusFlags};
pub use resync::{Resync, SyncState};

use crate::hw_trait::{Result, Spi};
use crate::tracing::prelude::*;

/// Bytes taken by the request and response words.
pub const WORD_PHASE_LEN: usize = 4;

/// Raw request/response exchanges over one SPI bus.
pub struct SpiChannel<S: Spi> {
    spi: S,
    scratch: Vec<u8>,
}

impl<S: Spi> SpiChannel<S> {
    pub fn new(spi: S) -> Self {
        Self {
            spi,
            scratch: Vec::new(),
        }
    }

    pub fn spi_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    /// Send a request word and return the shield's response word.
    pub async fn exchange(&mut self, request: u16) -> Result<u16> {
        let req = request.to_be_bytes();
        let mut resp = [0u8; WORD_PHASE_LEN];
        self.spi
            .transfer(&[req[0], req[1], 0, 0], &mut resp)
            .await?;
        let word = u16::from_be_bytes([resp[2], resp[3]]);
        trace!("spi {:#06x} -> {:#06x}", request, word);
        Ok(word)
    }

    /// Read `len` payload bytes following `request`.
    ///
    /// With no destination the bytes are clocked in and dropped, which is
    /// how stale data is discarded.
    pub async fn bulk_read(&mut self, request: u16, len: usize, dest: Option<&mut [u8]>) -> Result<()> {
        let total = WORD_PHASE_LEN + len;
        let mut out = vec![0u8; total];
        out[..2].copy_from_slice(&request.to_be_bytes());
        self.scratch.clear();
        self.scratch.resize(total, 0);
        self.spi.transfer(&out, &mut self.scratch).await?;
        if let Some(dest) = dest {
            let n = len.min(dest.len());
            dest[..n].copy_from_slice(&self.scratch[WORD_PHASE_LEN..WORD_PHASE_LEN + n]);
        }
        trace!(len, "spi read {:#06x}", request);
        Ok(())
    }

    /// Write `data` following `request`.
    pub async fn bulk_write(&mut self, request: u16, data: &[u8]) -> Result<()> {
        let total = WORD_PHASE_LEN + data.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&request.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(data);
        self.scratch.clear();
        self.scratch.resize(total, 0);
        self.spi.transfer(&out, &mut self.scratch).await?;
        trace!(len = data.len(), "spi write {:#06x}", request);
        Ok(())
    }
}
