//! Host-side driver for the PHPoC networking shield.
//!
//! The shield runs its own network stack and is driven over SPI with short
//! text commands. [`Shield`] brings the shield up and owns the bus; sockets
//! and application helpers borrow it for the duration of an operation.
//!
//! ```ignore
//! let mut shield = Shield::new(spi, ShieldConfig::default());
//! shield.begin().await?;
//!
//! let mut client = Client::new(&mut shield);
//! client.connect("example.com", 80).await?;
//! client.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! ```

pub mod app;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hw_trait;
pub mod net;
pub mod poll;
pub mod protocol;
pub mod shield;
pub mod socket;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod sim;

pub use app::{DateTime, Email};
pub use cache::{SlotHandle, SlotId};
pub use config::{ProtocolChoice, ShieldConfig};
pub use error::{Errno, Result, ShieldError};
pub use hw_trait::{EmbeddedHalSpi, Spi};
pub use protocol::Generation;
pub use shield::{Interface, Shield, ShieldFlags};
pub use socket::{Client, ConnectionState, Server, ServerApi};
