//! The shield as a whole: bring-up and raw command access.

use std::time::Duration;

use bitflags::bitflags;

use crate::cache::{SlotId, SlotTable};
use crate::config::{ProtocolChoice, ShieldConfig};
use crate::engine::CommandEngine;
use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::poll::Backoff;
use crate::protocol::{cmd, CommandBuf, Generation, ProtocolCodec, V1Codec, V2Codec};
use crate::socket::ConnectionState;
use crate::tracing::prelude::*;

/// Interval between resync attempts while the shield boots.
const BOOT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Longest interface mode string kept.
const MODE_LEN: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShieldFlags: u8 {
        /// Channel synced at least once.
        const SHIELD = 0x01;
        const IP4 = 0x02;
        const IP6 = 0x04;
    }
}

/// Which network interface the shield uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Ethernet,
    Wifi,
}

impl Interface {
    fn id(self) -> u8 {
        match self {
            Interface::Ethernet => 0,
            Interface::Wifi => 1,
        }
    }
}

/// Driver for one shield on one SPI bus.
pub struct Shield<S: Spi> {
    pub(crate) engine: CommandEngine<S>,
    pub(crate) slots: SlotTable,
    pub(crate) config: ShieldConfig,
    flags: ShieldFlags,
    interface: Option<Interface>,
    package_version: u32,
}

fn codec_for(generation: Generation) -> Box<dyn ProtocolCodec> {
    match generation {
        Generation::V1 => Box::new(V1Codec),
        Generation::V2 => Box::new(V2Codec),
    }
}

impl<S: Spi> Shield<S> {
    pub fn new(spi: S, config: ShieldConfig) -> Self {
        let generation = match config.protocol {
            ProtocolChoice::V1 => Generation::V1,
            ProtocolChoice::Auto | ProtocolChoice::V2 => Generation::V2,
        };
        let mut engine = CommandEngine::new(spi, codec_for(generation));
        engine.set_response_wait(config.response_wait);
        Self {
            engine,
            slots: SlotTable::new(&config),
            config,
            flags: ShieldFlags::empty(),
            interface: None,
            package_version: 0,
        }
    }

    /// Bring the shield up: sync the channel, find the network interface,
    /// wait for link and an IPv4 address and close any socket left over
    /// from before a host reset.
    pub async fn begin(&mut self) -> Result<()> {
        self.flags = ShieldFlags::empty();
        let generation = self.negotiate().await?;
        self.flags |= ShieldFlags::SHIELD;

        if generation == Generation::V2 {
            self.package_version = self.engine.query_int(cmd!("sys pkg ver")).await?;
            if self.package_version == 0 {
                warn!("Shield reports no firmware package");
                return Err(ShieldError::NoShield);
            }
            info!(
                package = %format_package(self.package_version),
                "Shield firmware package"
            );
        }

        let interface = self.detect_interface().await?;
        self.interface = Some(interface);
        self.wait_for_link(interface).await?;

        for id in SlotId::all() {
            self.engine.command(cmd!("tcp{} close", id)).await?;
            self.reset_slot(id, ConnectionState::Closed);
        }

        if generation == Generation::V2 {
            // clear any outgoing mail server left configured
            self.engine.command(cmd!("php smtp server")).await?;
        }

        self.begin_ip4().await?;

        if self.config.ipv6 {
            if let Err(e) = self.begin_ip6().await {
                warn!(error = %e, "IPv6 not available");
            }
        }
        Ok(())
    }

    /// Find a generation the shield answers to.
    async fn negotiate(&mut self) -> Result<Generation> {
        let candidates: &[Generation] = match self.config.protocol {
            ProtocolChoice::Auto => &[Generation::V2, Generation::V1],
            ProtocolChoice::V1 => &[Generation::V1],
            ProtocolChoice::V2 => &[Generation::V2],
        };
        self.engine.set_present(true);

        for &generation in candidates {
            if self.engine.generation() != generation {
                self.engine.set_codec(codec_for(generation));
            }
            if self.wait_for_sync().await? {
                info!(%generation, "Shield channel synced");
                return Ok(generation);
            }
            debug!(%generation, "Shield does not answer");
        }

        self.engine.set_present(false);
        warn!("No shield found on SPI bus");
        Err(ShieldError::NoShield)
    }

    async fn wait_for_sync(&mut self) -> Result<bool> {
        let mut retry = Backoff::fixed(BOOT_RETRY_INTERVAL, Some(self.config.boot_wait));
        loop {
            if self.engine.resync().await?.is_usable() {
                return Ok(true);
            }
            if !retry.wait().await {
                return Ok(false);
            }
        }
    }

    async fn detect_interface(&mut self) -> Result<Interface> {
        let verb = self.engine.codec().get_verb();
        for interface in [Interface::Wifi, Interface::Ethernet] {
            let mode = self
                .engine
                .query_string(cmd!("net{} {} mode", interface.id(), verb), MODE_LEN)
                .await?;
            if !mode.is_empty() {
                info!(?interface, %mode, "Network interface");
                return Ok(interface);
            }
        }
        warn!("Neither WiFi dongle nor Ethernet present");
        Err(ShieldError::NoNetwork)
    }

    async fn wait_for_link(&mut self, interface: Interface) -> Result<()> {
        let verb = self.engine.codec().get_verb();
        for attempt in 0..self.config.bringup_attempts {
            let speed = self
                .engine
                .query_int(cmd!("net{} {} speed", interface.id(), verb))
                .await?;
            if speed > 0 {
                debug!(speed, "Link up");
                return Ok(());
            }
            if attempt == 0 {
                info!("Waiting for link");
            }
            tokio::time::sleep(self.config.bringup_interval).await;
        }
        warn!(?interface, "Link did not come up");
        Err(ShieldError::NoNetwork)
    }

    async fn begin_ip4(&mut self) -> Result<()> {
        for attempt in 0..self.config.bringup_attempts {
            if let Some(ip) = self.query_ipv4("ipaddr").await? {
                self.flags |= ShieldFlags::IP4;
                let netmask = self.subnet_mask().await?;
                let gateway = self.gateway_ip().await?;
                let dns = self.dns_server_ip().await?;
                info!(%ip, ?netmask, ?gateway, ?dns, "IPv4 address");
                return Ok(());
            }
            if attempt == 0 {
                info!("Acquiring IPv4 address");
            }
            tokio::time::sleep(self.config.bringup_interval).await;
        }
        warn!("No IPv4 address");
        Err(ShieldError::NoNetwork)
    }

    /// Enable IPv6 once a link-local address exists, then wait for a global
    /// address.
    pub async fn begin_ip6(&mut self) -> Result<()> {
        if self.query_ipv6("ipaddr6 0").await?.is_none() {
            info!("IPv6 not enabled on shield");
            return Err(ShieldError::NoNetwork);
        }
        self.flags |= ShieldFlags::IP6;

        for attempt in 0..self.config.bringup_attempts {
            if let Some(global) = self.global_ip6().await? {
                let prefix = self.global_prefix6().await?;
                let gateway = self.gateway_ip6().await?;
                info!(%global, prefix, ?gateway, "IPv6 address");
                return Ok(());
            }
            if attempt == 0 {
                info!("Acquiring global IPv6 address");
            }
            tokio::time::sleep(self.config.bringup_interval).await;
        }
        warn!("No global IPv6 address");
        Err(ShieldError::NoNetwork)
    }

    pub fn flags(&self) -> ShieldFlags {
        self.flags
    }

    pub fn generation(&self) -> Generation {
        self.engine.generation()
    }

    pub fn interface(&self) -> Option<Interface> {
        self.interface
    }

    /// Firmware package version as `major * 10000 + minor * 100 + patch`.
    /// Zero on first-generation shields.
    pub fn package_version(&self) -> u32 {
        self.package_version
    }

    pub fn config(&self) -> &ShieldConfig {
        &self.config
    }

    /// Errno of the most recent failed request, 0 after a success.
    pub fn last_errno(&self) -> u16 {
        self.engine.last_errno()
    }

    /// Override the response deadline; `None` restores the generation's
    /// default.
    pub fn set_response_wait(&mut self, wait: Option<Duration>) {
        self.engine.set_response_wait(wait);
    }

    /// Send a raw command line. Returns the response length, or the value
    /// itself on generations with inline values.
    pub async fn command(&mut self, line: &str) -> Result<usize> {
        self.engine.command(cmd!("{}", line)).await
    }

    pub async fn command_with_data(&mut self, line: &str, data: &[u8]) -> Result<usize> {
        self.engine.command_with_data(cmd!("{}", line), &[data]).await
    }

    /// Read the payload of the last response.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.engine.read(buf).await
    }

    pub async fn read_string(&mut self, line: &str, max: usize) -> Result<String> {
        self.engine.query_string(cmd!("{}", line), max).await
    }

    pub async fn read_int(&mut self, line: &str) -> Result<u32> {
        self.engine.query_int(cmd!("{}", line)).await
    }

    /// Send a data frame.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.engine.write(data).await
    }

    pub(crate) fn get_cmd(&self, device: &str, key: &str) -> CommandBuf {
        cmd!("{} {} {}", device, self.engine.codec().get_verb(), key)
    }
}

fn format_package(version: u32) -> String {
    format!("{}.{}.{}", version / 10000, (version % 10000) / 100, version % 100)
}
