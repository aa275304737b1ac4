//! Network information, name resolution and the shield's own log.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::protocol::{cmd, Generation};
use crate::shield::{Shield, ShieldFlags};
use crate::tracing::prelude::*;

/// Bytes fetched per log read.
const LOG_CHUNK: usize = 32;

/// Target of events carrying the shield's log output.
pub const REMOTE_LOG_TARGET: &str = "phpoc_shield::remote";

impl<S: Spi> Shield<S> {
    pub(crate) async fn query_ipv4(&mut self, key: &str) -> Result<Option<Ipv4Addr>> {
        let cmd = self.get_cmd(self.engine.codec().net_device(), key);
        self.engine.query_ipv4(cmd).await
    }

    pub(crate) async fn query_ipv6(&mut self, key: &str) -> Result<Option<Ipv6Addr>> {
        let cmd = self.get_cmd(self.engine.codec().net_device(), key);
        self.engine.query_ipv6(cmd).await
    }

    pub async fn local_ip(&mut self) -> Result<Option<Ipv4Addr>> {
        self.query_ipv4("ipaddr").await
    }

    pub async fn subnet_mask(&mut self) -> Result<Option<Ipv4Addr>> {
        self.query_ipv4("netmask").await
    }

    pub async fn gateway_ip(&mut self) -> Result<Option<Ipv4Addr>> {
        self.query_ipv4("gwaddr").await
    }

    pub async fn dns_server_ip(&mut self) -> Result<Option<Ipv4Addr>> {
        self.query_ipv4("nsaddr").await
    }

    /// Link-local IPv6 address. `None` until IPv6 is up.
    pub async fn local_ip6(&mut self) -> Result<Option<Ipv6Addr>> {
        if !self.flags().contains(ShieldFlags::IP6) {
            return Ok(None);
        }
        self.query_ipv6("ipaddr6 0").await
    }

    pub async fn global_ip6(&mut self) -> Result<Option<Ipv6Addr>> {
        if !self.flags().contains(ShieldFlags::IP6) {
            return Ok(None);
        }
        self.query_ipv6("ipaddr6 1").await
    }

    pub async fn gateway_ip6(&mut self) -> Result<Option<Ipv6Addr>> {
        if !self.flags().contains(ShieldFlags::IP6) {
            return Ok(None);
        }
        self.query_ipv6("gwaddr6").await
    }

    pub async fn dns_server_ip6(&mut self) -> Result<Option<Ipv6Addr>> {
        if !self.flags().contains(ShieldFlags::IP6) {
            return Ok(None);
        }
        self.query_ipv6("nsaddr6").await
    }

    /// Prefix length of the global IPv6 address, 0 without IPv6.
    pub async fn global_prefix6(&mut self) -> Result<u32> {
        if !self.flags().contains(ShieldFlags::IP6) {
            return Ok(0);
        }
        let cmd = self.get_cmd(self.engine.codec().net_device(), "prefix6");
        self.engine.query_int(cmd).await
    }

    /// Resolve an A record, letting the shield spend up to `wait` on it.
    pub async fn host_by_name(&mut self, host: &str, wait: Duration) -> Result<Option<Ipv4Addr>> {
        let cmd = cmd!("dns query A {} {}", host, wait.as_millis());
        let addr = self.engine.query_ipv4(cmd).await?;
        debug!(host, ?addr, "DNS A query");
        Ok(addr)
    }

    pub async fn host_by_name6(&mut self, host: &str, wait: Duration) -> Result<Option<Ipv6Addr>> {
        let cmd = cmd!("dns query AAAA {} {}", host, wait.as_millis());
        let addr = self.engine.query_ipv6(cmd).await?;
        debug!(host, ?addr, "DNS AAAA query");
        Ok(addr)
    }

    /// Resolve `host` the way clients do: a literal address as is, else a
    /// short DNS query and one longer retry. AAAA when IPv6 is up.
    pub async fn resolve(&mut self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let ipv6 = self.flags().contains(ShieldFlags::IP6);
        for wait in self.config.dns_timeouts {
            let addr = if ipv6 {
                self.host_by_name6(host, wait).await?.map(IpAddr::V6)
            } else {
                self.host_by_name(host, wait).await?.map(IpAddr::V4)
            };
            if let Some(addr) = addr {
                return Ok(addr);
            }
        }
        Err(ShieldError::HostNotFound(host.to_string()))
    }

    /// Move the shield's log buffer `id` into tracing, one event per line.
    /// Returns the number of bytes drained.
    pub async fn drain_remote_log(&mut self, id: u8) -> Result<usize> {
        let device = self.engine.codec().log_device();
        let mut log = Vec::new();
        let mut chunk = [0u8; LOG_CHUNK];
        loop {
            let len = self.engine.command(cmd!("{}{} read {}", device, id, LOG_CHUNK)).await?;
            if len == 0 {
                break;
            }
            let n = self.engine.read(&mut chunk[..len.min(LOG_CHUNK)]).await?;
            if n == 0 {
                break;
            }
            log.extend_from_slice(&chunk[..n]);
        }

        for line in String::from_utf8_lossy(&log).lines() {
            let line = line.trim_end();
            if !line.is_empty() {
                info!(target: REMOTE_LOG_TARGET, log = id, "{}", line);
            }
        }
        Ok(log.len())
    }

    /// Drop the contents of log buffer `id`.
    pub async fn flush_remote_log(&mut self, id: u8) -> Result<()> {
        match self.generation() {
            Generation::V1 => {
                let device = self.engine.codec().log_device();
                self.engine.command(cmd!("{}{} flush", device, id)).await?;
            }
            Generation::V2 => {
                let dropped = self.drain_silently(id).await?;
                trace!(log = id, dropped, "Flushed shield log");
            }
        }
        Ok(())
    }

    async fn drain_silently(&mut self, id: u8) -> Result<usize> {
        let device = self.engine.codec().log_device();
        let mut chunk = [0u8; LOG_CHUNK];
        let mut total = 0;
        loop {
            let len = self.engine.command(cmd!("{}{} read {}", device, id, LOG_CHUNK)).await?;
            if len == 0 {
                return Ok(total);
            }
            let n = self.engine.read(&mut chunk[..len.min(LOG_CHUNK)]).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShieldConfig;
    use crate::sim::{SimHandle, SimReply, SimShield};

    async fn up(sim: (SimShield, SimHandle), ipv6: bool) -> (Shield<SimShield>, SimHandle) {
        let (sim, handle) = sim;
        let config = ShieldConfig {
            ipv6,
            ..Default::default()
        };
        let mut shield = Shield::new(sim, config);
        shield.begin().await.unwrap();
        handle.clear_commands();
        (shield, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv4_addresses() {
        let (mut shield, handle) = up(SimShield::v1(), false).await;
        assert_eq!(shield.local_ip().await.unwrap(), Some(Ipv4Addr::new(192, 168, 0, 10)));
        assert_eq!(shield.subnet_mask().await.unwrap(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(shield.gateway_ip().await.unwrap(), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(shield.dns_server_ip().await.unwrap(), Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(handle.commands()[0], "net0 get ipaddr");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv6_addresses_need_ipv6() {
        let (mut shield, handle) = up(SimShield::v2(), false).await;
        assert_eq!(shield.global_ip6().await.unwrap(), None);
        assert_eq!(shield.global_prefix6().await.unwrap(), 0);
        assert!(handle.commands().is_empty());

        let (mut shield, handle) = up(SimShield::v2(), true).await;
        assert_eq!(shield.local_ip6().await.unwrap(), Some("fe80::1".parse().unwrap()));
        assert_eq!(shield.global_ip6().await.unwrap(), Some("2001:db8::10".parse().unwrap()));
        assert_eq!(shield.gateway_ip6().await.unwrap(), Some("fe80::fe".parse().unwrap()));
        assert_eq!(
            shield.dns_server_ip6().await.unwrap(),
            Some("2001:4860:4860::8888".parse().unwrap())
        );
        assert_eq!(shield.global_prefix6().await.unwrap(), 64);
        assert_eq!(handle.commands()[0], "net ioctl get ipaddr6 0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_address_is_none() {
        let (mut shield, handle) = up(SimShield::v1(), false).await;
        handle.set_value("net0 get gwaddr", SimReply::Data(b"0.0.0.0".to_vec()));
        assert_eq!(shield.gateway_ip().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_lookup() {
        let (mut shield, handle) = up(SimShield::v1(), false).await;
        let addr = shield.host_by_name("example.com", Duration::from_millis(500)).await.unwrap();
        assert_eq!(addr, Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(handle.commands(), vec!["dns query A example.com 500"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_retries_once_then_fails() {
        let (mut shield, handle) = up(SimShield::v2(), false).await;
        let err = shield.resolve("nowhere.invalid").await.unwrap_err();
        assert!(matches!(err, ShieldError::HostNotFound(_)));
        assert_eq!(
            handle.commands(),
            vec!["dns query A nowhere.invalid 500", "dns query A nowhere.invalid 2000"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_literal_skips_dns() {
        let (mut shield, handle) = up(SimShield::v1(), false).await;
        let ip = shield.resolve("203.0.113.5").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        assert!(handle.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_uses_aaaa_with_ipv6() {
        let (mut shield, handle) = up(SimShield::v1(), true).await;
        handle.add_dns("example.com", "2606:2800:220:1::1");
        let ip = shield.resolve("example.com").await.unwrap();
        assert_eq!(ip, "2606:2800:220:1::1".parse::<IpAddr>().unwrap());
        assert_eq!(handle.count_commands("dns query AAAA"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_remote_log() {
        let (mut shield, handle) = up(SimShield::v1(), false).await;
        let text = b"boot ok\r\nwifi scanning for access points\r\nlink up\r\n";
        handle.push_log(0, text);

        let drained = shield.drain_remote_log(0).await.unwrap();
        assert_eq!(drained, text.len());
        // 51 bytes in 32-byte reads, then an empty read
        assert_eq!(handle.count_commands("sys log0 read 32"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_remote_log() {
        let (mut shield, handle) = up(SimShield::v2(), false).await;
        handle.push_log(1, b"stale output");
        shield.flush_remote_log(1).await.unwrap();
        assert_eq!(shield.drain_remote_log(1).await.unwrap(), 0);

        let (mut shield, handle) = up(SimShield::v1(), false).await;
        shield.flush_remote_log(2).await.unwrap();
        assert_eq!(handle.commands(), vec!["sys log2 flush"]);
    }
}
