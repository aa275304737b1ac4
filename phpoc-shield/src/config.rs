//! Driver configuration.
//!
//! Defaults match the shield firmware's expectations. Deployments can
//! override the commonly tuned values through environment variables.

use std::time::Duration;

use crate::cache::{DEFAULT_READ_CACHE, DEFAULT_WRITE_CACHE};

/// Which protocol generation to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolChoice {
    /// Try the second generation first, then fall back to the first.
    #[default]
    Auto,
    V1,
    V2,
}

impl std::str::FromStr for ProtocolChoice {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShieldConfig {
    pub protocol: ProtocolChoice,

    /// Response deadline. `None` uses the generation's default (200 ms for
    /// the first generation, 1 s for the second).
    pub response_wait: Option<Duration>,

    /// How long to keep retrying resync while the shield boots.
    pub boot_wait: Duration,

    pub read_cache_size: usize,
    pub write_cache_size: usize,

    /// Period of the receivable-length refresh timer.
    pub rxlen_refresh: Duration,
    /// Period of the connection-state refresh timer.
    pub state_refresh: Duration,
    /// Delay before a partially filled write cache is flushed.
    pub write_flush: Duration,

    /// Interval between state polls while connecting or closing.
    pub state_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    /// Interval between pending-transmit polls in `flush()`.
    pub drain_poll_interval: Duration,

    /// DNS query timeouts, first attempt then retry.
    pub dns_timeouts: [Duration; 2],

    /// Attempts made while waiting for link and address during bring-up,
    /// one second apart.
    pub bringup_attempts: u32,
    pub bringup_interval: Duration,

    /// Bring up IPv6 after IPv4 during `begin`.
    pub ipv6: bool,

    pub smtp_timeout: Duration,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolChoice::Auto,
            response_wait: None,
            boot_wait: Duration::from_millis(500),
            read_cache_size: DEFAULT_READ_CACHE,
            write_cache_size: DEFAULT_WRITE_CACHE,
            rxlen_refresh: Duration::from_millis(50),
            state_refresh: Duration::from_millis(100),
            write_flush: Duration::from_millis(50),
            state_poll_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(10),
            dns_timeouts: [Duration::from_millis(500), Duration::from_millis(2000)],
            bringup_attempts: 10,
            bringup_interval: Duration::from_secs(1),
            ipv6: false,
            smtp_timeout: Duration::from_secs(60),
        }
    }
}

/// Smallest caches that still let the line reader see a CRLF pair.
const MIN_CACHE: usize = 2;
const MAX_CACHE: usize = 1024;

impl ShieldConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PHPOC_PROTOCOL`: `auto`, `v1` or `v2` (default: auto)
    /// - `PHPOC_SPI_WAIT_MS`: response deadline in milliseconds
    /// - `PHPOC_CONNECT_TIMEOUT_MS`: connect deadline (default: 30000)
    /// - `PHPOC_READ_CACHE`: read cache bytes per socket (default: 18, clamped to 2-1024)
    /// - `PHPOC_WRITE_CACHE`: write cache bytes per socket (default: 16, clamped to 2-1024)
    /// - `PHPOC_IPV6`: `1` or `true` to bring up IPv6 during `begin`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(protocol) = env_parse::<ProtocolChoice>("PHPOC_PROTOCOL") {
            config.protocol = protocol;
        }
        if let Some(ms) = env_parse::<u64>("PHPOC_SPI_WAIT_MS") {
            config.response_wait = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("PHPOC_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("PHPOC_READ_CACHE") {
            config.read_cache_size = size.clamp(MIN_CACHE, MAX_CACHE);
        }
        if let Some(size) = env_parse::<usize>("PHPOC_WRITE_CACHE") {
            config.write_cache_size = size.clamp(MIN_CACHE, MAX_CACHE);
        }
        if let Ok(value) = std::env::var("PHPOC_IPV6") {
            config.ipv6 = matches!(value.trim(), "1" | "true" | "yes");
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
