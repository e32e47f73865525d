//! Engine configuration
//!
//! Everything the dispatcher reads once per iteration lives here. Timeouts are
//! kept in milliseconds so configuration files stay flat.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Smallest MTU that still fits an IPv6 header, a TCP header and one byte
const MIN_MTU: usize = 1280;

/// Relay engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mtu: usize,
    pub icmp_timeout_ms: u64,
    pub udp_timeout_ms: u64,
    pub udp_dns_timeout_ms: u64,
    pub tcp_connect_timeout_ms: u64,
    pub tcp_idle_timeout_ms: u64,
    pub tcp_close_timeout_ms: u64,
    pub tcp_linger_ms: u64,
    pub tcp_retransmit_ms: u64,
    pub tcp_recv_buffer: usize,
    pub sweep_interval_ms: u64,
    pub verify_checksums: bool,
    pub dns_resolver: Option<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 10000,
            icmp_timeout_ms: 5_000,
            udp_timeout_ms: 60_000,
            udp_dns_timeout_ms: 120_000,
            tcp_connect_timeout_ms: 20_000,
            tcp_idle_timeout_ms: 3_600_000,
            tcp_close_timeout_ms: 20_000,
            tcp_linger_ms: 2_000,
            tcp_retransmit_ms: 1_000,
            tcp_recv_buffer: 65535,
            sweep_interval_ms: 100,
            verify_checksums: true,
            dns_resolver: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > 65535 {
            return Err(EngineError::Config(format!(
                "mtu must be between {} and 65535, got {}",
                MIN_MTU, self.mtu
            )));
        }

        if self.tcp_recv_buffer == 0 || self.tcp_recv_buffer > 65535 {
            return Err(EngineError::Config(
                "tcp_recv_buffer must be between 1 and 65535 (no window scaling)".to_string(),
            ));
        }

        let timeouts = [
            ("icmp_timeout_ms", self.icmp_timeout_ms),
            ("udp_timeout_ms", self.udp_timeout_ms),
            ("udp_dns_timeout_ms", self.udp_dns_timeout_ms),
            ("tcp_connect_timeout_ms", self.tcp_connect_timeout_ms),
            ("tcp_idle_timeout_ms", self.tcp_idle_timeout_ms),
            ("tcp_close_timeout_ms", self.tcp_close_timeout_ms),
            ("tcp_retransmit_ms", self.tcp_retransmit_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(EngineError::Config(format!("{} cannot be zero", name)));
            }
        }

        if self.udp_dns_timeout_ms < self.udp_timeout_ms {
            return Err(EngineError::Config(format!(
                "udp_dns_timeout_ms ({}) cannot be shorter than udp_timeout_ms ({})",
                self.udp_dns_timeout_ms, self.udp_timeout_ms
            )));
        }

        Ok(())
    }

    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_millis(self.icmp_timeout_ms)
    }

    /// Idle timeout for a UDP flow to `dst_port`
    pub fn udp_timeout(&self, dst_port: u16) -> Duration {
        if dst_port == 53 {
            Duration::from_millis(self.udp_dns_timeout_ms)
        } else {
            Duration::from_millis(self.udp_timeout_ms)
        }
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_idle_timeout_ms)
    }

    pub fn tcp_close_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_close_timeout_ms)
    }

    pub fn tcp_linger(&self) -> Duration {
        Duration::from_millis(self.tcp_linger_ms)
    }

    pub fn tcp_retransmit(&self) -> Duration {
        Duration::from_millis(self.tcp_retransmit_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// MSS advertised to the virtual side for a given address family
    pub fn mss(&self, ip: IpAddr) -> u16 {
        let overhead = if ip.is_ipv4() { 40 } else { 60 };
        self.mtu.saturating_sub(overhead).clamp(536, u16::MAX as usize) as u16
    }
}

/// Log verbosity, numbered like Android log priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Assert,
}

impl LogLevel {
    /// Map an Android priority (2..=7); out-of-range values clamp
    pub fn from_priority(priority: i32) -> Self {
        match priority {
            i32::MIN..=2 => LogLevel::Verbose,
            3 => LogLevel::Debug,
            4 => LogLevel::Info,
            5 => LogLevel::Warn,
            6 => LogLevel::Error,
            _ => LogLevel::Assert,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            LogLevel::Verbose => 2,
            LogLevel::Debug => 3,
            LogLevel::Info => 4,
            LogLevel::Warn => 5,
            LogLevel::Error => 6,
            LogLevel::Assert => 7,
        }
    }

    pub fn level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Verbose => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Assert => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// SOCKS5 upstream relay target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRelay {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl UpstreamRelay {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Credentials are only offered when a non-empty username is set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), pass) if !user.is_empty() => Some((user.as_str(), pass.as_deref().unwrap_or(""))),
            _ => None,
        }
    }
}

/// Capture sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub path: PathBuf,
    #[serde(default = "default_record_size")]
    pub record_size: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_record_size() -> usize {
    64
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mss("10.0.0.1".parse().unwrap()), 9960);
        assert_eq!(config.mss("fd00::1".parse().unwrap()), 9940);
    }

    #[test]
    fn rejects_zero_timeouts_and_tiny_mtu() {
        let config = EngineConfig {
            udp_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            mtu: 576,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn dns_port_gets_its_own_timeout() {
        let config = EngineConfig::default();
        assert_eq!(config.udp_timeout(53), Duration::from_secs(120));
        assert_eq!(config.udp_timeout(443), Duration::from_secs(60));
        assert!(config.udp_timeout(53) > config.udp_timeout(5353));
    }

    #[test]
    fn dns_timeout_shorter_than_udp_timeout_is_rejected() {
        let config = EngineConfig {
            udp_timeout_ms: 30_000,
            udp_dns_timeout_ms: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_level_follows_android_priorities() {
        assert_eq!(LogLevel::from_priority(3), LogLevel::Debug);
        assert_eq!(LogLevel::from_priority(0), LogLevel::Verbose);
        assert_eq!(LogLevel::from_priority(42), LogLevel::Assert);
        assert_eq!(LogLevel::Warn.priority(), 5);
        assert_eq!(LogLevel::Info.level_filter(), LevelFilter::INFO);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: EngineConfig = serde_yaml::from_str("tcp_linger_ms: 50\nverify_checksums: false\n").unwrap();
        assert_eq!(config.tcp_linger_ms, 50);
        assert!(!config.verify_checksums);
        assert_eq!(config.mtu, 10000);
    }

    #[test]
    fn upstream_credentials_require_username() {
        let relay = UpstreamRelay::new("127.0.0.1".parse().unwrap(), 1080);
        assert!(relay.credentials().is_none());

        let relay = relay.with_credentials("", "secret");
        assert!(relay.credentials().is_none());

        let relay = UpstreamRelay::new("127.0.0.1".parse().unwrap(), 1080).with_credentials("alice", "pw");
        assert_eq!(relay.credentials(), Some(("alice", "pw")));
    }
}
