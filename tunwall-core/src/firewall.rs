//! Control surface of the relay engine
//!
//! A `Firewall` is shared between the thread blocked in [`Firewall::run`] and
//! any number of control threads. Everything except `run` returns promptly.

use crate::capture::PcapWriter;
use crate::config::{CaptureConfig, EngineConfig, LogLevel, UpstreamRelay};
use crate::dispatcher::{self, Shared};
use crate::engine::{self, RunParams};
use crate::error::{EngineError, Result};
use crate::host::HostBridge;
use crate::session::{Protocol, SessionInfo};
use crate::stats::{CounterSnapshot, SessionStats};
use crate::sys;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Firewall {
    shared: Shared,
    platform_version: i32,
    running: AtomicBool,
}

impl Firewall {
    /// Create an engine with the default configuration
    pub fn init(platform_version: i32) -> Self {
        Self::build(platform_version, EngineConfig::default())
    }

    pub fn with_config(platform_version: i32, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(platform_version, config))
    }

    fn build(platform_version: i32, config: EngineConfig) -> Self {
        if let Err(e) = sys::raise_fd_limit() {
            warn!("Could not raise the descriptor limit: {}", e);
        }
        info!("=== Firewall initialized (platform version {}) ===", platform_version);
        Self {
            shared: Shared::new(config),
            platform_version,
            running: AtomicBool::new(false),
        }
    }

    pub fn platform_version(&self) -> i32 {
        self.platform_version
    }

    /// Set verbosity and arm the engine for a run
    pub fn start(&self, log_level: LogLevel) {
        self.shared.state.lock().log_level = log_level;
        self.shared.stopping.store(false, Ordering::Release);
        info!("=== Firewall started (log level {}) ===", log_level);
    }

    /// Relay traffic on `fd` until [`stop`](Self::stop) is called.
    ///
    /// Fatal failures are also reported through `host.report_error`.
    pub fn run(&self, fd: RawFd, dns_forward: bool, forced_rcode: u8, host: &mut dyn HostBridge) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Internal("already running".to_string()));
        }

        let result = sys::check_fd_limit().and_then(|()| {
            let params = RunParams {
                platform_version: self.platform_version,
                dns_forward,
                forced_rcode,
            };
            dispatcher::run(&self.shared, fd, params, host)
        });

        self.running.store(false, Ordering::Release);
        if let Err(e) = &result {
            error!("Run failed: {}", e);
            host.report_error(e.code(), &e.to_string());
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the dispatcher to exit; returns immediately
    pub fn stop(&self) {
        info!("=== Firewall stop requested ===");
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake();
    }

    /// Tear down every session without stopping the dispatcher
    pub fn clear(&self) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let sessions = state.table.clear_all();
        let count = sessions.len();

        match state.registry.as_ref() {
            Some(registry) => {
                for session in sessions {
                    if let Some(usage) = engine::close_session(registry, &self.shared.stats, session) {
                        state.pending_usage.push(usage);
                    }
                }
            }
            None => drop(sessions),
        }
        drop(guard);

        self.shared.wake();
        info!("Cleared {} sessions", count);
    }

    /// Final teardown: stop, drop every session and close the capture file
    pub fn done(&self) {
        self.stop();
        self.clear();
        if let Some(writer) = self.shared.state.lock().capture.take() {
            if let Err(e) = writer.close() {
                warn!("Closing capture failed: {}", e);
            }
        }
        info!("=== Firewall done ===");
    }

    pub fn query_stats(&self) -> SessionStats {
        let (icmp_count, udp_count, tcp_count) = {
            let state = self.shared.state.lock();
            (
                state.table.count_live(Protocol::Icmp),
                state.table.count_live(Protocol::Udp),
                state.table.count_live(Protocol::Tcp),
            )
        };
        SessionStats {
            icmp_count,
            udp_count,
            tcp_count,
            open_fds: sys::open_fd_count(),
            fd_limit: sys::fd_limit(),
        }
    }

    /// Replace the capture sink; `None` flushes and closes the current file
    pub fn configure_capture(&self, capture: Option<CaptureConfig>) -> Result<()> {
        let writer = capture.as_ref().map(PcapWriter::open).transpose()?;
        let previous = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.capture, writer)
        };
        if let Some(previous) = previous {
            debug!("Closing capture {}", previous.path().display());
            previous.close()?;
        }
        if capture.is_none() {
            info!("Capture disabled");
        }
        Ok(())
    }

    /// Route new TCP sessions through a SOCKS5 proxy, or directly with `None`
    pub fn configure_upstream_relay(&self, upstream: Option<UpstreamRelay>) {
        match &upstream {
            Some(relay) => info!(
                "SOCKS5 upstream {} ({})",
                relay.socket_addr(),
                if relay.credentials().is_some() { "with credentials" } else { "no auth" }
            ),
            None => info!("SOCKS5 upstream disabled"),
        }
        self.shared.state.lock().upstream = upstream;
    }

    /// Replace the engine configuration; takes effect on the next iteration
    pub fn configure(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        self.shared.state.lock().config = config;
        Ok(())
    }

    pub fn config(&self) -> EngineConfig {
        self.shared.state.lock().config.clone()
    }

    pub fn log_level(&self) -> LogLevel {
        self.shared.state.lock().log_level
    }

    pub fn mtu(&self) -> usize {
        self.shared.state.lock().config.mtu
    }

    /// Snapshot of all sessions, ordered by id
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let state = self.shared.state.lock();
        let mut sessions = Vec::with_capacity(state.table.len());
        state.table.for_each(|session| sessions.push(session.info(now)));
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    pub fn stats(&self) -> CounterSnapshot {
        self.shared.stats.snapshot()
    }
}

/// True when `text` is a literal IPv4 or IPv6 address
pub fn is_numeric_address(text: &str) -> bool {
    text.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_addresses() {
        assert!(is_numeric_address("10.1.2.3"));
        assert!(is_numeric_address("2001:db8::1"));
        assert!(!is_numeric_address("example.com"));
        assert!(!is_numeric_address("10.1.2"));
        assert!(!is_numeric_address(""));
    }

    #[test]
    fn idle_engine_reports_empty_stats() {
        let firewall = Firewall::init(29);
        let stats = firewall.query_stats();
        assert_eq!((stats.icmp_count, stats.udp_count, stats.tcp_count), (0, 0, 0));
        assert!(stats.open_fds > 0);
        assert!(stats.fd_limit >= stats.open_fds);
        assert_eq!(firewall.mtu(), 10000);
        assert!(firewall.sessions().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            mtu: 100,
            ..Default::default()
        };
        assert!(Firewall::with_config(29, config).is_err());

        let firewall = Firewall::init(29);
        assert!(firewall.configure(EngineConfig { sweep_interval_ms: 0, ..Default::default() }).is_err());
        assert_eq!(firewall.config(), EngineConfig::default());
    }

    #[test]
    fn start_sets_log_level_and_upstream_is_replaceable() {
        let firewall = Firewall::init(29);
        firewall.start(LogLevel::Debug);
        assert_eq!(firewall.log_level(), LogLevel::Debug);

        firewall.configure_upstream_relay(Some(UpstreamRelay::new("127.0.0.1".parse().unwrap(), 1080)));
        firewall.configure_upstream_relay(None);
        firewall.clear();
        firewall.done();
        assert!(!firewall.is_running());
    }

    #[test]
    fn capture_can_be_swapped_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let firewall = Firewall::init(29);
        let first = CaptureConfig {
            path: dir.path().join("a.pcap"),
            record_size: 64,
            max_file_size: 1024,
        };
        firewall.configure_capture(Some(first.clone())).unwrap();
        firewall
            .configure_capture(Some(CaptureConfig {
                path: dir.path().join("b.pcap"),
                ..first.clone()
            }))
            .unwrap();
        firewall.configure_capture(None).unwrap();

        assert_eq!(std::fs::metadata(&first.path).unwrap().len(), 24);
        assert_eq!(std::fs::metadata(dir.path().join("b.pcap")).unwrap().len(), 24);
    }
}
